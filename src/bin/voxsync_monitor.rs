//! Live sentiment monitor
//!
//! Connects to the sentiment stream, asks for the full map once connected
//! and logs every change until interrupted. With `--replay-queue` it first
//! flushes any writes a previous session left in the offline queue.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;

use voxsync::channel::websocket::WebSocketConnector;
use voxsync::queue::{HttpClient, ReplayOutcome};
use voxsync::sync::StoreChange;
use voxsync::{ClientConfig, LocalStore, OfflineWriteQueue, StreamSyncManager};

#[derive(Parser, Debug)]
#[command(name = "voxsync_monitor", about = "Follow a live sentiment stream", version)]
struct Args {
    /// JSON config file; missing files fall back to defaults
    #[arg(long, default_value = "voxsync.json")]
    config: PathBuf,

    /// Override the stream URL
    #[arg(long)]
    url: Option<String>,

    /// Auth token appended to the stream URL
    #[arg(long)]
    token: Option<String>,

    /// Replay the persisted offline queue before streaming
    #[arg(long)]
    replay_queue: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = ClientConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.apply_env_overrides();
    if let Some(url) = args.url {
        config.stream.url = url;
    }
    if let Some(token) = args.token {
        config.stream.auth_token = Some(token);
    }
    config.validate()?;

    if args.replay_queue {
        replay_queue(&config).await?;
    }

    let manager = StreamSyncManager::new(&config.stream, Arc::new(WebSocketConnector::new()))?;
    let mut changes = manager.store().subscribe();
    let mut status = manager.subscribe_status();
    manager.connect();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, closing stream");
                manager.close();
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if current.is_connected() {
                    manager.request_full_state();
                }
                if current.is_failed() {
                    log::error!(
                        "Giving up: {}",
                        current.last_error.as_deref().unwrap_or("unknown error")
                    );
                    break;
                }
            }
            change = changes.recv() => match change {
                Ok(StoreChange::Replaced { regions }) => {
                    for (region, score) in manager.snapshot().sentiments {
                        log::info!("{:<24} {:+.3}", region, score);
                    }
                    log::info!("Full state: {} regions", regions);
                }
                Ok(StoreChange::Region(delta)) => log::info!(
                    "{:<24} {:+.3} (n={}, update #{})",
                    delta.region,
                    delta.average,
                    delta.sample_count,
                    manager.update_count()
                ),
                Err(RecvError::Lagged(skipped)) => log::warn!("Skipped {} updates", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    // Let the driver flush the close frame.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    Ok(())
}

async fn replay_queue(config: &ClientConfig) -> Result<()> {
    let store = LocalStore::open(&config.storage_dir, &config.namespace)?;
    let client = HttpClient::new(config.queue.api_base_url.clone())?;
    let queue = OfflineWriteQueue::new(Arc::new(client), Arc::new(store), &config.queue)?;
    if queue.is_empty() {
        log::info!("Offline queue is empty");
        return Ok(());
    }
    match queue.replay_all().await? {
        ReplayOutcome::Completed(report) => log::info!(
            "Replayed offline queue: {} succeeded, {} failed, {} kept",
            report.succeeded,
            report.failed,
            report.requeued
        ),
        ReplayOutcome::InProgress => {}
    }
    Ok(())
}

//! In-process channel simulator
//!
//! `SimConnector` hands out channel pairs backed by tokio mpsc queues. The
//! client half goes to whoever called `open`; the server half (`SimPeer`)
//! is delivered to the test, which can push messages, inject transport
//! errors, close with arbitrary codes and inspect what the client sent.
//! Open outcomes can be scripted to exercise reconnection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{ChannelConnector, ChannelError, ChannelEvent, MessageChannel, ABNORMAL_CLOSE};

/// Result the connector will give for an `open` call.
#[derive(Debug, Clone, PartialEq)]
pub enum OpenOutcome {
    Accept,
    Refuse(String),
}

/// A frame written by the client half.
#[derive(Debug, Clone, PartialEq)]
pub enum SentFrame {
    Text(String),
    Close { code: u16, reason: String },
}

/// Scriptable connector. Unscripted opens use the default outcome.
pub struct SimConnector {
    script: StdMutex<VecDeque<OpenOutcome>>,
    default_outcome: StdMutex<OpenOutcome>,
    opened_urls: StdMutex<Vec<String>>,
    peers_tx: mpsc::UnboundedSender<SimPeer>,
    peers_rx: Mutex<mpsc::UnboundedReceiver<SimPeer>>,
}

impl SimConnector {
    /// Create a connector that accepts every open.
    pub fn new() -> Arc<Self> {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            script: StdMutex::new(VecDeque::new()),
            default_outcome: StdMutex::new(OpenOutcome::Accept),
            opened_urls: StdMutex::new(Vec::new()),
            peers_tx,
            peers_rx: Mutex::new(peers_rx),
        })
    }

    /// Queue the outcome of the next unscripted open.
    pub fn script(&self, outcome: OpenOutcome) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(outcome);
        }
    }

    /// Refuse the next `n` opens.
    pub fn refuse_next(&self, n: usize) {
        for i in 0..n {
            self.script(OpenOutcome::Refuse(format!("scripted refusal {}", i + 1)));
        }
    }

    /// Outcome used once the script is exhausted.
    pub fn set_default(&self, outcome: OpenOutcome) {
        if let Ok(mut default) = self.default_outcome.lock() {
            *default = outcome;
        }
    }

    /// How many times `open` has been called.
    pub fn open_count(&self) -> usize {
        self.opened_urls.lock().map(|u| u.len()).unwrap_or(0)
    }

    /// Every URL passed to `open`, in call order.
    pub fn opened_urls(&self) -> Vec<String> {
        self.opened_urls
            .lock()
            .map(|u| u.clone())
            .unwrap_or_default()
    }

    /// Wait for the server half of the next accepted channel.
    pub async fn next_peer(&self) -> Option<SimPeer> {
        self.peers_rx.lock().await.recv().await
    }

    fn next_outcome(&self) -> OpenOutcome {
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match scripted {
            Some(outcome) => outcome,
            None => self
                .default_outcome
                .lock()
                .map(|d| d.clone())
                .unwrap_or(OpenOutcome::Accept),
        }
    }
}

#[async_trait]
impl ChannelConnector for SimConnector {
    async fn open(&self, url: &str) -> Result<Box<dyn MessageChannel>, ChannelError> {
        if let Ok(mut urls) = self.opened_urls.lock() {
            urls.push(url.to_string());
        }

        match self.next_outcome() {
            OpenOutcome::Refuse(reason) => Err(ChannelError::ConnectionFailed(reason)),
            OpenOutcome::Accept => {
                let (channel, peer) = SimChannel::create_pair(url);
                self.peers_tx
                    .send(peer)
                    .map_err(|_| ChannelError::ConnectionFailed("simulator shut down".into()))?;
                Ok(Box::new(channel))
            }
        }
    }
}

/// Client half of a simulated channel.
pub struct SimChannel {
    events: Mutex<mpsc::UnboundedReceiver<ChannelEvent>>,
    outbound: mpsc::UnboundedSender<SentFrame>,
    closed: AtomicBool,
    finished: AtomicBool,
}

impl SimChannel {
    /// Create a connected client/server pair.
    pub fn create_pair(url: &str) -> (SimChannel, SimPeer) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let channel = SimChannel {
            events: Mutex::new(events_rx),
            outbound: outbound_tx,
            closed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        };
        let peer = SimPeer {
            url: url.to_string(),
            inbound: events_tx,
            outbound: outbound_rx,
        };
        (channel, peer)
    }
}

#[async_trait]
impl MessageChannel for SimChannel {
    async fn send(&self, payload: &str) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Disconnected);
        }
        self.outbound
            .send(SentFrame::Text(payload.to_string()))
            .map_err(|_| ChannelError::Disconnected)
    }

    async fn recv(&self) -> ChannelEvent {
        if self.finished.load(Ordering::SeqCst) {
            return ChannelEvent::Closed {
                code: ABNORMAL_CLOSE,
                reason: "channel finished".to_string(),
            };
        }
        let event = match self.events.lock().await.recv().await {
            Some(event) => event,
            None => ChannelEvent::Closed {
                code: ABNORMAL_CLOSE,
                reason: "peer dropped".to_string(),
            },
        };
        if event.is_terminal() {
            self.finished.store(true, Ordering::SeqCst);
        }
        event
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), ChannelError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // The peer may already be gone; closing is still a success locally.
        let _ = self.outbound.send(SentFrame::Close {
            code,
            reason: reason.to_string(),
        });
        Ok(())
    }
}

/// Server half of a simulated channel.
pub struct SimPeer {
    url: String,
    inbound: mpsc::UnboundedSender<ChannelEvent>,
    outbound: mpsc::UnboundedReceiver<SentFrame>,
}

impl SimPeer {
    /// URL the client opened.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Deliver a text message to the client.
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.inbound.send(ChannelEvent::Message(text.into()));
    }

    /// Deliver a JSON value as a text message.
    pub fn push_json(&self, value: &serde_json::Value) {
        self.push(value.to_string());
    }

    /// Inject a transport error.
    pub fn fail(&self, error: impl Into<String>) {
        let _ = self.inbound.send(ChannelEvent::Error(error.into()));
    }

    /// Close the channel from the server side.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.inbound.send(ChannelEvent::Closed {
            code,
            reason: reason.into(),
        });
    }

    /// Wait for the next frame the client sent. `None` once the client
    /// half is dropped and everything was read.
    pub async fn next_frame(&mut self) -> Option<SentFrame> {
        self.outbound.recv().await
    }

    /// Take the next frame if one is already buffered.
    pub fn try_next_frame(&mut self) -> Option<SentFrame> {
        self.outbound.try_recv().ok()
    }

    /// Drain every buffered frame.
    pub fn drain_frames(&mut self) -> Vec<SentFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.try_next_frame() {
            frames.push(frame);
        }
        frames
    }
}

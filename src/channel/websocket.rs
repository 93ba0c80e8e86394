//! WebSocket channel over tokio-tungstenite

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{ChannelConnector, ChannelError, ChannelEvent, MessageChannel, ABNORMAL_CLOSE};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code used when the server sent a close frame without a status.
const NO_STATUS_RECEIVED: u16 = 1005;

/// Opens `ws://` and `wss://` channels.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn open(&self, url: &str) -> Result<Box<dyn MessageChannel>, ChannelError> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;
        let (sink, stream) = ws.split();
        Ok(Box::new(WebSocketChannel {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }))
    }
}

/// An open WebSocket, split so that sends never wait on a pending read.
pub struct WebSocketChannel {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
    /// We sent a close frame.
    closed: AtomicBool,
    /// The read side reported a terminal event.
    finished: AtomicBool,
}

#[async_trait]
impl MessageChannel for WebSocketChannel {
    async fn send(&self, payload: &str) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Disconnected);
        }
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(payload.to_string()))
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> ChannelEvent {
        if self.finished.load(Ordering::SeqCst) {
            return ChannelEvent::Closed {
                code: ABNORMAL_CLOSE,
                reason: "channel finished".to_string(),
            };
        }

        let mut stream = self.stream.lock().await;
        let event = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => break ChannelEvent::Message(text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => break ChannelEvent::Message(text),
                    Err(_) => {
                        log::debug!("Ignoring non-UTF-8 binary frame");
                        continue;
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                    break ChannelEvent::Closed { code, reason };
                }
                // Ping/pong frames are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => break ChannelEvent::Error(e.to_string()),
                None => {
                    break ChannelEvent::Closed {
                        code: ABNORMAL_CLOSE,
                        reason: "stream ended".to_string(),
                    }
                }
            }
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
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(reason.to_string()),
        };
        let mut sink = self.sink.lock().await;
        sink.send(Message::Close(Some(frame)))
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }
}

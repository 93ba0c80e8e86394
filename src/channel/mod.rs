//! Message channel abstraction
//!
//! The sync manager never speaks a wire protocol directly. It consumes a
//! bidirectional, ordered, message-oriented channel through the traits
//! below; the WebSocket connector is the production implementation and the
//! simulated connector drives tests entirely in-process.

pub mod simulated;
pub mod websocket;

use async_trait::async_trait;
use thiserror::Error;

/// Close code signalling an intentional shutdown. Never reconnected.
pub const CLEAN_CLOSE: u16 = 1000;

/// Close code reported when the transport vanished without a close frame.
pub const ABNORMAL_CLOSE: u16 = 1006;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Channel closed")]
    Disconnected,
}

/// Something the remote end (or the transport) did.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A text payload from the server.
    Message(String),
    /// Transport-level failure. Usually followed by a close.
    Error(String),
    /// The channel closed with the given code.
    Closed { code: u16, reason: String },
}

impl ChannelEvent {
    /// Whether no further events will follow this one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelEvent::Closed { .. } | ChannelEvent::Error(_))
    }
}

/// An open channel to the stream server.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Send one text payload.
    async fn send(&self, payload: &str) -> Result<(), ChannelError>;

    /// Wait for the next event. After a terminal event, keeps returning
    /// a `Closed` event.
    async fn recv(&self) -> ChannelEvent;

    /// Close the channel with the given code and reason.
    async fn close(&self, code: u16, reason: &str) -> Result<(), ChannelError>;
}

/// Opens channels to a URL.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn MessageChannel>, ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_events() {
        assert!(!ChannelEvent::Message("{}".into()).is_terminal());
        assert!(ChannelEvent::Error("reset".into()).is_terminal());
        assert!(ChannelEvent::Closed {
            code: CLEAN_CLOSE,
            reason: String::new()
        }
        .is_terminal());
    }
}

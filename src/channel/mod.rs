//! Client channel abstraction.
//!
//! The relay never owns the client connection. It sees an already-upgraded,
//! message-oriented duplex channel through the [`ClientChannel`] trait plus
//! a queue of [`ChannelEvent`]s the channel produces.
//!
//! # Architecture
//!
//! ```text
//! ClientChannel (trait) + mpsc::Receiver<ChannelEvent>
//!     │
//!     ├── WebSocketChannel (tokio-tungstenite, server side)
//!     │
//!     └── ChannelAdapter::to_stream
//!         └── ChunkStream (backpressured, cancellable) + CancelHandle
//! ```
//!
//! Outbound messages go through [`ClientChannel::send`], which only queues
//! the frame. Closing always goes through [`crate::shutdown`], never through
//! [`ClientChannel::close`] directly.

pub mod adapter;
pub mod websocket;

use bytes::Bytes;

use crate::constants::{
    READY_STATE_CLOSED, READY_STATE_CLOSING, READY_STATE_CONNECTING, READY_STATE_OPEN,
};

/// Readiness of a client channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    /// Handshake still in progress.
    Connecting = READY_STATE_CONNECTING,
    /// Open for sending and receiving.
    Open = READY_STATE_OPEN,
    /// Close handshake started.
    Closing = READY_STATE_CLOSING,
    /// Fully closed.
    Closed = READY_STATE_CLOSED,
}

impl From<u8> for ReadyState {
    /// Unknown codes map to `Closed`, i.e. already terminal.
    fn from(value: u8) -> Self {
        match value {
            READY_STATE_CONNECTING => ReadyState::Connecting,
            READY_STATE_OPEN => ReadyState::Open,
            READY_STATE_CLOSING => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

/// Event fired by a client channel.
#[derive(Debug)]
pub enum ChannelEvent {
    /// One inbound message, as binary.
    Message(Bytes),
    /// The peer closed its side of the channel.
    Close,
    /// Transport or protocol failure.
    Error(ChannelError),
}

/// Errors that can occur during channel operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Failed to queue an outbound message.
    SendFailed(String),
    /// The close operation itself failed.
    CloseFailed(String),
    /// Underlying transport reported an error.
    Transport(String),
    /// Channel was closed.
    Closed,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendFailed(msg) => write!(f, "Send failed: {msg}"),
            Self::CloseFailed(msg) => write!(f, "Close failed: {msg}"),
            Self::Transport(msg) => write!(f, "Transport error: {msg}"),
            Self::Closed => write!(f, "Channel closed"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Client-facing duplex endpoint.
///
/// Both operations are non-blocking: `send` queues a frame and `close`
/// starts the close handshake. Implementations must be safe to call from
/// any task of the session.
pub trait ClientChannel: Send + Sync {
    /// Current readiness.
    fn ready_state(&self) -> ReadyState;

    /// Queue one binary message for the peer.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Closed` if the channel no longer accepts
    /// messages, or `ChannelError::SendFailed` if queueing fails.
    fn send(&self, data: Bytes) -> Result<(), ChannelError>;

    /// Start closing the channel.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::CloseFailed` if the close could not be started.
    fn close(&self) -> Result<(), ChannelError>;
}

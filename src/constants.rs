//! Application-wide constants for bepass-relay.
//!
//! Centralizes the magic numbers used by the relay so they can be found
//! in one place. Constants are grouped by domain.
//!
//! # Categories
//!
//! - **Channel**: WebSocket readiness codes and event queue sizing
//! - **Remote**: outbound connection buffering
//! - **Server**: listen address and connect path defaults
//! - **Egress**: fallback egress addresses

// ============================================================================
// Channel
// ============================================================================

/// Readiness code of a channel that is still connecting.
pub const READY_STATE_CONNECTING: u8 = 0;

/// Readiness code of an open channel.
pub const READY_STATE_OPEN: u8 = 1;

/// Readiness code of a channel whose close handshake has started.
pub const READY_STATE_CLOSING: u8 = 2;

/// Readiness code of a closed channel.
pub const READY_STATE_CLOSED: u8 = 3;

/// Capacity of the per-channel inbound event queue.
///
/// When the queue is full the WebSocket reader stops reading, which pushes
/// backpressure onto the client's TCP connection.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 64;

// ============================================================================
// Remote
// ============================================================================

/// Capacity (in chunks) of the queues between a session and its remote
/// transport driver, in each direction.
pub const DEFAULT_REMOTE_QUEUE_CAPACITY: usize = 64;

/// Read buffer size for the remote readable side.
///
/// Each read yields at most one chunk of this size.
pub const REMOTE_READ_BUFFER_SIZE: usize = 4096;

/// Maximum number of client bytes retained for replay onto the fallback
/// egress connection.
pub const DEFAULT_REPLAY_LIMIT: usize = 64 * 1024;

// ============================================================================
// Server
// ============================================================================

/// Default address the relay listens on.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8787";

/// Default request path that is upgraded into a relay session.
pub const DEFAULT_CONNECT_PATH: &str = "/connect";

// ============================================================================
// Egress
// ============================================================================

/// Fallback egress addresses used when none are configured.
pub const DEFAULT_FALLBACK_EGRESS: &[&str] = &["cdn-b100.xn--b6gac.eu.org"];

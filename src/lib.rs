//! Bepass relay - WebSocket to TCP tunneling relay.
//!
//! Bridges an upgraded WebSocket (the client channel) to a raw TCP
//! connection to a caller-chosen `host:port`, copying bytes both ways until
//! either side ends. When the first remote connection closes without
//! delivering a single byte, the session retries once through a fallback
//! egress on the same port.
//!
//! # Architecture
//!
//! - **Channel** - client channel abstraction and the event-to-stream adapter
//! - **Outbound** - remote connections and the process-wide fallback egress
//! - **Relay** - per-session state machine and pumps
//! - **Shutdown** - the single idempotent "close the client" operation
//! - **Server** - TCP accept loop and WebSocket upgrade
//!
//! # Modules
//!
//! - [`channel`] - `ClientChannel`, `ChannelAdapter`, WebSocket channel
//! - [`outbound`] - `OutboundConnector`, `RemoteConnection`, egress selection
//! - [`relay`] - `RelayEngine`
//! - [`config`] - Configuration loading

pub mod channel;
pub mod config;
pub mod constants;
pub mod destination;
pub mod outbound;
pub mod relay;
pub mod server;
pub mod shutdown;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use channel::adapter::{CancelHandle, ChannelAdapter, ChunkStream};
pub use channel::{ChannelError, ChannelEvent, ClientChannel, ReadyState};
pub use config::Config;
pub use destination::Destination;
pub use outbound::{OutboundConnector, RemoteConnection};
pub use relay::{RelayEngine, RelayError, RelayState, SessionReport};
pub use shutdown::{safe_close, ShutdownCoordinator};

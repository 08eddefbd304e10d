//! Idempotent client-channel shutdown.
//!
//! Four independent surfaces can end a session: the client closing, the
//! client erroring, the remote reaching EOF and the remote erroring. Each of
//! them closes the client channel through [`ShutdownCoordinator::close`],
//! which funnels into [`safe_close`]. The channel's own `close` runs at most
//! once per session no matter how many of those fire, or in which order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error};

use crate::channel::{ClientChannel, ReadyState};
use crate::destination::Destination;

/// Close `channel` if it is `Open` or `Closing`; do nothing otherwise.
///
/// Failures are logged and swallowed. Returns `true` if the channel's
/// `close` was invoked and succeeded.
pub fn safe_close(channel: &dyn ClientChannel, destination: &Destination) -> bool {
    match channel.ready_state() {
        ReadyState::Open | ReadyState::Closing => match channel.close() {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "[{}] safe close of client channel failed: {}",
                    destination, e
                );
                false
            }
        },
        ReadyState::Connecting | ReadyState::Closed => false,
    }
}

/// Shared "close the client channel" operation for one session.
pub struct ShutdownCoordinator {
    channel: Arc<dyn ClientChannel>,
    destination: Destination,
    requested: AtomicBool,
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("destination", &self.destination)
            .field("requested", &self.is_requested())
            .field("ready_state", &self.channel.ready_state())
            .finish_non_exhaustive()
    }
}

impl ShutdownCoordinator {
    /// Create a coordinator for `channel`, logging under `destination`.
    pub fn new(channel: Arc<dyn ClientChannel>, destination: Destination) -> Arc<Self> {
        Arc::new(Self {
            channel,
            destination,
            requested: AtomicBool::new(false),
        })
    }

    /// The channel this coordinator closes.
    pub fn channel(&self) -> &dyn ClientChannel {
        self.channel.as_ref()
    }

    /// The session destination, for log prefixes.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Whether any close has been requested yet.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Close the client channel once.
    ///
    /// The first call goes through [`safe_close`]; later calls only log.
    /// Returns `true` if this call actually closed the channel.
    pub fn close(&self, reason: &str) -> bool {
        if self.requested.swap(true, Ordering::AcqRel) {
            debug!(
                "[{}] client close already requested, ignoring: {}",
                self.destination, reason
            );
            return false;
        }
        let closed = safe_close(self.channel.as_ref(), &self.destination);
        debug!(
            "[{}] client close requested ({}), channel closed now: {}",
            self.destination, reason, closed
        );
        closed
    }
}

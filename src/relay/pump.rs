//! Remote-to-client pump.

use std::sync::Arc;

use log::{error, info};

use super::RelayError;
use crate::channel::ReadyState;
use crate::outbound::RemoteReader;
use crate::shutdown::ShutdownCoordinator;

/// How a remote-to-client pump ended.
#[derive(Debug)]
pub enum PumpOutcome {
    /// Remote EOF.
    Finished {
        /// Whether any byte reached the pump before EOF.
        has_incoming_data: bool,
    },
    /// Remote error, or the client channel stopped being open while a chunk
    /// was pending. The client channel has already been safe-closed.
    Failed {
        /// Whether any byte reached the pump before the failure.
        has_incoming_data: bool,
        /// What went wrong.
        error: RelayError,
    },
}

impl PumpOutcome {
    /// Whether any byte was read from the remote.
    pub fn has_incoming_data(&self) -> bool {
        match self {
            Self::Finished { has_incoming_data }
            | Self::Failed {
                has_incoming_data,
                ..
            } => *has_incoming_data,
        }
    }
}

/// Forward every remote chunk, in order, as one client message.
///
/// Each chunk is forwarded only while the client channel is `Open`. On
/// failure the client channel is safe-closed before returning; on EOF it is
/// left to the caller, which decides between retry and shutdown.
pub async fn pump_remote_to_client(
    mut readable: RemoteReader,
    shutdown: Arc<ShutdownCoordinator>,
) -> PumpOutcome {
    let destination = shutdown.destination().clone();
    let mut has_incoming_data = false;

    while let Some(item) = readable.recv().await {
        let error = match item {
            Ok(chunk) => {
                has_incoming_data = true;
                let channel = shutdown.channel();
                if channel.ready_state() != ReadyState::Open {
                    RelayError::ClientNotOpen
                } else if let Err(e) = channel.send(chunk) {
                    RelayError::Client(e)
                } else {
                    continue;
                }
            }
            Err(e) => RelayError::Remote(e),
        };
        error!(
            "[{}] remote to client pump has exception: {}",
            destination, error
        );
        shutdown.close("remote to client pump failed");
        return PumpOutcome::Failed {
            has_incoming_data,
            error,
        };
    }

    info!(
        "[{}] remote readable is closed with has_incoming_data is {}",
        destination, has_incoming_data
    );
    PumpOutcome::Finished { has_incoming_data }
}

//! Relay engine: one client channel bridged to one remote connection.
//!
//! # Architecture
//!
//! ```text
//! RelayEngine::relay(channel, events, destination)
//!     │
//!     └── RelaySession (one task, one select! loop)
//!         ├── ChunkStream ──> forward_to_remote ──> RemoteConnection.write
//!         │        (first chunk opens the connection)
//!         └── pump task: RemoteReader ──> ClientChannel.send
//!                  │
//!                  └── zero-byte EOF on the first connection
//!                      ──> connect_via_fallback, replay, pump again
//! ```
//!
//! States: `AwaitingFirstChunk -> Connected -> (Retrying)? -> Done`.
//!
//! Every termination path closes the client channel through the session's
//! [`ShutdownCoordinator`]. No fault leaves [`RelayEngine::relay`]; the
//! caller only gets a [`SessionReport`].

pub mod pump;

use std::io;
use std::mem;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};

use crate::channel::adapter::{CancelHandle, ChannelAdapter, ChunkStream};
use crate::channel::{ChannelError, ChannelEvent, ClientChannel, ReadyState};
use crate::constants::DEFAULT_REPLAY_LIMIT;
use crate::destination::Destination;
use crate::outbound::{OutboundConnector, RemoteConnection};
use crate::shutdown::ShutdownCoordinator;

pub use pump::{pump_remote_to_client, PumpOutcome};

/// Errors that end one direction of a relay session.
#[derive(Debug)]
pub enum RelayError {
    /// Remote connection failed.
    Remote(io::Error),
    /// The client channel was no longer open while a chunk was pending.
    ClientNotOpen,
    /// Sending to the client channel failed.
    Client(ChannelError),
    /// A chunk arrived with no active remote connection.
    NoActiveConnection,
    /// The remote-to-client pump task died.
    PumpAborted(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(e) => write!(f, "Remote error: {e}"),
            Self::ClientNotOpen => write!(f, "Client channel is not open"),
            Self::Client(e) => write!(f, "Client error: {e}"),
            Self::NoActiveConnection => write!(f, "No active remote connection"),
            Self::PumpAborted(msg) => write!(f, "Pump aborted: {msg}"),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Remote(e) => Some(e),
            Self::Client(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RelayError {
    fn from(e: io::Error) -> Self {
        Self::Remote(e)
    }
}

impl From<ChannelError> for RelayError {
    fn from(e: ChannelError) -> Self {
        Self::Client(e)
    }
}

/// Lifecycle of one relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// No remote connection yet.
    AwaitingFirstChunk,
    /// Relaying over the first connection.
    Connected,
    /// Relaying over the fallback connection.
    Retrying,
    /// Terminal.
    Done,
}

/// What happened during one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// Requested destination.
    pub destination: Destination,
    /// Final state.
    pub state: RelayState,
    /// Whether any remote connection was opened.
    pub connected: bool,
    /// Whether the fallback egress was used.
    pub retried: bool,
    /// Chunks replayed onto the fallback connection.
    pub replayed_chunks: usize,
    /// Client chunks written to a remote connection.
    pub chunks_to_remote: usize,
    /// Whether the last remote connection delivered any byte.
    pub has_incoming_data: bool,
    /// Whether the client channel was closed by the relay.
    pub close_requested: bool,
}

/// Client chunks kept for replay onto the fallback connection.
#[derive(Debug)]
struct ReplayBuffer {
    chunks: Vec<Bytes>,
    len: usize,
    limit: usize,
    overflowed: bool,
}

impl ReplayBuffer {
    fn new(limit: usize) -> Self {
        Self {
            chunks: Vec::new(),
            len: 0,
            limit,
            overflowed: false,
        }
    }

    /// Keep `chunk`, or give up on replay once `limit` would be exceeded.
    fn record(&mut self, chunk: &Bytes) -> bool {
        if self.overflowed {
            return false;
        }
        if self.len + chunk.len() > self.limit {
            self.overflowed = true;
            self.chunks.clear();
            self.len = 0;
            return false;
        }
        self.len += chunk.len();
        self.chunks.push(chunk.clone());
        true
    }

    fn take(&mut self) -> Vec<Bytes> {
        self.len = 0;
        mem::take(&mut self.chunks)
    }
}

/// Runs relay sessions against one outbound connector.
#[derive(Debug)]
pub struct RelayEngine {
    connector: Arc<OutboundConnector>,
    replay_limit: usize,
}

impl RelayEngine {
    /// Create an engine using `connector` for every session.
    pub fn new(connector: OutboundConnector) -> Self {
        Self {
            connector: Arc::new(connector),
            replay_limit: DEFAULT_REPLAY_LIMIT,
        }
    }

    /// Set how many client bytes are kept for replay on retry. Zero disables
    /// replay.
    #[must_use]
    pub fn with_replay_limit(mut self, replay_limit: usize) -> Self {
        self.replay_limit = replay_limit;
        self
    }

    /// The connector sessions use.
    pub fn connector(&self) -> &OutboundConnector {
        &self.connector
    }

    /// Relay `channel` to `destination` until the session ends.
    ///
    /// `events` is the channel's event queue. The channel is closed at most
    /// once, through a single [`ShutdownCoordinator`], whatever ends the
    /// session.
    pub async fn relay(
        &self,
        channel: Arc<dyn ClientChannel>,
        events: mpsc::Receiver<ChannelEvent>,
        destination: Destination,
    ) -> SessionReport {
        let shutdown = ShutdownCoordinator::new(channel, destination.clone());
        let (client, cancel) = ChannelAdapter::to_stream(events, Arc::clone(&shutdown));
        info!("[{}] relay session started", destination);

        let session = RelaySession {
            connector: Arc::clone(&self.connector),
            destination,
            shutdown,
            cancel,
            state: RelayState::AwaitingFirstChunk,
            active: None,
            connected: false,
            retried: false,
            replay: ReplayBuffer::new(self.replay_limit),
            replayed_chunks: 0,
            chunks_to_remote: 0,
            has_incoming_data: false,
        };
        let report = session.run(client).await;

        info!(
            "[{}] relay session ended: retried={} chunks_to_remote={} has_incoming_data={}",
            report.destination, report.retried, report.chunks_to_remote, report.has_incoming_data
        );
        report
    }
}

/// One client channel paired with its (at most two) remote connections.
struct RelaySession {
    connector: Arc<OutboundConnector>,
    destination: Destination,
    shutdown: Arc<ShutdownCoordinator>,
    cancel: CancelHandle,
    state: RelayState,
    /// Only `forward_to_remote` opens it; a retry replaces it.
    active: Option<RemoteConnection>,
    connected: bool,
    retried: bool,
    replay: ReplayBuffer,
    replayed_chunks: usize,
    chunks_to_remote: usize,
    has_incoming_data: bool,
}

type PumpTask = JoinHandle<PumpOutcome>;

impl RelaySession {
    async fn run(mut self, mut client: ChunkStream) -> SessionReport {
        let mut pump: Option<PumpTask> = None;
        let mut client_open = true;

        loop {
            tokio::select! {
                item = client.next(), if client_open => match item {
                    Some(Ok(chunk)) => {
                        if let Err(e) = self.forward_to_remote(chunk, &mut pump).await {
                            error!(
                                "[{}] client to remote pump has exception: {}",
                                self.destination, e
                            );
                            self.cancel.cancel(&e.to_string());
                            client_open = false;
                        }
                    }
                    Some(Err(e)) => {
                        info!("[{}] client stream failed: {}", self.destination, e);
                        client_open = false;
                    }
                    None => {
                        info!("[{}] client stream ended", self.destination);
                        client_open = false;
                    }
                },
                joined = next_outcome(&mut pump), if pump.is_some() => {
                    pump = self.on_pump_complete(settle(joined)).await;
                    if self.state == RelayState::Done {
                        break;
                    }
                },
                else => break,
            }
        }

        self.transition(RelayState::Done);
        SessionReport {
            destination: self.destination.clone(),
            state: self.state,
            connected: self.connected,
            retried: self.retried,
            replayed_chunks: self.replayed_chunks,
            chunks_to_remote: self.chunks_to_remote,
            has_incoming_data: self.has_incoming_data,
            close_requested: self.shutdown.is_requested(),
        }
    }

    fn transition(&mut self, next: RelayState) {
        if self.state != next {
            debug!(
                "[{}] state {:?} -> {:?}",
                self.destination, self.state, next
            );
            self.state = next;
        }
    }

    /// Write one client chunk, opening the first connection if needed.
    ///
    /// A failed write tears the active connection down, except on the first
    /// connection while it has delivered nothing and the chunk fits the
    /// replay buffer.
    async fn forward_to_remote(
        &mut self,
        chunk: Bytes,
        pump: &mut Option<PumpTask>,
    ) -> Result<(), RelayError> {
        if self.state == RelayState::AwaitingFirstChunk {
            let mut conn = self.connector.connect(&self.destination);
            self.connected = true;
            self.transition(RelayState::Connected);
            if let Some(readable) = conn.take_readable() {
                *pump = Some(tokio::spawn(pump_remote_to_client(
                    readable,
                    Arc::clone(&self.shutdown),
                )));
            }
            self.active = Some(conn);
        }

        let conn = self.active.as_ref().ok_or(RelayError::NoActiveConnection)?;
        let kept = !self.retried && !conn.has_incoming_data() && self.replay.record(&chunk);
        match conn.write(chunk).await {
            Ok(()) => {
                self.chunks_to_remote += 1;
                Ok(())
            }
            // No remote byte yet, so a retry is still possible; the chunk
            // waits in the replay buffer.
            Err(e) if kept => {
                debug!(
                    "[{}] write to {} failed, chunk kept for replay: {}",
                    self.destination,
                    conn.destination(),
                    e
                );
                Ok(())
            }
            Err(e) => {
                // Dropping the connection ends its readable side and the pump.
                self.active = None;
                Err(e.into())
            }
        }
    }

    /// Decide what follows a finished pump. Returns the next pump, if any.
    ///
    /// A zero-byte EOF on the first connection retries only while the client
    /// channel is still `Open`. A client that is closing or closed ends the
    /// session without dialing the fallback.
    async fn on_pump_complete(&mut self, outcome: PumpOutcome) -> Option<PumpTask> {
        self.has_incoming_data = outcome.has_incoming_data();
        match outcome {
            PumpOutcome::Finished {
                has_incoming_data: false,
            } if !self.retried => {
                if self.shutdown.channel().ready_state() != ReadyState::Open {
                    info!(
                        "[{}] remote closed without data, client already gone, not retrying",
                        self.destination
                    );
                    self.shutdown.close("remote readable closed");
                    self.finish();
                    return None;
                }
                Some(self.retry().await)
            }
            PumpOutcome::Finished { .. } => {
                self.shutdown.close("remote readable closed");
                self.finish();
                None
            }
            PumpOutcome::Failed { error, .. } => {
                info!(
                    "[{}] remote to client pump failed: {}",
                    self.destination, error
                );
                self.finish();
                None
            }
        }
    }

    /// Swap the first connection for one through the fallback egress.
    async fn retry(&mut self) -> PumpTask {
        self.retried = true;
        self.transition(RelayState::Retrying);

        if let Some(closed) = self.active.as_mut().and_then(RemoteConnection::take_closed) {
            if let Err(e) = closed.wait().await {
                warn!("[{}] first connection failed: {}", self.destination, e);
            }
        }

        let mut conn = self.connector.connect_via_fallback(&self.destination);
        info!(
            "[{}] retry connection via {}",
            self.destination,
            conn.destination()
        );

        for chunk in self.replay.take() {
            let len = chunk.len();
            if let Err(e) = conn.write(chunk).await {
                warn!(
                    "[{}] replay to {} stopped after {} chunks: {}",
                    self.destination,
                    conn.destination(),
                    self.replayed_chunks,
                    e
                );
                break;
            }
            debug!("[{}] replayed {} bytes", self.destination, len);
            self.replayed_chunks += 1;
        }

        let readable = conn.take_readable();
        let closed = conn.take_closed();
        // Dropping the first connection cancels its driver.
        self.active = Some(conn);

        let shutdown = Arc::clone(&self.shutdown);
        let destination = self.destination.clone();
        tokio::spawn(async move {
            let outcome = match readable {
                Some(readable) => pump_remote_to_client(readable, Arc::clone(&shutdown)).await,
                None => PumpOutcome::Finished {
                    has_incoming_data: false,
                },
            };
            if let Some(closed) = closed {
                if let Err(e) = closed.wait().await {
                    error!(
                        "[{}] retry connection closed with error: {}",
                        destination, e
                    );
                }
            }
            shutdown.close("retry connection closed");
            outcome
        })
    }

    fn finish(&mut self) {
        self.active = None;
        self.transition(RelayState::Done);
    }
}

async fn next_outcome(pump: &mut Option<PumpTask>) -> Result<PumpOutcome, JoinError> {
    match pump {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

fn settle(joined: Result<PumpOutcome, JoinError>) -> PumpOutcome {
    joined.unwrap_or_else(|e| PumpOutcome::Failed {
        has_incoming_data: false,
        error: RelayError::PumpAborted(e.to_string()),
    })
}

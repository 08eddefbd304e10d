//! Outbound raw byte-stream connections.
//!
//! [`OutboundConnector`] opens a [`RemoteConnection`] either to the
//! requested destination or, on retry, to the process-wide fallback egress
//! with the originally requested port.
//!
//! # Architecture
//!
//! ```text
//! OutboundConnector::connect(dest) ──> RemoteConnection
//!                                        ├── writable: mpsc::Sender<Bytes>
//!                                        ├── readable: RemoteReader
//!                                        ├── closed:   terminal outcome
//!                                        └── driver task (dial, read loop, write loop)
//! ```
//!
//! Opening never blocks or fails at call time. The driver dials in the
//! background; writes queue until the transport is up. A dial failure ends
//! the readable side without any bytes and is reported through
//! [`RemoteConnection::take_closed`], which the relay reads as a retry signal.

pub mod egress;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::ReaderStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::constants::{DEFAULT_REMOTE_QUEUE_CAPACITY, REMOTE_READ_BUFFER_SIZE};
use crate::destination::Destination;

/// Marker for streams that can be relayed to.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncReadWrite for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Boxed byte stream returned by a [`Dial`].
pub type IoStream = Box<dyn AsyncReadWrite + 'static>;

/// Opens raw byte streams to `host:port`.
#[async_trait]
pub trait Dial: Send + Sync {
    /// Connect to `host:port`.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the address is malformed, cannot be
    /// resolved, or refuses the connection.
    async fn dial(&self, host: &str, port: u16) -> io::Result<IoStream>;
}

/// Plain TCP dialer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dial for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<IoStream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Terminal outcome of a remote connection's readable side.
pub type ClosedOutcome = Result<(), io::Error>;

/// Readable side of a [`RemoteConnection`].
#[derive(Debug)]
pub struct RemoteReader {
    chunks: mpsc::Receiver<io::Result<Bytes>>,
    delivered: Arc<AtomicBool>,
}

impl RemoteReader {
    /// Next chunk in read order, `None` at EOF.
    pub async fn recv(&mut self) -> Option<io::Result<Bytes>> {
        let item = self.chunks.recv().await;
        if matches!(item, Some(Ok(_))) {
            self.delivered.store(true, Ordering::Release);
        }
        item
    }
}

/// One raw byte-stream connection to one `host:port`.
///
/// The writable side may be used while the readable side is being read.
/// Dropping the connection cancels its driver and closes the transport.
#[derive(Debug)]
pub struct RemoteConnection {
    destination: Destination,
    writable: mpsc::Sender<Bytes>,
    readable: Option<RemoteReader>,
    delivered: Arc<AtomicBool>,
    closed: Option<oneshot::Receiver<ClosedOutcome>>,
    _driver: DropGuard,
}

impl RemoteConnection {
    /// Open a connection to `destination` through `dialer`.
    pub fn open(dialer: Arc<dyn Dial>, destination: Destination, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (write_tx, write_rx) = mpsc::channel(capacity);
        let (read_tx, read_rx) = mpsc::channel(capacity);
        let (closed_tx, closed_rx) = oneshot::channel();
        let token = CancellationToken::new();
        let delivered = Arc::new(AtomicBool::new(false));

        let cancelled = token.clone();
        let target = destination.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancelled.cancelled() => {
                    debug!("[{}] remote connection discarded", target);
                }
                () = drive(dialer, target.clone(), write_rx, read_tx, closed_tx) => {
                    debug!("[{}] remote connection driver finished", target);
                }
            }
        });

        Self {
            destination,
            writable: write_tx,
            readable: Some(RemoteReader {
                chunks: read_rx,
                delivered: Arc::clone(&delivered),
            }),
            delivered,
            closed: Some(closed_rx),
            _driver: token.drop_guard(),
        }
    }

    /// Where this connection goes.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Write one chunk to the remote.
    ///
    /// Waits for queue space while the remote is slow (backpressure).
    ///
    /// # Errors
    ///
    /// Returns `BrokenPipe` if the writable side is gone (write failure or
    /// connection discarded).
    pub async fn write(&self, chunk: Bytes) -> io::Result<()> {
        self.writable.send(chunk).await.map_err(|e| {
            io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("remote writable side closed ({} bytes dropped)", e.0.len()),
            )
        })
    }

    /// Whether the readable side has handed out any chunk yet.
    pub fn has_incoming_data(&self) -> bool {
        self.delivered.load(Ordering::Acquire)
    }

    /// Take the readable side. Returns `None` after the first call.
    pub fn take_readable(&mut self) -> Option<RemoteReader> {
        self.readable.take()
    }

    /// Take the terminal-outcome signal. Returns `None` after the first call.
    pub fn take_closed(&mut self) -> Option<Closed> {
        self.closed.take().map(|rx| Closed { rx })
    }
}

/// Resolves once a remote connection's readable side is terminal.
#[derive(Debug)]
pub struct Closed {
    rx: oneshot::Receiver<ClosedOutcome>,
}

impl Closed {
    /// Wait for the terminal outcome.
    ///
    /// A connection discarded before finishing resolves as `Ok(())`.
    pub async fn wait(self) -> ClosedOutcome {
        self.rx.await.unwrap_or(Ok(()))
    }
}

async fn drive(
    dialer: Arc<dyn Dial>,
    destination: Destination,
    mut write_rx: mpsc::Receiver<Bytes>,
    read_tx: mpsc::Sender<io::Result<Bytes>>,
    closed_tx: oneshot::Sender<ClosedOutcome>,
) {
    let stream = match dialer.dial(&destination.host, destination.port).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("[{}] remote connect failed: {}", destination, e);
            // Readable side ends with zero bytes; the error goes to `closed`.
            drop(read_tx);
            let _ = closed_tx.send(Err(e));
            return;
        }
    };
    debug!("[{}] remote connected", destination);
    let (read_half, mut write_half) = tokio::io::split(stream);

    let reading = async move {
        let mut chunks = ReaderStream::with_capacity(read_half, REMOTE_READ_BUFFER_SIZE);
        let outcome = loop {
            match chunks.next().await {
                Some(Ok(chunk)) => {
                    if read_tx.send(Ok(chunk)).await.is_err() {
                        break Ok(());
                    }
                }
                Some(Err(e)) => {
                    let _ = read_tx
                        .send(Err(io::Error::new(e.kind(), e.to_string())))
                        .await;
                    break Err(e);
                }
                None => break Ok(()),
            }
        };
        drop(read_tx);
        let _ = closed_tx.send(outcome);
    };

    let writing = async move {
        while let Some(chunk) = write_rx.recv().await {
            if let Err(e) = write_half.write_all(&chunk).await {
                warn!("[{}] remote write failed: {}", destination, e);
                return;
            }
        }
    };

    tokio::join!(reading, writing);
}

/// Opens session connections: direct, or through the fallback egress.
pub struct OutboundConnector {
    dialer: Arc<dyn Dial>,
    fallback_host: String,
    capacity: usize,
}

impl std::fmt::Debug for OutboundConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundConnector")
            .field("fallback_host", &self.fallback_host)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl OutboundConnector {
    /// Connector over plain TCP using `fallback_host` for retries.
    pub fn tcp(fallback_host: impl Into<String>) -> Self {
        Self::new(Arc::new(TcpDialer), fallback_host)
    }

    /// Connector over a custom dialer.
    pub fn new(dialer: Arc<dyn Dial>, fallback_host: impl Into<String>) -> Self {
        Self {
            dialer,
            fallback_host: fallback_host.into(),
            capacity: DEFAULT_REMOTE_QUEUE_CAPACITY,
        }
    }

    /// Set the per-direction queue capacity, in chunks.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// The fallback egress host used by [`Self::connect_via_fallback`].
    pub fn fallback_host(&self) -> &str {
        &self.fallback_host
    }

    /// Open a connection to the literal requested destination.
    pub fn connect(&self, destination: &Destination) -> RemoteConnection {
        debug!("[{}] connecting", destination);
        RemoteConnection::open(Arc::clone(&self.dialer), destination.clone(), self.capacity)
    }

    /// Open a connection to the fallback egress on the port of `original`.
    pub fn connect_via_fallback(&self, original: &Destination) -> RemoteConnection {
        let destination = original.with_host(self.fallback_host.as_str());
        debug!("[{}] connecting via fallback egress", destination);
        RemoteConnection::open(Arc::clone(&self.dialer), destination, self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedDial, ScriptedStream};
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_refused_dial_ends_readable_without_bytes() {
        let dial = ScriptedDial::new(vec![ScriptedDial::refuse()]);
        let dialer = Arc::clone(&dial) as Arc<dyn Dial>;
        let connector = OutboundConnector::new(dialer, "fallback.example");
        let blocked = Destination::new("blocked.example", 443);

        let mut conn = connector.connect(&blocked);
        let mut readable = conn.take_readable().unwrap();
        let closed = conn.take_closed().unwrap();

        assert!(readable.recv().await.is_none());
        let outcome = closed.wait().await;
        assert_eq!(
            outcome.unwrap_err().kind(),
            io::ErrorKind::ConnectionRefused
        );
        assert_eq!(dial.dialed(), vec![blocked]);
    }

    #[tokio::test]
    async fn test_fallback_uses_fallback_host_and_original_port() {
        let dial = ScriptedDial::new(vec![ScriptedDial::refuse()]);
        let dialer = Arc::clone(&dial) as Arc<dyn Dial>;
        let connector = OutboundConnector::new(dialer, "fallback.example");
        let original = Destination::new("blocked.example", 8443);
        let expected = Destination::new("fallback.example", 8443);

        let mut conn = connector.connect_via_fallback(&original);
        assert_eq!(conn.destination(), &expected);
        let _ = conn.take_closed().unwrap().wait().await;
        assert_eq!(dial.dialed(), vec![expected]);
    }

    #[tokio::test]
    async fn test_writes_before_connect_are_delivered_in_order() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let dial = ScriptedDial::new(vec![ScriptedDial::stream(local)]);
        let connector = OutboundConnector::new(dial, "fallback.example");

        let conn = connector.connect(&Destination::new("example.com", 80));
        conn.write(Bytes::from_static(b"GET / ")).await.unwrap();
        conn.write(Bytes::from_static(b"HTTP/1.1\r\n"))
            .await
            .unwrap();

        let mut buf = vec![0u8; 16];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn test_readable_yields_remote_bytes_then_eof() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let dial = ScriptedDial::new(vec![ScriptedDial::stream(local)]);
        let connector = OutboundConnector::new(dial, "fallback.example");

        let mut conn = connector.connect(&Destination::new("example.com", 80));
        let mut readable = conn.take_readable().unwrap();
        let closed = conn.take_closed().unwrap();

        remote.write_all(b"hello").await.unwrap();
        remote.shutdown().await.unwrap();
        drop(remote);

        let mut received = Vec::new();
        while let Some(chunk) = readable.recv().await {
            received.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(received, b"hello");
        closed.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_error_surfaces_on_readable_and_closed() {
        let stream = ScriptedStream::new(vec![
            Ok(b"partial".to_vec()),
            Err(io::ErrorKind::ConnectionReset),
        ]);
        let dial = ScriptedDial::new(vec![ScriptedDial::stream(stream)]);
        let connector = OutboundConnector::new(dial, "fallback.example");

        let mut conn = connector.connect(&Destination::new("example.com", 80));
        let mut readable = conn.take_readable().unwrap();
        let closed = conn.take_closed().unwrap();

        assert_eq!(readable.recv().await.unwrap().unwrap(), "partial");
        let err = readable.recv().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(readable.recv().await.is_none());
        assert_eq!(
            closed.wait().await.unwrap_err().kind(),
            io::ErrorKind::ConnectionReset
        );
    }

    #[tokio::test]
    async fn test_has_incoming_data_once_a_chunk_is_read() {
        let stream = ScriptedStream::new(vec![Ok(b"data".to_vec())]);
        let dial = ScriptedDial::new(vec![ScriptedDial::stream(stream)]);
        let connector = OutboundConnector::new(dial, "fallback.example");

        let mut conn = connector.connect(&Destination::new("example.com", 80));
        let mut readable = conn.take_readable().unwrap();
        assert!(!conn.has_incoming_data());

        assert_eq!(readable.recv().await.unwrap().unwrap(), "data");
        assert!(conn.has_incoming_data());
        assert!(readable.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_take_readable_once() {
        let dial = ScriptedDial::new(vec![ScriptedDial::refuse()]);
        let connector = OutboundConnector::new(dial, "fallback.example");
        let mut conn = connector.connect(&Destination::new("example.com", 80));
        assert!(conn.take_readable().is_some());
        assert!(conn.take_readable().is_none());
        assert!(conn.take_closed().is_some());
        assert!(conn.take_closed().is_none());
    }

    #[tokio::test]
    async fn test_dropping_connection_closes_transport() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let dial = ScriptedDial::new(vec![ScriptedDial::stream(local)]);
        let connector = OutboundConnector::new(dial, "fallback.example");

        let conn = connector.connect(&Destination::new("example.com", 80));
        conn.write(Bytes::from_static(b"x")).await.unwrap();
        let mut byte = [0u8; 1];
        remote.read_exact(&mut byte).await.unwrap();
        drop(conn);

        // Driver cancelled: the local half is dropped and the peer sees EOF.
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}

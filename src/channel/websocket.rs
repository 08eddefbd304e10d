//! Server-side WebSocket as a [`ClientChannel`].
//!
//! Thin wrapper around an accepted `tokio-tungstenite` stream. The stream is
//! split and each half gets its own task:
//!
//! - the **reader** turns frames into [`ChannelEvent`]s on a bounded queue
//!   (it stops reading while the queue is full)
//! - the **writer** drains an outbound queue fed by [`ClientChannel::send`]
//!   and [`ClientChannel::close`]
//!
//! Readiness is tracked in an atomic so `ready_state` never blocks.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use super::{ChannelError, ChannelEvent, ClientChannel, ReadyState};

/// Outbound command for the writer task.
#[derive(Debug)]
enum Outgoing {
    Binary(Bytes),
    Close,
}

/// A WebSocket connection accepted by the server.
#[derive(Debug)]
pub struct WebSocketChannel {
    state: Arc<AtomicU8>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl WebSocketChannel {
    /// Start the reader and writer tasks for an accepted socket.
    ///
    /// Returns the channel and its event queue (bounded to `capacity`).
    pub fn spawn<S>(
        socket: WebSocketStream<S>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<ChannelEvent>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(ReadyState::Open as u8));
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(capacity.max(1));
        let (sink, stream) = socket.split();

        tokio::spawn(write_loop(sink, outgoing_rx, Arc::clone(&state)));
        tokio::spawn(read_loop(stream, events_tx, Arc::clone(&state)));

        let channel = Arc::new(Self {
            state,
            outgoing: outgoing_tx,
        });
        (channel, events_rx)
    }
}

impl ClientChannel for WebSocketChannel {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from(self.state.load(Ordering::Acquire))
    }

    fn send(&self, data: Bytes) -> Result<(), ChannelError> {
        if self.ready_state() != ReadyState::Open {
            return Err(ChannelError::Closed);
        }
        self.outgoing
            .send(Outgoing::Binary(data))
            .map_err(|e| ChannelError::SendFailed(format!("writer task gone: {e}")))
    }

    fn close(&self) -> Result<(), ChannelError> {
        // Only an open channel moves to Closing; Closed stays Closed.
        let _ = self.state.compare_exchange(
            ReadyState::Open as u8,
            ReadyState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.outgoing
            .send(Outgoing::Close)
            .map_err(|e| ChannelError::CloseFailed(format!("writer task gone: {e}")))
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    state: Arc<AtomicU8>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(command) = outgoing.recv().await {
        match command {
            Outgoing::Binary(data) => {
                if let Err(e) = sink.send(Message::Binary(data.to_vec())).await {
                    debug!("[WebSocket] send failed, stopping writer: {}", e);
                    break;
                }
            }
            Outgoing::Close => {
                if let Err(e) = sink.send(Message::Close(None)).await {
                    debug!("[WebSocket] close frame not sent: {}", e);
                }
                break;
            }
        }
    }
    state.store(ReadyState::Closed as u8, Ordering::Release);
}

async fn read_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    events: mpsc::Sender<ChannelEvent>,
    state: Arc<AtomicU8>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut close_emitted = false;

    // Keep reading after a Close frame so tungstenite flushes its reply.
    while let Some(frame) = stream.next().await {
        let data = match frame {
            Ok(Message::Binary(data)) => Bytes::from(data),
            Ok(Message::Text(text)) => Bytes::from(text.into_bytes()),
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
            Ok(Message::Close(frame)) => {
                debug!("[WebSocket] close frame received: {:?}", frame);
                // tungstenite answers the close handshake itself.
                state.store(ReadyState::Closed as u8, Ordering::Release);
                if !close_emitted {
                    close_emitted = true;
                    let _ = events.send(ChannelEvent::Close).await;
                }
                continue;
            }
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => break,
            Err(e) => {
                state.store(ReadyState::Closed as u8, Ordering::Release);
                let _ = events
                    .send(ChannelEvent::Error(ChannelError::Transport(e.to_string())))
                    .await;
                break;
            }
        };
        if close_emitted {
            continue;
        }
        if events.send(ChannelEvent::Message(data)).await.is_err() {
            // Nobody consumes events any more.
            break;
        }
    }

    state.store(ReadyState::Closed as u8, Ordering::Release);
    if !close_emitted {
        let _ = events.send(ChannelEvent::Close).await;
    }
}

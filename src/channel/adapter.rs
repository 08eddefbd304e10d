//! Event-driven channel → backpressured chunk stream.
//!
//! [`ChannelAdapter::to_stream`] turns the event queue of a client channel
//! into a [`ChunkStream`] plus a [`CancelHandle`]. Each event maps to exactly
//! one of {produce a chunk, end the stream, fail the stream}, gated by a
//! single cancelled flag:
//!
//! | Event        | Not cancelled               | Cancelled                   |
//! |--------------|-----------------------------|-----------------------------|
//! | `Message`    | yield chunk                 | dropped                     |
//! | `Close`      | safe-close, end stream      | safe-close, nothing emitted |
//! | `Error`      | safe-close, fail stream     | safe-close, fail stream     |
//!
//! Errors stay observable after cancellation. Consumers that still poll the
//! stream see them.
//!
//! Backpressure comes from the bounded event queue: the stream pulls one
//! event per poll, so a slow consumer stops the producer.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use log::{info, warn};
use tokio::sync::mpsc;

use super::{ChannelError, ChannelEvent};
use crate::shutdown::ShutdownCoordinator;

/// What one translated event produces on the stream.
#[derive(Debug, PartialEq, Eq)]
enum Signal {
    Chunk(Bytes),
    End,
    Fail(ChannelError),
}

#[derive(Debug)]
struct AdapterState {
    cancelled: AtomicBool,
    shutdown: Arc<ShutdownCoordinator>,
}

impl AdapterState {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn translate(&self, event: ChannelEvent) -> Option<Signal> {
        match event {
            ChannelEvent::Message(data) => (!self.is_cancelled()).then_some(Signal::Chunk(data)),
            ChannelEvent::Close => {
                // Client closed its direction; close ours too.
                self.shutdown.close("client channel closed");
                (!self.is_cancelled()).then_some(Signal::End)
            }
            ChannelEvent::Error(e) => {
                warn!(
                    "[{}] client channel has error: {}",
                    self.shutdown.destination(),
                    e
                );
                self.shutdown.close("client channel error");
                Some(Signal::Fail(e))
            }
        }
    }
}

/// Builds chunk streams from client channel events.
#[derive(Debug)]
pub struct ChannelAdapter;

impl ChannelAdapter {
    /// Wrap `events` as a [`ChunkStream`].
    ///
    /// Close and error events, and cancellation, close the channel through
    /// `shutdown`.
    pub fn to_stream(
        events: mpsc::Receiver<ChannelEvent>,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> (ChunkStream, CancelHandle) {
        let state = Arc::new(AdapterState {
            cancelled: AtomicBool::new(false),
            shutdown,
        });
        let stream = ChunkStream {
            events,
            state: Arc::clone(&state),
            finished: false,
        };
        (stream, CancelHandle { state })
    }
}

/// Ordered, finite, cancellable sequence of client chunks.
///
/// Yields `Ok(chunk)` per message, then ends on close (`None`) or fails
/// once with `Err`. Not restartable: after ending or failing it stays
/// ended.
#[derive(Debug)]
pub struct ChunkStream {
    events: mpsc::Receiver<ChannelEvent>,
    state: Arc<AdapterState>,
    finished: bool,
}

impl Stream for ChunkStream {
    type Item = Result<Bytes, ChannelError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        loop {
            let Some(event) = ready!(self.events.poll_recv(cx)) else {
                // Event source dropped: nothing more can arrive.
                self.finished = true;
                return Poll::Ready(None);
            };
            match self.state.translate(event) {
                Some(Signal::Chunk(data)) => return Poll::Ready(Some(Ok(data))),
                Some(Signal::End) => {
                    self.finished = true;
                    return Poll::Ready(None);
                }
                Some(Signal::Fail(e)) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {}
            }
        }
    }
}

/// Cancels a [`ChunkStream`] from anywhere in the session.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    state: Arc<AdapterState>,
}

impl CancelHandle {
    /// Cancel the stream and safe-close the channel.
    ///
    /// No-op if already cancelled. Returns `true` on the first call.
    pub fn cancel(&self, reason: &str) -> bool {
        if self.state.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!(
            "[{}] client stream was cancelled, due to {}",
            self.state.shutdown.destination(),
            reason
        );
        self.state.shutdown.close("client stream cancelled");
        true
    }
}

//! Test doubles shared by unit tests.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::channel::{ChannelError, ClientChannel, ReadyState};
use crate::destination::Destination;
use crate::outbound::{AsyncReadWrite, Dial, IoStream};

/// Recording client channel.
#[derive(Debug)]
pub(crate) struct TestChannel {
    state: AtomicU8,
    sent: Mutex<Vec<Bytes>>,
    close_calls: AtomicUsize,
    /// `close` leaves the state untouched.
    sticky: bool,
    fail_close: bool,
    /// Becomes Closed once this many messages have been sent.
    close_after_sends: Option<usize>,
}

impl TestChannel {
    fn build(state: ReadyState, sticky: bool, fail_close: bool) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
            sent: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
            sticky,
            fail_close,
            close_after_sends: None,
        }
    }

    pub(crate) fn open() -> Arc<Self> {
        Self::with_state(ReadyState::Open)
    }

    pub(crate) fn with_state(state: ReadyState) -> Arc<Self> {
        Arc::new(Self::build(state, false, false))
    }

    pub(crate) fn sticky(state: ReadyState) -> Arc<Self> {
        Arc::new(Self::build(state, true, false))
    }

    pub(crate) fn failing_close() -> Arc<Self> {
        Arc::new(Self::build(ReadyState::Open, false, true))
    }

    /// Open channel whose peer goes away after `sends` messages.
    pub(crate) fn closing_after(sends: usize) -> Arc<Self> {
        let mut channel = Self::build(ReadyState::Open, false, false);
        channel.close_after_sends = Some(sends);
        Arc::new(channel)
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn set_state(&self, state: ReadyState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

impl ClientChannel for TestChannel {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from(self.state.load(Ordering::SeqCst))
    }

    fn send(&self, data: Bytes) -> Result<(), ChannelError> {
        if self.ready_state() != ReadyState::Open {
            return Err(ChannelError::Closed);
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(data);
        if self.close_after_sends == Some(sent.len()) {
            self.set_state(ReadyState::Closed);
        }
        Ok(())
    }

    fn close(&self) -> Result<(), ChannelError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(ChannelError::CloseFailed("scripted failure".into()));
        }
        if !self.sticky {
            self.set_state(ReadyState::Closed);
        }
        Ok(())
    }
}

/// One scripted dial attempt.
pub(crate) enum DialScript {
    Refuse,
    Stream(IoStream),
}

/// Dialer that plays back a script and records every target.
pub(crate) struct ScriptedDial {
    script: Mutex<VecDeque<DialScript>>,
    dialed: Mutex<Vec<Destination>>,
}

impl ScriptedDial {
    pub(crate) fn new(script: Vec<DialScript>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            dialed: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn refuse() -> DialScript {
        DialScript::Refuse
    }

    pub(crate) fn stream(stream: impl AsyncReadWrite + 'static) -> DialScript {
        DialScript::Stream(Box::new(stream))
    }

    pub(crate) fn dialed(&self) -> Vec<Destination> {
        self.dialed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dial for ScriptedDial {
    async fn dial(&self, host: &str, port: u16) -> io::Result<IoStream> {
        self.dialed
            .lock()
            .unwrap()
            .push(Destination::new(host, port));
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(DialScript::Stream(stream)) => Ok(stream),
            Some(DialScript::Refuse) | None => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("scripted refusal for {host}:{port}"),
            )),
        }
    }
}

/// Byte stream that reads a fixed script and discards writes.
///
/// Each `Ok` entry is returned by exactly one read. After the script, reads
/// report EOF unless the stream is held open.
pub(crate) struct ScriptedStream {
    reads: VecDeque<Result<Vec<u8>, io::ErrorKind>>,
    /// Reads stay pending once the script is exhausted.
    hold_open: bool,
    /// Every write fails with `BrokenPipe`.
    fail_writes: bool,
}

impl ScriptedStream {
    pub(crate) fn new(reads: Vec<Result<Vec<u8>, io::ErrorKind>>) -> Self {
        Self {
            reads: reads.into(),
            hold_open: false,
            fail_writes: false,
        }
    }

    pub(crate) fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub(crate) fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }
}

impl AsyncRead for ScriptedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.reads.pop_front() {
            Some(Ok(data)) => {
                buf.put_slice(&data);
                Poll::Ready(Ok(()))
            }
            Some(Err(kind)) => Poll::Ready(Err(io::Error::new(kind, "scripted read error"))),
            None if self.hold_open => Poll::Pending,
            None => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for ScriptedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.fail_writes {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "scripted write error",
            )));
        }
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

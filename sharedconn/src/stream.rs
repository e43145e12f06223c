use crate::replay::{Replay, ReplayBuffer, DEFAULT_REPLAY_CAPACITY};
use crate::tee::TeeReader;
use bytes::Bytes;
use std::io;
use std::io::{IoSlice, Write};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace, warn};

/// Async counterpart of [`SharedConn`](crate::SharedConn) for tokio streams.
///
/// The inspection phase borrows the stream through [`SharedStream::inspector`];
/// once that borrow ends, the `SharedStream` itself replays what was read and
/// then reads from the stream directly. Exclusive `&mut` access serializes
/// reads; use `tokio::io::split` to read and write from different tasks.
#[derive(Debug)]
pub struct SharedStream<S> {
    inner: S,
    // `None` once the recorded prefix has been handed out.
    replay: Option<ReplayBuffer>,
}

impl<S> SharedStream<S> {
    pub fn new(inner: S) -> Self {
        Self::with_capacity(inner, DEFAULT_REPLAY_CAPACITY)
    }

    pub fn with_capacity(inner: S, capacity: usize) -> Self {
        Self {
            inner,
            replay: Some(ReplayBuffer::with_capacity(capacity)),
        }
    }

    /// Reader for the inspection stage. Everything it reads is recorded and
    /// replayed by this stream's next reads.
    pub fn inspector(&mut self) -> Inspector<'_, S> {
        Inspector {
            tee: TeeReader::new(&mut self.inner, Recorder(&mut self.replay)),
        }
    }

    pub fn is_live(&self) -> bool {
        self.replay.is_none()
    }

    pub fn buffered(&self) -> usize {
        self.replay.as_ref().map_or(0, ReplayBuffer::remaining)
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Splits into the stream and the recorded bytes that were not replayed
    /// yet (`None` if the stream already went live).
    ///
    /// A caller that takes the stream back this way must send the returned
    /// bytes ahead of anything it reads from the stream.
    pub fn into_parts(self) -> (S, Option<Bytes>) {
        (self.inner, self.replay.map(ReplayBuffer::into_bytes))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SharedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(replay) = this.replay.as_mut() {
            match replay.replay(buf.initialize_unfilled()) {
                Replay::Filled(n) => {
                    trace!("replayed {} recorded bytes", n);
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Replay::Exhausted => {
                    // Already live even if the read below is pending.
                    let replayed = replay.replayed();
                    this.replay = None;
                    debug!(
                        "replay buffer drained after {} bytes, switching to pass-through",
                        replayed
                    );
                }
            }
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SharedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

/// Inspection reader borrowed from a [`SharedStream`].
pub struct Inspector<'a, S> {
    tee: TeeReader<&'a mut S, Recorder<'a>>,
}

impl<S: AsyncRead + Unpin> AsyncRead for Inspector<'_, S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.tee).poll_read(cx, buf)
    }
}

struct Recorder<'a>(&'a mut Option<ReplayBuffer>);

impl Write for Recorder<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self.0.as_mut() {
            Some(replay) => replay.record(data),
            None => warn!(
                "inspection read {} bytes after the stream went live, they will not be replayed",
                data.len()
            ),
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

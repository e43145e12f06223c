use bytes::{Buf, Bytes, BytesMut};
use std::io;

/// Allocated up front so that a typical sniffed prefix (TLS ClientHello, HTTP
/// request line) fits without resizing.
pub const DEFAULT_REPLAY_CAPACITY: usize = 1024;

/// Outcome of [`ReplayBuffer::replay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
    /// That many bytes were copied out of the buffer.
    Filled(usize),
    /// The buffer was already empty when asked for at least one byte.
    Exhausted,
}

/// Bytes captured during inspection, handed back out in the order they were
/// recorded.
///
/// Exhaustion is reported lazily: the call that copies out the last byte
/// returns [`Replay::Filled`], and only the following call returns
/// [`Replay::Exhausted`].
#[derive(Debug)]
pub struct ReplayBuffer {
    buf: BytesMut,
    replayed: usize,
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }
}

impl ReplayBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            replayed: 0,
        }
    }

    pub fn record(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn replay(&mut self, dst: &mut [u8]) -> Replay {
        if dst.is_empty() {
            return Replay::Filled(0);
        }
        if self.buf.is_empty() {
            return Replay::Exhausted;
        }

        let n = dst.len().min(self.buf.len());
        self.buf.copy_to_slice(&mut dst[..n]);
        self.replayed += n;
        Replay::Filled(n)
    }

    /// Bytes recorded but not yet replayed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Bytes handed out so far.
    pub fn replayed(&self) -> usize {
        self.replayed
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

impl io::Write for ReplayBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.record(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

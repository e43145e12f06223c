use crate::conn::Connection;
use crate::replay::{Replay, ReplayBuffer, DEFAULT_REPLAY_CAPACITY};
use crate::tee::TeeReader;
use parking_lot::Mutex;
use std::io;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

struct Shared<C> {
    conn: C,
    // `None` once the recorded prefix has been handed out: the connection is live.
    replay: Mutex<Option<ReplayBuffer>>,
}

/// A connection whose opening bytes can be inspected without being consumed.
///
/// Created together with an [`InspectionReader`]. Whatever the inspection
/// reader pulls off the wire is recorded, and handed out again by the first
/// reads on the `SharedConn` before they fall through to the connection
/// itself.
///
/// Reads are serialized by an internal lock, held for the whole read call,
/// live read included. Writes, close, addressing and timeouts go straight to
/// the wrapped connection.
///
/// Cloning is cheap and every clone shares the same replay state.
pub struct SharedConn<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for SharedConn<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: Connection> SharedConn<C> {
    pub fn new(conn: C) -> (Self, InspectionReader<C>) {
        Self::with_capacity(conn, DEFAULT_REPLAY_CAPACITY)
    }

    /// Like [`SharedConn::new`], with a custom initial replay buffer capacity.
    /// The buffer still grows past it if the inspection reads more.
    pub fn with_capacity(conn: C, capacity: usize) -> (Self, InspectionReader<C>) {
        let shared = Arc::new(Shared {
            conn,
            replay: Mutex::new(Some(ReplayBuffer::with_capacity(capacity))),
        });
        let inspector = InspectionReader {
            tee: TeeReader::new(LiveReader(shared.clone()), Recorder(shared.clone())),
        };

        (Self { shared }, inspector)
    }

    /// Whether the recorded prefix has been fully handed out and reads now
    /// go straight to the connection.
    pub fn is_live(&self) -> bool {
        self.shared.replay.lock().is_none()
    }

    /// Number of recorded bytes not yet handed out.
    pub fn buffered(&self) -> usize {
        self.shared
            .replay
            .lock()
            .as_ref()
            .map_or(0, ReplayBuffer::remaining)
    }

    pub fn get_ref(&self) -> &C {
        &self.shared.conn
    }

    fn read_shared(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut replay = self.shared.replay.lock();
        let Some(buffer) = replay.as_mut() else {
            drop(replay);
            return self.shared.conn.read(buf);
        };

        match buffer.replay(buf) {
            Replay::Filled(n) => {
                trace!("replayed {} recorded bytes", n);
                Ok(n)
            }
            Replay::Exhausted => {
                // The lock stays held across this first live read, so no other
                // reader can slip in between the replay and the live bytes.
                let replayed = buffer.replayed();
                *replay = None;
                debug!(
                    "replay buffer drained after {} bytes, switching to pass-through",
                    replayed
                );
                self.shared.conn.read(buf)
            }
        }
    }
}

impl<C: Connection> Connection for SharedConn<C> {
    type Addr = C::Addr;

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_shared(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.shared.conn.write(buf)
    }

    fn flush(&self) -> io::Result<()> {
        self.shared.conn.flush()
    }

    fn close(&self) -> io::Result<()> {
        self.shared.conn.close()
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.shared.conn.local_addr()
    }

    fn peer_addr(&self) -> io::Result<Self::Addr> {
        self.shared.conn.peer_addr()
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.shared.conn.set_read_timeout(timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.shared.conn.set_write_timeout(timeout)
    }
}

impl<C: Connection> Read for SharedConn<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_shared(buf)
    }
}

impl<C: Connection> Read for &SharedConn<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_shared(buf)
    }
}

impl<C: Connection> Write for SharedConn<C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.shared.conn.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.shared.conn.flush()
    }
}

impl<C: Connection> Write for &SharedConn<C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.shared.conn.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.shared.conn.flush()
    }
}

/// Reads the opening bytes of a [`SharedConn`] on behalf of an inspection
/// stage, recording them for replay.
///
/// Only meant to be used before the `SharedConn` is handed to the next
/// stage. Once the `SharedConn` has gone live, bytes read here are lost to
/// the next stage.
pub struct InspectionReader<C> {
    tee: TeeReader<LiveReader<C>, Recorder<C>>,
}

impl<C: Connection> Read for InspectionReader<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.tee.read(buf)
    }
}

struct LiveReader<C>(Arc<Shared<C>>);

impl<C: Connection> Read for LiveReader<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.conn.read(buf)
    }
}

struct Recorder<C>(Arc<Shared<C>>);

impl<C> Write for Recorder<C> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self.0.replay.lock().as_mut() {
            Some(replay) => replay.record(data),
            None => warn!(
                "inspection read {} bytes after the connection went live, they will not be replayed",
                data.len()
            ),
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

//! Lets an inspection stage peek at the opening bytes of a connection without
//! taking them away from whoever reads the connection next.
//!
//! [`SharedConn::new`] wraps a blocking [`Connection`] and returns an
//! [`InspectionReader`] alongside it. Bytes read through the inspection reader
//! are recorded; the first reads on the `SharedConn` replay them in order and,
//! once the recording is used up, fall through to the connection for good.
//!
//! ```no_run
//! use sharedconn::SharedConn;
//! use std::io::Read;
//! use std::net::TcpStream;
//!
//! # fn main() -> std::io::Result<()> {
//! let stream = TcpStream::connect("127.0.0.1:8080")?;
//! let (mut conn, mut inspector) = SharedConn::new(stream);
//!
//! let mut method = [0u8; 3];
//! inspector.read_exact(&mut method)?;
//!
//! // `conn` yields the full stream, `method` included.
//! let mut request = Vec::new();
//! conn.read_to_end(&mut request)?;
//! # Ok(())
//! # }
//! ```
//!
//! Exhaustion of the recording is detected lazily: the read that hands out
//! the last recorded byte does not touch the connection, the read after it
//! does. A read never mixes recorded and live bytes.
//!
//! [`SharedStream`] does the same for tokio streams.

mod conn;
mod replay;
mod shared;
mod stream;
mod tee;

pub use conn::Connection;
pub use replay::{Replay, ReplayBuffer, DEFAULT_REPLAY_CAPACITY};
pub use shared::{InspectionReader, SharedConn};
pub use stream::{Inspector, SharedStream};
pub use tee::TeeReader;

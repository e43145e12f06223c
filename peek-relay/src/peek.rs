use sharedconn::SharedStream;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tracing::debug;

/// Reads up to `max` opening bytes through the stream's inspector.
///
/// Stops early on end-of-stream or when `wait` elapses: server-speaks-first
/// protocols send nothing until they get a greeting, so a short or empty
/// prefix is not an error. The bytes stay recorded in `stream` either way.
pub async fn peek_prefix<S>(
    stream: &mut SharedStream<S>,
    max: usize,
    wait: Duration,
) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + wait;
    let mut prefix = vec![0u8; max];
    let mut filled = 0;
    let mut inspector = stream.inspector();

    while filled < max {
        match tokio::time::timeout_at(deadline, inspector.read(&mut prefix[filled..])).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => filled += n,
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                debug!("no more bytes after {:?}, peeked {}", wait, filled);
                break;
            }
        }
    }

    prefix.truncate(filled);
    Ok(prefix)
}

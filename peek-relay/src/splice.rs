use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

#[derive(Default)]
pub struct NaiveSplice {}

impl NaiveSplice {
    /// Copies both directions until each side has shut down its write half.
    pub async fn splice<A, B>(&self, local: &mut A, upstream: &mut B) -> Result<(), io::Error>
    where
        A: AsyncRead + AsyncWrite + Unpin + ?Sized,
        B: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        let (to_upstream, to_local) = tokio::io::copy_bidirectional(local, upstream).await?;
        debug!(
            "spliced {} bytes to upstream, {} bytes back",
            to_upstream, to_local
        );
        Ok(())
    }
}

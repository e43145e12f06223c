use std::io;
use std::io::{Read, Write};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// A reader that copies every byte it reads into a sink before handing it to
/// the caller.
///
/// If the sink fails, the read fails with the sink's error even though the
/// bytes were already pulled out of the inner reader.
#[derive(Debug)]
pub struct TeeReader<R, W> {
    reader: R,
    sink: W,
}

impl<R, W> TeeReader<R, W> {
    pub fn new(reader: R, sink: W) -> Self {
        Self { reader, sink }
    }

    pub fn get_ref(&self) -> (&R, &W) {
        (&self.reader, &self.sink)
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.sink)
    }
}

impl<R: Read, W: Write> Read for TeeReader<R, W> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.read(buf)?;
        if n > 0 {
            self.sink.write_all(&buf[..n])?;
        }
        Ok(n)
    }
}

impl<R, W> AsyncRead for TeeReader<R, W>
where
    R: AsyncRead + Unpin,
    W: Write + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.reader).poll_read(cx, buf))?;

        let read = &buf.filled()[before..];
        if !read.is_empty() {
            this.sink.write_all(read)?;
        }
        Poll::Ready(Ok(()))
    }
}

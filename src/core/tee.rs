/// Debug passthrough that mirrors wire traffic to stdout
///
/// Enabled with `PORTERO_TEE=1`. Wraps a client transport and prints every
/// chunk read or written, tagged with the connection context.
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// True when the tee environment toggle is set.
pub fn enabled() -> bool {
    std::env::var("PORTERO_TEE").map(|v| v == "1").unwrap_or(false)
}

/// Transparent stream wrapper that mirrors all bytes to stdout.
pub struct Tee<S> {
    context: String,
    inner: S,
}

impl<S> Tee<S> {
    pub fn new(context: impl Into<String>, inner: S) -> Self {
        Self {
            context: context.into(),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Tee<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &res {
            let chunk = &buf.filled()[before..];
            if !chunk.is_empty() {
                println!("READ {}: {:?}", this.context, chunk);
            }
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Tee<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let res = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &res {
            if *n > 0 {
                println!("WRIT {}: {:?}", this.context, &buf[..*n]);
            }
        }
        res
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tee_is_transparent() {
        let (near, mut far) = duplex(256);
        let mut teed = Tee::new("test", near);

        teed.write_all(b"hello").await.unwrap();
        let mut got = [0u8; 5];
        far.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");

        far.write_all(b"world").await.unwrap();
        let mut got = [0u8; 5];
        teed.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"world");
    }

    #[test]
    fn test_enabled_reads_env() {
        // Not set in the test environment.
        assert!(!enabled());
    }
}

//! Idle-timeout wrapper for peer streams.
//!
//! A [`Breaker`] closes a stream that has seen no read or write activity
//! for the configured duration. Any completed read or write resets the
//! timer, so a connection that is merely *waiting* on the peer is exactly
//! the kind of connection that eventually gets broken.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Instant, Sleep};

/// A stream wrapper that errors out after a period of inactivity.
pub(crate) struct Breaker<S> {
    /// The wrapped stream.
    inner: S,
    /// How long to tolerate silence.
    timeout: Duration,
    /// The armed deadline; reset by any completed IO.
    deadline: Pin<Box<Sleep>>,
}

impl<S> Breaker<S> {
    /// Wrap `inner`, breaking it after `timeout` of inactivity.
    pub(crate) fn new(inner: S, timeout: Duration) -> Self {
        Breaker {
            inner,
            timeout,
            deadline: Box::pin(sleep(timeout)),
        }
    }

    /// Push the deadline out after successful IO.
    fn reset(&mut self) {
        let timeout = self.timeout;
        self.deadline.as_mut().reset(Instant::now() + timeout);
    }

    /// Poll the idle deadline; returns the error to surface if it lapsed.
    fn poll_idle(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        match self.deadline.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(io::Error::new(
                io::ErrorKind::TimedOut,
                "connection idle too long",
            )),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Breaker<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.reset();
                Poll::Ready(result)
            }
            Poll::Pending => match this.poll_idle(cx) {
                Poll::Ready(e) => Poll::Ready(Err(e)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Breaker<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.reset();
                Poll::Ready(result)
            }
            Poll::Pending => match this.poll_idle(cx) {
                Poll::Ready(e) => Poll::Ready(Err(e)),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list @@ -->

    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    #[tokio::test(start_paused = true)]
    async fn idle_stream_breaks() {
        let (a, _b) = tokio::io::duplex(64);
        let mut broken = Breaker::new(a, Duration::from_secs(300));
        let mut buf = [0_u8; 1];
        let err = broken.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_resets_the_timer() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut broken = Breaker::new(a, Duration::from_secs(300));

        // Traffic at minute four keeps the five-minute breaker alive well
        // past the original deadline.
        let feeder = tokio::spawn(async move {
            for _ in 0_u8..3 {
                tokio::time::sleep(Duration::from_secs(240)).await;
                b.write_all(b"x").await.unwrap();
            }
            // Then fall silent and let the breaker fire.
        });

        let mut buf = [0_u8; 1];
        for _ in 0_u8..3 {
            broken.read_exact(&mut buf).await.unwrap();
        }
        let err = broken.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        feeder.await.unwrap();
    }
}

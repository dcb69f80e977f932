use bytes::Bytes;
use std::fmt;
use std::io::Error;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Size of a single `read_some` chunk.
pub const CHUNK_SIZE: usize = 4096;

/// Anything the proxy can relay over: plain TCP, client-side TLS, server-side
/// TLS, or a TLS session nested inside another one.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Owned, type-erased stream.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Result of pulling one chunk off a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
  /// Bytes that arrived, never empty
  Data(Bytes),
  /// The remote side closed its write half
  StreamEnd,
}

/// Socket
pub struct Socket {
  inner: BoxedStream,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
}

impl fmt::Debug for Socket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Socket")
      .field("read_timeout", &self.read_timeout)
      .field("write_timeout", &self.write_timeout)
      .finish()
  }
}

impl Socket {
  /// Wrap any stream, with optional per-operation timeouts.
  pub fn new<S>(stream: S, read_timeout: Option<Duration>, write_timeout: Option<Duration>) -> Self
  where
    S: AsyncStream + 'static,
  {
    Self {
      inner: Box::new(stream),
      read_timeout,
      write_timeout,
    }
  }
  /// Wrap a stream with no timeouts.
  pub fn plain<S>(stream: S) -> Self
  where
    S: AsyncStream + 'static,
  {
    Self::new(stream, None, None)
  }
  /// Hand the inner stream to a TLS layer, keeping the timeouts.
  pub(crate) async fn upgrade<F, Fut, T>(self, func: F) -> Result<Self, Error>
  where
    F: FnOnce(BoxedStream) -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
    T: AsyncStream + 'static,
  {
    let stream = func(self.inner).await?;
    Ok(Self::new(stream, self.read_timeout, self.write_timeout))
  }
}

impl AsyncRead for Socket {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}
impl AsyncWrite for Socket {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}
impl Socket {
  /// Pulls whatever is available, up to [`CHUNK_SIZE`] bytes.
  ///
  /// Cancel safe: nothing is consumed unless the future completes.
  pub async fn read_some(&mut self) -> std::io::Result<Chunk> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let n = match self.read_timeout {
      None => AsyncReadExt::read(self.deref_mut(), &mut buf).await?,
      Some(t) => tokio::time::timeout(t, AsyncReadExt::read(self.deref_mut(), &mut buf)).await??,
    };
    if n == 0 {
      return Ok(Chunk::StreamEnd);
    }
    buf.truncate(n);
    Ok(Chunk::Data(Bytes::from(buf)))
  }
  /// Attempts to write an entire buffer into this writer.
  pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
    match self.write_timeout {
      None => AsyncWriteExt::write_all(self.deref_mut(), buf).await,
      Some(t) => tokio::time::timeout(t, AsyncWriteExt::write_all(self.deref_mut(), buf)).await?,
    }
  }
  /// Flushes this output stream, ensuring that all intermediately buffered
  /// contents reach their destination.
  pub async fn flush(&mut self) -> std::io::Result<()> {
    match self.write_timeout {
      None => AsyncWriteExt::flush(self.deref_mut()).await,
      Some(t) => tokio::time::timeout(t, AsyncWriteExt::flush(self.deref_mut())).await?,
    }
  }
  /// `write_all` followed by `flush`.
  pub async fn send(&mut self, buf: &[u8]) -> std::io::Result<()> {
    self.write_all(buf).await?;
    self.flush().await
  }
  /// Shuts down the output stream, ensuring that the value can be dropped
  /// cleanly.
  pub async fn shutdown(&mut self) -> std::io::Result<()> {
    match self.write_timeout {
      None => AsyncWriteExt::shutdown(self.deref_mut()).await,
      Some(t) => tokio::time::timeout(t, AsyncWriteExt::shutdown(self.deref_mut())).await?,
    }
  }
}

impl Deref for Socket {
  type Target = BoxedStream;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl DerefMut for Socket {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.inner
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn read_some_reports_stream_end() {
    let (a, b) = tokio::io::duplex(64);
    let mut a = Socket::plain(a);
    let mut b = Socket::plain(b);
    a.send(b"hello").await.unwrap();
    drop(a);
    assert_eq!(
      b.read_some().await.unwrap(),
      Chunk::Data(Bytes::from_static(b"hello"))
    );
    assert_eq!(b.read_some().await.unwrap(), Chunk::StreamEnd);
  }

  #[tokio::test]
  async fn read_timeout_fires() {
    let (_a, b) = tokio::io::duplex(64);
    let mut b = Socket::new(b, Some(Duration::from_millis(20)), None);
    let err = b.read_some().await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
  }
}

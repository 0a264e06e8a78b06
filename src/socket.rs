use std::future::Future;
use std::io::{Error, ErrorKind};
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Sleep;
use tokio_rustls::client::TlsStream;

/// Upstream socket, plain or TLS, with idle timeouts.
///
/// A timeout covers one stalled operation: it is armed when a read (or write)
/// first returns pending and disarmed as soon as that operation makes
/// progress. A connection that keeps trickling bytes never times out; one
/// that goes silent for longer than the timeout fails with
/// [`ErrorKind::TimedOut`].
#[derive(Debug)]
pub struct Socket {
  inner: MaybeTlsStream,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  read_deadline: Option<Pin<Box<Sleep>>>,
  write_deadline: Option<Pin<Box<Sleep>>>,
}
impl Socket {
  pub(crate) fn new(
    maybe_tls_stream: MaybeTlsStream,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
  ) -> Self {
    Self {
      inner: maybe_tls_stream,
      read_timeout,
      write_timeout,
      read_deadline: None,
      write_deadline: None,
    }
  }
  /// Replace both idle timeouts
  pub fn set_timeouts(&mut self, read: Option<Duration>, write: Option<Duration>) {
    self.read_timeout = read;
    self.write_timeout = write;
    self.read_deadline = None;
    self.write_deadline = None;
  }
  /// Read and write idle timeouts
  pub fn timeouts(&self) -> (Option<Duration>, Option<Duration>) {
    (self.read_timeout, self.write_timeout)
  }
  /// Whether the stream has been upgraded to TLS
  pub fn is_tls(&self) -> bool {
    matches!(self.inner, MaybeTlsStream::Tls(_))
  }
  pub(crate) async fn tls<F, Fut>(self, func: F) -> Result<Self, Error>
  where
    F: FnOnce(TcpStream) -> Fut,
    Fut: Future<Output = Result<TlsStream<TcpStream>, Error>>,
  {
    let inner = match self.inner {
      MaybeTlsStream::Tcp(t) => MaybeTlsStream::Tls(Box::new(func(t).await?)),
      MaybeTlsStream::Tls(t) => MaybeTlsStream::Tls(t),
    };
    Ok(Self::new(inner, self.read_timeout, self.write_timeout))
  }
}
/// Plain TCP or client-side TLS
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// TCP
  Tcp(TcpStream),
  /// TLS
  Tls(Box<TlsStream<TcpStream>>),
}

fn poll_deadline(
  deadline: &mut Option<Pin<Box<Sleep>>>,
  timeout: Option<Duration>,
  cx: &mut Context<'_>,
  what: &str,
) -> Poll<Error> {
  let Some(timeout) = timeout else {
    return Poll::Pending;
  };
  let sleep = deadline.get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
  match sleep.as_mut().poll(cx) {
    Poll::Ready(()) => {
      *deadline = None;
      Poll::Ready(Error::new(
        ErrorKind::TimedOut,
        format!("upstream {} timed out after {:?}", what, timeout),
      ))
    }
    Poll::Pending => Poll::Pending,
  }
}

impl AsyncRead for Socket {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    match Pin::new(&mut this.inner).poll_read(cx, buf) {
      Poll::Ready(r) => {
        this.read_deadline = None;
        Poll::Ready(r)
      }
      Poll::Pending => {
        poll_deadline(&mut this.read_deadline, this.read_timeout, cx, "read").map(Err)
      }
    }
  }
}
impl Socket {
  fn poll_write_op<T>(
    &mut self,
    cx: &mut Context<'_>,
    op: impl FnOnce(Pin<&mut MaybeTlsStream>, &mut Context<'_>) -> Poll<Result<T, Error>>,
  ) -> Poll<Result<T, Error>> {
    match op(Pin::new(&mut self.inner), cx) {
      Poll::Ready(r) => {
        self.write_deadline = None;
        Poll::Ready(r)
      }
      Poll::Pending => {
        poll_deadline(&mut self.write_deadline, self.write_timeout, cx, "write").map(Err)
      }
    }
  }
}
impl AsyncWrite for Socket {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    self
      .get_mut()
      .poll_write_op(cx, |inner, cx| inner.poll_write(cx, buf))
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    self
      .get_mut()
      .poll_write_op(cx, |inner, cx| inner.poll_flush(cx))
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    self
      .get_mut()
      .poll_write_op(cx, |inner, cx| inner.poll_shutdown(cx))
  }
}
impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
    }
  }
}
impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
    }
  }
  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
    }
  }
}
// 直接暴露底层 TcpStream 的接口
impl Deref for MaybeTlsStream {
  type Target = TcpStream;

  fn deref(&self) -> &Self::Target {
    match self {
      MaybeTlsStream::Tcp(s) => s,
      MaybeTlsStream::Tls(t) => t.get_ref().0,
    }
  }
}

impl Deref for Socket {
  type Target = MaybeTlsStream;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl DerefMut for Socket {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.inner
  }
}

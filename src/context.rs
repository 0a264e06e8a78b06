//! Per-request state carried through the pipeline

use crate::error::{Error, Result};
use crate::http::{encode_chunk, BodyFraming, BodyReader, RawHeaders, RequestHead, ResponseHead, LAST_CHUNK};
use crate::pipeline::Handler;
use bytes::Bytes;
use http::{HeaderValue, Method, StatusCode, Version};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

/// Boxed future returned by [`RequestContext::next`]
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Rewrites the response head right before it is written
pub type HeadHook = Box<dyn FnOnce(&mut ResponseHead) + Send>;

/// How the request reached the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
  /// Plain HTTP through the proxy port
  Http,
  /// Decrypted by the TLS front
  Https,
}

impl Protocol {
  /// URL scheme
  pub fn scheme(&self) -> &'static str {
    match self {
      Protocol::Http => "http",
      Protocol::Https => "https",
    }
  }
  /// Port implied by the scheme
  pub fn default_port(&self) -> u16 {
    match self {
      Protocol::Http => 80,
      Protocol::Https => 443,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkState {
  Pending,
  Streaming(BodyFraming),
  Finished,
}

/// Outgoing response toward the client.
///
/// Status and headers stay editable until the head is sent: explicitly with
/// [`send_head`](Self::send_head), implicitly by the first
/// [`write`](Self::write), or by [`finish`](Self::finish). The sink picks
/// the body framing itself: an explicit `Content-Length` is honored,
/// otherwise HTTP/1.1 clients get chunked encoding and HTTP/1.0 clients a
/// close-delimited body.
pub struct ResponseSink<'c> {
  writer: &'c mut (dyn AsyncWrite + Send + Unpin),
  head: ResponseHead,
  hooks: Vec<HeadHook>,
  state: SinkState,
  request_method: Method,
  written: u64,
  keep_alive: bool,
}

impl<'c> ResponseSink<'c> {
  pub(crate) fn new(
    writer: &'c mut (dyn AsyncWrite + Send + Unpin),
    request_method: Method,
    version: Version,
    keep_alive: bool,
  ) -> Self {
    let mut head = ResponseHead::new(StatusCode::NOT_FOUND);
    head.version = version;
    Self {
      writer,
      head,
      hooks: Vec::new(),
      state: SinkState::Pending,
      request_method,
      written: 0,
      keep_alive,
    }
  }
  /// Current status
  pub fn status(&self) -> StatusCode {
    self.head.status
  }
  /// Set the status. Ignored once the head is on the wire.
  pub fn set_status(&mut self, status: StatusCode) {
    if !self.is_head_sent() {
      self.head.status = status;
      self.head.reason = None;
    }
  }
  /// Use a custom reason phrase instead of the canonical one
  pub fn set_reason(&mut self, reason: Option<String>) {
    if !self.is_head_sent() {
      self.head.reason = reason;
    }
  }
  /// Response headers
  pub fn headers(&self) -> &RawHeaders {
    &self.head.headers
  }
  /// Mutable response headers. Edits after the head is sent have no effect.
  pub fn headers_mut(&mut self) -> &mut RawHeaders {
    &mut self.head.headers
  }
  /// Whether the status line has been written
  pub fn is_head_sent(&self) -> bool {
    self.state != SinkState::Pending
  }
  /// Whether the response is complete
  pub fn is_finished(&self) -> bool {
    self.state == SinkState::Finished
  }
  /// Body bytes written so far
  pub fn bytes_written(&self) -> u64 {
    self.written
  }
  /// Whether the client connection can serve another request afterwards
  pub fn keep_alive(&self) -> bool {
    self.keep_alive
  }
  /// Force the client connection closed after this response
  pub fn mark_broken(&mut self) {
    self.keep_alive = false;
  }
  /// Register a hook run just before the head is written.
  ///
  /// Hooks run in reverse registration order, so a handler that registers
  /// before calling `next()` sees the head after every inner handler.
  pub fn on_head(&mut self, hook: impl FnOnce(&mut ResponseHead) + Send + 'static) {
    self.hooks.push(Box::new(hook));
  }
  /// Drop whatever status and headers were prepared and start over with `status`
  pub(crate) fn reset(&mut self, status: StatusCode) {
    if !self.is_head_sent() {
      self.head.status = status;
      self.head.reason = None;
      self.head.headers = RawHeaders::new();
    }
  }

  fn body_allowed(&self) -> bool {
    !(self.request_method == Method::HEAD
      || self.head.status.is_informational()
      || self.head.status == StatusCode::NO_CONTENT
      || self.head.status == StatusCode::NOT_MODIFIED)
  }

  /// Write the status line and headers
  pub async fn send_head(&mut self) -> Result<()> {
    if self.is_head_sent() {
      return Ok(());
    }
    while let Some(hook) = self.hooks.pop() {
      hook(&mut self.head);
    }
    let framing = if !self.body_allowed() {
      BodyFraming::Empty
    } else {
      self.head.headers.remove("transfer-encoding");
      let length = self
        .head
        .headers
        .get_str("content-length")
        .and_then(|v| v.trim().parse::<u64>().ok());
      match length {
        Some(n) => BodyFraming::Length(n),
        None => {
          self.head.headers.remove("content-length");
          if self.head.version == Version::HTTP_11 {
            self
              .head
              .headers
              .push("Transfer-Encoding", HeaderValue::from_static("chunked"));
            BodyFraming::Chunked
          } else {
            self.keep_alive = false;
            BodyFraming::CloseDelimited
          }
        }
      }
    };
    if !self.keep_alive {
      self
        .head
        .headers
        .set("Connection", HeaderValue::from_static("close"));
    }
    self.state = SinkState::Streaming(framing);
    if let Err(e) = self.writer.write_all(&self.head.encode()).await {
      self.keep_alive = false;
      return Err(e.into());
    }
    Ok(())
  }

  /// Write body bytes, sending the head first if needed
  pub async fn write(&mut self, data: &[u8]) -> Result<()> {
    self.send_head().await?;
    let framing = match self.state {
      SinkState::Streaming(framing) => framing,
      _ => return Err(Error::other("response already finished")),
    };
    if data.is_empty() {
      return Ok(());
    }
    let result = match framing {
      BodyFraming::Empty => return Ok(()),
      BodyFraming::Length(n) => {
        if self.written + data.len() as u64 > n {
          self.keep_alive = false;
          return Err(Error::other("response body exceeds Content-Length"));
        }
        self.writer.write_all(data).await
      }
      BodyFraming::Chunked => self.writer.write_all(&encode_chunk(data)).await,
      BodyFraming::CloseDelimited => self.writer.write_all(data).await,
    };
    if let Err(e) = result {
      self.keep_alive = false;
      return Err(e.into());
    }
    self.written += data.len() as u64;
    Ok(())
  }

  /// Complete the response. An untouched response goes out with an empty body.
  pub async fn finish(&mut self) -> Result<()> {
    if self.is_finished() {
      return Ok(());
    }
    if !self.is_head_sent() && self.body_allowed() && !self.head.headers.contains("content-length") {
      self
        .head
        .headers
        .set("Content-Length", HeaderValue::from_static("0"));
    }
    self.send_head().await?;
    let result = match self.state {
      SinkState::Streaming(BodyFraming::Chunked) => self.writer.write_all(LAST_CHUNK).await,
      SinkState::Streaming(BodyFraming::Length(n)) if self.written < n => {
        // short body: the client can only detect it by the close
        self.keep_alive = false;
        Ok(())
      }
      _ => Ok(()),
    };
    self.state = SinkState::Finished;
    let flushed = match result {
      Ok(()) => self.writer.flush().await,
      Err(e) => Err(e),
    };
    if let Err(e) = flushed {
      self.keep_alive = false;
      return Err(e.into());
    }
    Ok(())
  }

  /// Send a complete response with a fixed body
  pub async fn send(&mut self, status: StatusCode, body: impl Into<Bytes>) -> Result<()> {
    let body = body.into();
    self.set_status(status);
    self
      .head
      .headers
      .set("Content-Length", HeaderValue::from(body.len()));
    self.write(&body).await?;
    self.finish().await
  }
}

/// State of one in-flight request.
///
/// Handlers receive it mutably, inspect the request, read its body, shape the
/// response, and delegate inward with [`next`](Self::next).
pub struct RequestContext<'c> {
  request: RequestHead,
  reader: &'c mut (dyn AsyncBufRead + Send + Unpin),
  body: BodyReader,
  continue_sent: bool,
  response: ResponseSink<'c>,
  protocol: Protocol,
  peer: Option<SocketAddr>,
  handlers: Arc<[Arc<dyn Handler>]>,
  /// Index of the next handler to invoke
  position: usize,
  /// Frame currently executing: 0 is the driver, `i + 1` is handler `i`
  frame: usize,
  /// Per frame: whether that frame already called `next()`
  next_called: Vec<bool>,
  aborted: bool,
  extensions: http::Extensions,
}

impl<'c> RequestContext<'c> {
  pub(crate) fn new(
    request: RequestHead,
    reader: &'c mut (dyn AsyncBufRead + Send + Unpin),
    writer: &'c mut (dyn AsyncWrite + Send + Unpin),
    protocol: Protocol,
    peer: Option<SocketAddr>,
    handlers: Arc<[Arc<dyn Handler>]>,
  ) -> Result<Self> {
    let framing = request.body_framing()?;
    let response = ResponseSink::new(
      writer,
      request.method.clone(),
      request.version,
      request.keep_alive(),
    );
    let frames = handlers.len() + 1;
    Ok(Self {
      request,
      reader,
      body: BodyReader::new(framing),
      continue_sent: false,
      response,
      protocol,
      peer,
      handlers,
      position: 0,
      frame: 0,
      next_called: vec![false; frames],
      aborted: false,
      extensions: http::Extensions::new(),
    })
  }

  /// Invoke the next handler in the chain and wait for it, and for
  /// everything it awaits through its own `next()`, to complete.
  ///
  /// Resolves immediately once the context is aborted or the chain is
  /// exhausted. Each handler may call it at most once; a second call fails
  /// with [`Error::NextCalledTwice`].
  pub fn next(&mut self) -> HandlerFuture<'_> {
    Box::pin(async move {
      let frame = self.frame;
      if self.next_called[frame] {
        return Err(Error::next_called_twice(frame));
      }
      self.next_called[frame] = true;
      if self.aborted || self.position >= self.handlers.len() {
        return Ok(());
      }
      let handler = self.handlers[self.position].clone();
      self.position += 1;
      self.frame = self.position;
      let result = handler.handle(self).await;
      self.frame = frame;
      result
    })
  }

  /// Stop the chain: no further handler runs, and pending `next()` calls
  /// resolve without invoking anything. Idempotent.
  pub fn abort(&mut self) {
    self.aborted = true;
    self.position = self.handlers.len();
  }

  /// Set the response status and abort
  pub fn abort_with_status(&mut self, status: StatusCode) {
    self.response.set_status(status);
    self.abort();
  }

  /// Whether the chain has been aborted
  pub fn is_aborted(&self) -> bool {
    self.aborted
  }

  /// Index of the next handler `next()` would invoke
  pub fn position(&self) -> usize {
    self.position
  }

  /// Request head as received
  pub fn request(&self) -> &RequestHead {
    &self.request
  }

  /// Mutable request head, for handlers that rewrite before forwarding
  pub fn request_mut(&mut self) -> &mut RequestHead {
    &mut self.request
  }

  /// Response under construction
  pub fn response(&self) -> &ResponseSink<'c> {
    &self.response
  }

  /// Mutable response
  pub fn response_mut(&mut self) -> &mut ResponseSink<'c> {
    &mut self.response
  }

  /// `http` or `https`
  pub fn protocol(&self) -> Protocol {
    self.protocol
  }

  /// Client address, when known
  pub fn peer(&self) -> Option<SocketAddr> {
    self.peer
  }

  /// Typed scratch space shared by the handlers of this request
  pub fn extensions(&self) -> &http::Extensions {
    &self.extensions
  }

  /// Mutable scratch space
  pub fn extensions_mut(&mut self) -> &mut http::Extensions {
    &mut self.extensions
  }

  /// Framing of the request body
  pub fn body_framing(&self) -> BodyFraming {
    self.body.framing()
  }

  /// Whether the request body has been fully read
  pub fn body_consumed(&self) -> bool {
    self.body.is_done()
  }

  /// Next slice of the request body. Answers `Expect: 100-continue` first.
  pub async fn read_body_chunk(&mut self) -> Result<Option<Bytes>> {
    if self.body.is_done() {
      return Ok(None);
    }
    if self.request.expects_continue() && !self.continue_sent && !self.response.is_head_sent() {
      self.continue_sent = true;
      self
        .response
        .writer
        .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
        .await?;
    }
    self.body.next_chunk(&mut *self.reader).await
  }

  /// Read the whole request body, failing if it exceeds `limit` bytes
  pub async fn read_body(&mut self, limit: usize) -> Result<Bytes> {
    let mut body = Vec::new();
    while let Some(chunk) = self.read_body_chunk().await? {
      if body.len() + chunk.len() > limit {
        return Err(Error::invalid_request("request body too large"));
      }
      body.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(body))
  }

  /// Called by the driver once the chain has unwound.
  ///
  /// Returns whether the client connection can carry another request.
  pub(crate) async fn finalize(&mut self, outcome: Result<()>) -> bool {
    if let Err(e) = outcome {
      tracing::warn!(
        "{} {} failed in pipeline: {}",
        self.request.method,
        self.request.target,
        e
      );
      if self.response.is_head_sent() {
        self.response.mark_broken();
        return false;
      }
      self.response.reset(StatusCode::INTERNAL_SERVER_ERROR);
      self.response.mark_broken();
    }
    if self.response.finish().await.is_err() {
      return false;
    }
    if !self.response.keep_alive() {
      return false;
    }
    if self.body.is_done() {
      return true;
    }
    if self.request.expects_continue() && !self.continue_sent {
      // the client holds the body back until told to continue
      return false;
    }
    loop {
      match self.body.next_chunk(&mut *self.reader).await {
        Ok(Some(_)) => continue,
        Ok(None) => return true,
        Err(_) => return false,
      }
    }
  }
}

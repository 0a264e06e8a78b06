//! Onion-model request pipeline
//!
//! Handlers run in registration order. Each one may do work before calling
//! [`RequestContext::next`], which runs the rest of the chain, and after it
//! returns:
//!
//! ```rust,no_run
//! use vproxy::{Handler, RequestContext, Result};
//!
//! struct Timing;
//!
//! #[async_trait::async_trait]
//! impl Handler for Timing {
//!   async fn handle(&self, ctx: &mut RequestContext<'_>) -> Result<()> {
//!     let started = std::time::Instant::now();
//!     ctx.next().await?;
//!     tracing::info!("{} took {:?}", ctx.request().target, started.elapsed());
//!     Ok(())
//!   }
//! }
//! ```

use crate::context::{Protocol, RequestContext};
use crate::error::Result;
use crate::http::{read_head, RequestHead, MAX_HEAD_SIZE};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// A pipeline stage.
///
/// A handler must either call `ctx.next()` exactly once or end the chain
/// with `ctx.abort()` / `ctx.abort_with_status()`.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
  /// Process one request
  async fn handle(&self, ctx: &mut RequestContext<'_>) -> Result<()>;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
  async fn handle(&self, ctx: &mut RequestContext<'_>) -> Result<()> {
    (**self).handle(ctx).await
  }
}

/// Ordered handler registry
#[derive(Default, Clone)]
pub struct Pipeline {
  handlers: Vec<Arc<dyn Handler>>,
}

impl Pipeline {
  /// Empty pipeline
  pub fn new() -> Self {
    Self::default()
  }
  /// Append a handler; it runs after every handler added before it
  pub fn add_handler(&mut self, handler: impl Handler) -> &mut Self {
    self.handlers.push(Arc::new(handler));
    self
  }
  /// Append an already shared handler
  pub fn add_shared(&mut self, handler: Arc<dyn Handler>) -> &mut Self {
    self.handlers.push(handler);
    self
  }
  /// Number of registered handlers
  pub fn len(&self) -> usize {
    self.handlers.len()
  }
  /// Whether no handler is registered
  pub fn is_empty(&self) -> bool {
    self.handlers.is_empty()
  }
  /// Freeze the registry into a driver
  pub fn into_dispatcher(self) -> Dispatcher {
    Dispatcher {
      handlers: self.handlers.into(),
    }
  }
}

/// Drives requests through a frozen handler chain.
pub struct Dispatcher {
  handlers: Arc<[Arc<dyn Handler>]>,
}

impl std::fmt::Debug for Dispatcher {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Dispatcher")
      .field("handlers", &self.handlers.len())
      .finish()
  }
}

impl Dispatcher {
  /// Run one request through the chain and finalize its response.
  ///
  /// The response is always completed: a handler error becomes a `500` if
  /// nothing was sent yet, otherwise the connection is marked for closing.
  /// Returns whether the client connection can carry another request.
  pub async fn dispatch(
    &self,
    head: RequestHead,
    reader: &mut (dyn AsyncBufRead + Send + Unpin),
    writer: &mut (dyn AsyncWrite + Send + Unpin),
    protocol: Protocol,
    peer: Option<SocketAddr>,
  ) -> Result<bool> {
    tracing::debug!(
      "{} {} {} from {:?}",
      protocol.scheme(),
      head.method,
      head.target,
      peer
    );
    let mut ctx = RequestContext::new(head, reader, writer, protocol, peer, self.handlers.clone())?;
    let outcome = ctx.next().await;
    Ok(ctx.finalize(outcome).await)
  }

  /// Serve requests from `stream` until the client or a response closes it.
  pub async fn serve<S>(&self, stream: S, protocol: Protocol, peer: Option<SocketAddr>) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Send + Unpin,
  {
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    loop {
      let Some(raw) = read_head(&mut reader, MAX_HEAD_SIZE).await? else {
        break;
      };
      let head = match RequestHead::parse(&raw) {
        Ok(Some((head, _))) if !head.is_connect() => head,
        _ => {
          writer
            .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await?;
          break;
        }
      };
      match self
        .dispatch(head, &mut reader, &mut writer, protocol, peer)
        .await
      {
        Ok(true) => continue,
        Ok(false) => break,
        Err(e) => {
          writer
            .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await
            .ok();
          return Err(e);
        }
      }
    }
    writer.shutdown().await.ok();
    Ok(())
  }
}

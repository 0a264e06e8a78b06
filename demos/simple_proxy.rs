//! MITM proxy that logs every exchange and tags responses
//!
//! To run:
//! ```bash
//! RUST_LOG=vproxy=debug cargo run --example simple_proxy
//! ```
//!
//! Then point a client at it:
//! ```bash
//! curl --proxy http://127.0.0.1:8080 --cacert /tmp/vproxy-root-ca.crt https://example.com/
//! ```

use async_trait::async_trait;
use std::time::Instant;
use tracing_subscriber::EnvFilter;
use vproxy::{Handler, HeaderValue, MitmConfig, MitmProxy, RequestContext, Result};

/// Logs method, URL, status and elapsed time once the response is done
struct AccessLog;

#[async_trait]
impl Handler for AccessLog {
  async fn handle(&self, ctx: &mut RequestContext<'_>) -> Result<()> {
    let started = Instant::now();
    let line = format!(
      "{} {}://{}{}",
      ctx.request().method,
      ctx.protocol().scheme(),
      ctx.request().host().unwrap_or("-"),
      ctx.request().target
    );
    let result = ctx.next().await;
    tracing::info!(
      "{} -> {} ({} bytes, {:?})",
      line,
      ctx.response().status(),
      ctx.response().bytes_written(),
      started.elapsed()
    );
    result
  }
}

/// Adds a header to every response before its head goes out
struct TagResponses;

#[async_trait]
impl Handler for TagResponses {
  async fn handle(&self, ctx: &mut RequestContext<'_>) -> Result<()> {
    ctx.response_mut().on_head(|head| {
      head
        .headers
        .set("x-intercepted-by", HeaderValue::from_static("vproxy"));
    });
    ctx.next().await
  }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let mut config = MitmConfig::default();
  config.install_root = true;
  if let Ok(upstream) = std::env::var("VPROXY_UPSTREAM") {
    config = config.upstream_proxy(vproxy::ProxyResolver::fixed(upstream));
  }

  let mut proxy = MitmProxy::new(config).await?;
  proxy.add_handler(AccessLog).add_handler(TagResponses);

  let bound = proxy.bind().await?;
  println!("Proxy listening on {}", bound.proxy_addr());
  bound.run().await?;
  Ok(())
}

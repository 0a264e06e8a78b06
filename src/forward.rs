//! Terminal handler relaying requests to the real origin

use crate::config::ProxyResolver;
use crate::connector::{Connector, ConnectorBuilder};
use crate::context::{Protocol, RequestContext};
use crate::error::{Error, Result};
use crate::http::{
  encode_chunk, read_head, BodyFraming, BodyReader, RawHeaders, RequestHead, ResponseHead,
  LAST_CHUNK, MAX_HEAD_SIZE,
};
#[cfg(feature = "gzip")]
use crate::http::MAX_DECODED_BODY;
use crate::pipeline::Handler;
use crate::pool::{Checkout, ConnectionPool, PoolKey, PooledConnection, DEFAULT_IDLE_TIMEOUT};
use crate::proxy::UpstreamProxy;
use async_trait::async_trait;
use http::{HeaderValue, StatusCode, Version};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use rustls_pki_types::CertificateDer;

/// Settings of the [`UpstreamForwarder`]
#[derive(Clone, Debug)]
pub struct ForwarderConfig {
  /// Socket ceiling of the http pool
  pub max_http_sockets: usize,
  /// Socket ceiling of the https pool
  pub max_https_sockets: usize,
  /// Connect timeout, and idle timeout of every upstream read or write
  pub request_timeout: Duration,
  /// Chained proxy, resolved per request
  pub upstream_proxy: Option<ProxyResolver>,
  /// Verify origin certificates
  pub verify_upstream_certs: bool,
  /// Extra roots trusted when verifying
  pub extra_roots: Vec<CertificateDer<'static>>,
  /// Host to address mapping consulted before DNS
  pub resolve_overrides: HashMap<String, SocketAddr>,
  /// Decode gzip and deflate bodies (needs the `gzip` feature)
  pub decode_content: bool,
  /// How long an unused connection stays pooled
  pub pool_idle_timeout: Duration,
}

impl Default for ForwarderConfig {
  fn default() -> Self {
    Self {
      max_http_sockets: 256,
      max_https_sockets: 256,
      request_timeout: Duration::from_secs(30),
      upstream_proxy: None,
      verify_upstream_certs: false,
      extra_roots: vec![],
      resolve_overrides: HashMap::new(),
      decode_content: false,
      pool_idle_timeout: DEFAULT_IDLE_TIMEOUT,
    }
  }
}

/// Forwarder counters
#[derive(Debug, Default)]
pub struct ForwarderStats {
  connections_opened: AtomicU64,
  requests_forwarded: AtomicU64,
  upstream_failures: AtomicU64,
  rejected_hosts: AtomicU64,
}

impl ForwarderStats {
  /// Upstream connections opened (pool misses)
  pub fn connections_opened(&self) -> u64 {
    self.connections_opened.load(Ordering::SeqCst)
  }
  /// Responses relayed completely
  pub fn requests_forwarded(&self) -> u64 {
    self.requests_forwarded.load(Ordering::SeqCst)
  }
  /// Requests that failed upstream
  pub fn upstream_failures(&self) -> u64 {
    self.upstream_failures.load(Ordering::SeqCst)
  }
  /// Requests refused for their Host
  pub fn rejected_hosts(&self) -> u64 {
    self.rejected_hosts.load(Ordering::SeqCst)
  }
}

/// Real destination of an intercepted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
  /// TLS toward the origin
  pub https: bool,
  /// Host without brackets
  pub host: String,
  /// Port
  pub port: u16,
  /// Origin-form path and query
  pub path: String,
  /// Host header value
  pub authority: String,
}

impl UpstreamTarget {
  /// Rebuild the target from an absolute-form request line, or from the
  /// `Host` header and the protocol the request arrived on.
  ///
  /// The host must contain a dot or be an IP literal.
  pub fn from_request(head: &RequestHead, protocol: Protocol) -> Result<Self> {
    let uri: http::Uri = head
      .target
      .parse()
      .map_err(|_| Error::invalid_request(format!("invalid request target {}", head.target)))?;
    let (https, authority) = match (uri.scheme_str(), uri.authority()) {
      (Some(scheme), Some(auth)) => (
        scheme.eq_ignore_ascii_case("https"),
        auth.as_str().to_string(),
      ),
      _ => (
        protocol == Protocol::Https,
        head
          .host()
          .ok_or_else(|| Error::invalid_request("missing Host header"))?
          .trim()
          .to_string(),
      ),
    };
    let authority = match authority.rsplit_once('@') {
      Some((_, host)) => host.to_string(),
      None => authority,
    };
    let default_port = if https { 443 } else { 80 };
    let (host, port) = split_authority(&authority, default_port)?;
    if !is_routable_host(&host) {
      return Err(Error::invalid_request(format!("refusing host {:?}", host)));
    }
    let path = uri
      .path_and_query()
      .map(|p| p.as_str())
      .filter(|p| !p.is_empty())
      .unwrap_or("/")
      .to_string();
    Ok(Self {
      https,
      host,
      port,
      path,
      authority,
    })
  }

  /// Absolute URL
  pub fn url(&self) -> String {
    format!(
      "{}://{}{}",
      if self.https { "https" } else { "http" },
      self.authority,
      self.path
    )
  }
}

fn split_authority(authority: &str, default_port: u16) -> Result<(String, u16)> {
  let invalid = || Error::invalid_request(format!("invalid host {:?}", authority));
  if let Some(rest) = authority.strip_prefix('[') {
    let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
    let port = match tail.strip_prefix(':') {
      Some(port) => port.parse().map_err(|_| invalid())?,
      None if tail.is_empty() => default_port,
      None => return Err(invalid()),
    };
    return Ok((host.to_string(), port));
  }
  match authority.rsplit_once(':') {
    Some((host, port)) => Ok((host.to_string(), port.parse().map_err(|_| invalid())?)),
    None => Ok((authority.to_string(), default_port)),
  }
}

/// A dotted name or an IP literal
pub fn is_routable_host(host: &str) -> bool {
  !host.is_empty() && (host.contains('.') || host.parse::<IpAddr>().is_ok())
}

/// Relays each request to its origin over pooled connections.
///
/// It ends the chain: after it runs the context is aborted. Upstream
/// failures become `503 Service Unavailable` when nothing was sent yet, and
/// a broken client connection otherwise. Nothing is retried.
pub struct UpstreamForwarder {
  config: ForwarderConfig,
  connector: Connector,
  http_pool: ConnectionPool,
  https_pool: ConnectionPool,
  stats: Arc<ForwarderStats>,
}

impl std::fmt::Debug for UpstreamForwarder {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("UpstreamForwarder")
      .field("config", &self.config)
      .field("stats", &self.stats)
      .finish()
  }
}

impl UpstreamForwarder {
  /// Forwarder with its own pools and connector
  pub fn new(config: ForwarderConfig) -> Result<Self> {
    let mut builder = ConnectorBuilder::default()
      .certs_verification(config.verify_upstream_certs)
      .connect_timeout(Some(config.request_timeout))
      .read_timeout(Some(config.request_timeout))
      .write_timeout(Some(config.request_timeout))
      .resolve_overrides(config.resolve_overrides.clone());
    for root in &config.extra_roots {
      builder = builder.root_certificate(root.clone());
    }
    Ok(Self {
      connector: builder.build()?,
      http_pool: ConnectionPool::with_idle_timeout(config.max_http_sockets, config.pool_idle_timeout),
      https_pool: ConnectionPool::with_idle_timeout(config.max_https_sockets, config.pool_idle_timeout),
      stats: Arc::new(ForwarderStats::default()),
      config,
    })
  }

  /// Shared counters
  pub fn stats(&self) -> Arc<ForwarderStats> {
    self.stats.clone()
  }

  /// Settings in use
  pub fn config(&self) -> &ForwarderConfig {
    &self.config
  }

  async fn checkout(
    &self,
    target: &UpstreamTarget,
    proxy: Option<&UpstreamProxy>,
  ) -> Result<PooledConnection> {
    let pool = if target.https {
      &self.https_pool
    } else {
      &self.http_pool
    };
    let key = PoolKey::new(
      target.https,
      &target.host,
      target.port,
      proxy.map(|p| p.uri().to_string()),
    );
    match pool.checkout(&key).await {
      Checkout::Reused(conn) => Ok(conn),
      Checkout::Fresh(permit) => {
        let socket = tokio::time::timeout(
          self.config.request_timeout,
          self
            .connector
            .connect(target.https, &target.host, target.port, proxy),
        )
        .await
        .map_err(|_| Error::timeout(format!("connecting to {}", target.url())))??;
        self.stats.connections_opened.fetch_add(1, Ordering::SeqCst);
        Ok(pool.attach(key, socket, permit))
      }
    }
  }

  fn outgoing_head(
    request: &RequestHead,
    framing: BodyFraming,
    target: &UpstreamTarget,
    proxy: Option<&UpstreamProxy>,
  ) -> Result<RequestHead> {
    let mut headers = request.headers.clone();
    headers.strip_hop_by_hop();
    headers.remove("expect");
    if !headers.contains("host") {
      let host = HeaderValue::from_str(&target.authority)
        .map_err(|_| Error::invalid_request("invalid Host"))?;
      headers.push("Host", host);
    }
    if framing == BodyFraming::Chunked {
      // the body is re-chunked, so a Content-Length would disagree with it
      headers.remove("content-length");
      headers.push("Transfer-Encoding", HeaderValue::from_static("chunked"));
    }
    let mut line_target = target.path.clone();
    if let (false, Some(proxy)) = (target.https, proxy) {
      line_target = target.url();
      if let Some(auth) = proxy.authorization() {
        headers.push("Proxy-Authorization", auth.clone());
      }
    }
    Ok(RequestHead {
      method: request.method.clone(),
      target: line_target,
      version: Version::HTTP_11,
      headers,
    })
  }

  /// Forward one exchange. Returns the upstream connection when it can be
  /// pooled again.
  async fn exchange(
    &self,
    ctx: &mut RequestContext<'_>,
    target: &UpstreamTarget,
  ) -> Result<Option<PooledConnection>> {
    let proxy = match &self.config.upstream_proxy {
      Some(resolver) => resolver.resolve().await?,
      None => None,
    };
    let framing = ctx.body_framing();
    let method = ctx.request().method.clone();
    let head = Self::outgoing_head(ctx.request(), framing, target, proxy.as_ref())?;
    let mut conn = self.checkout(target, proxy.as_ref()).await?;
    tracing::debug!("forwarding {} {}", method, target.url());

    let upstream = conn.reader.get_mut();
    upstream.write_all(&head.encode()).await?;
    while let Some(chunk) = ctx.read_body_chunk().await? {
      if framing == BodyFraming::Chunked {
        upstream.write_all(&encode_chunk(&chunk)).await?;
      } else {
        upstream.write_all(&chunk).await?;
      }
    }
    if framing == BodyFraming::Chunked {
      upstream.write_all(LAST_CHUNK).await?;
    }
    upstream.flush().await?;

    let response = loop {
      let raw = read_head(&mut conn.reader, MAX_HEAD_SIZE)
        .await?
        .ok_or_else(|| Error::connection_error("upstream closed before responding"))?;
      let (response, _) = ResponseHead::parse(&raw)?
        .ok_or_else(|| Error::connection_error("truncated upstream response head"))?;
      if response.status.is_informational() {
        continue;
      }
      break response;
    };
    let framing = response.body_framing(&method)?;
    let reusable = response.keep_alive() && framing != BodyFraming::CloseDelimited;
    let mut headers = response.headers.clone();
    headers.strip_hop_by_hop();
    if matches!(framing, BodyFraming::Chunked | BodyFraming::CloseDelimited) {
      headers.remove("content-length");
    }
    let mut body = BodyReader::new(framing);

    #[cfg(feature = "gzip")]
    let mut buffered = Vec::new();
    #[cfg(feature = "gzip")]
    if self.config.decode_content && method != http::Method::HEAD {
      if let Some(encoding) = headers.get_str("content-encoding").map(str::to_owned) {
        let mut complete = true;
        while let Some(chunk) = body.next_chunk(&mut conn.reader).await? {
          buffered.extend_from_slice(&chunk);
          if buffered.len() > MAX_DECODED_BODY {
            complete = false;
            break;
          }
        }
        if complete {
          let mut raw = std::mem::take(&mut buffered);
          if let Some(decoded) = crate::http::decode_body(&encoding, &raw, MAX_DECODED_BODY)? {
            for name in ["content-encoding", "content-length", "transfer-encoding", "etag"] {
              headers.remove(name);
            }
            headers.push("Content-Length", HeaderValue::from(decoded.len()));
            raw = decoded;
          }
          relay_head(ctx, &response, headers);
          ctx.response_mut().write(&raw).await?;
          ctx.response_mut().finish().await?;
          return Ok(reusable.then_some(conn));
        }
        tracing::debug!("{} body too large to decode, relaying as is", target.url());
      }
    }

    relay_head(ctx, &response, headers);
    ctx.response_mut().send_head().await?;
    #[cfg(feature = "gzip")]
    if !buffered.is_empty() {
      ctx.response_mut().write(&buffered).await?;
    }
    while let Some(chunk) = body.next_chunk(&mut conn.reader).await? {
      ctx.response_mut().write(&chunk).await?;
    }
    ctx.response_mut().finish().await?;
    Ok((reusable && body.is_done()).then_some(conn))
  }
}

fn relay_head(ctx: &mut RequestContext<'_>, response: &ResponseHead, headers: RawHeaders) {
  let sink = ctx.response_mut();
  sink.set_status(response.status);
  sink.set_reason(response.reason.clone());
  for (name, value) in headers.iter() {
    sink.headers_mut().push(name, value.clone());
  }
}

#[async_trait]
impl Handler for UpstreamForwarder {
  async fn handle(&self, ctx: &mut RequestContext<'_>) -> Result<()> {
    let target = match UpstreamTarget::from_request(ctx.request(), ctx.protocol()) {
      Ok(target) => target,
      Err(e) => {
        self.stats.rejected_hosts.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("not forwarding {}: {}", ctx.request().target, e);
        ctx.abort_with_status(StatusCode::NOT_FOUND);
        return Ok(());
      }
    };
    match self.exchange(ctx, &target).await {
      Ok(conn) => {
        self.stats.requests_forwarded.fetch_add(1, Ordering::SeqCst);
        if let Some(conn) = conn {
          let pool = if target.https {
            &self.https_pool
          } else {
            &self.http_pool
          };
          pool.checkin(conn);
        }
      }
      Err(e) => {
        self.stats.upstream_failures.fetch_add(1, Ordering::SeqCst);
        tracing::warn!("upstream {} failed: {}", target.url(), e);
        ctx.abort();
        if ctx.response().is_head_sent() {
          // a partial body must not be terminated as if complete
          return Err(e);
        }
        let sink = ctx.response_mut();
        sink.reset(StatusCode::SERVICE_UNAVAILABLE);
        sink.mark_broken();
      }
    }
    ctx.abort();
    Ok(())
  }
}

//! Proxy configuration

use crate::error::Result;
use crate::forward::ForwarderConfig;
use crate::proxy::UpstreamProxy;
use crate::store::{default_store_path, CertStore};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Produces the chained proxy URL for one request, or `None` to go direct.
///
/// Consulted on every upstream request, so a rotating proxy pool can hand
/// out a different exit each time.
#[derive(Clone)]
pub struct ProxyResolver {
  inner: Arc<dyn Fn() -> BoxFuture<'static, Option<String>> + Send + Sync>,
}

impl std::fmt::Debug for ProxyResolver {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("ProxyResolver")
  }
}

impl ProxyResolver {
  /// Always the same proxy
  pub fn fixed(url: impl Into<String>) -> Self {
    let url = url.into();
    Self::from_fn(move || {
      let url = url.clone();
      async move { Some(url) }
    })
  }

  /// Resolve with an async closure
  pub fn from_fn<F, Fut>(f: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<String>> + Send + 'static,
  {
    Self {
      inner: Arc::new(move || Box::pin(f())),
    }
  }

  /// Ask for the proxy to use now and parse it
  pub async fn resolve(&self) -> Result<Option<UpstreamProxy>> {
    match (self.inner)().await {
      Some(url) => Ok(Some(UpstreamProxy::parse(url)?)),
      None => Ok(None),
    }
  }
}

/// Configuration for [`MitmProxy`](crate::MitmProxy)
#[derive(Clone, Debug)]
pub struct MitmConfig {
  /// Interface both listeners bind to
  pub listen_host: IpAddr,
  /// Port clients configure as their proxy
  pub tunnel_port: u16,
  /// Port of the loopback TLS front, 0 for an ephemeral one
  pub fake_tls_port: u16,
  /// Certificate directory used when `cert_store` is not set
  pub ca_storage_path: PathBuf,
  /// Custom certificate persistence
  pub cert_store: Option<Arc<dyn CertStore>>,
  /// Where the root certificate is exported
  pub root_export_path: PathBuf,
  /// Export the root and print trust-store instructions at startup
  pub install_root: bool,
  /// Socket ceiling for plain http origins
  pub max_http_sockets: usize,
  /// Socket ceiling for https origins
  pub max_https_sockets: usize,
  /// Upstream connect and idle timeout
  pub request_timeout: Duration,
  /// Chained proxy, resolved per request
  pub upstream_proxy: Option<ProxyResolver>,
  /// Verify origin certificates against the platform trust store
  pub verify_upstream_certs: bool,
  /// Fixed host to address mapping consulted before DNS
  pub resolve_overrides: HashMap<String, SocketAddr>,
  /// Decode gzip and deflate response bodies
  pub decode_content: bool,
  /// Append the upstream forwarder after the user handlers
  pub forward_upstream: bool,
}

impl Default for MitmConfig {
  fn default() -> Self {
    Self {
      listen_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
      tunnel_port: 8080,
      fake_tls_port: 0,
      ca_storage_path: default_store_path(),
      cert_store: None,
      root_export_path: std::env::temp_dir().join(crate::ca::ROOT_EXPORT_FILE),
      install_root: false,
      max_http_sockets: 256,
      max_https_sockets: 256,
      request_timeout: Duration::from_secs(30),
      upstream_proxy: None,
      verify_upstream_certs: false,
      resolve_overrides: HashMap::new(),
      decode_content: false,
      forward_upstream: true,
    }
  }
}

impl MitmConfig {
  /// Set the proxy port
  pub fn tunnel_port(mut self, port: u16) -> Self {
    self.tunnel_port = port;
    self
  }
  /// Set the TLS front port
  pub fn fake_tls_port(mut self, port: u16) -> Self {
    self.fake_tls_port = port;
    self
  }
  /// Use a custom certificate store
  pub fn cert_store(mut self, store: Arc<dyn CertStore>) -> Self {
    self.cert_store = Some(store);
    self
  }
  /// Set the certificate directory
  pub fn ca_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.ca_storage_path = path.into();
    self
  }
  /// Set both socket ceilings
  pub fn max_sockets(mut self, http: usize, https: usize) -> Self {
    self.max_http_sockets = http;
    self.max_https_sockets = https;
    self
  }
  /// Set the upstream timeout
  pub fn request_timeout(mut self, timeout: Duration) -> Self {
    self.request_timeout = timeout;
    self
  }
  /// Chain every upstream connection through a proxy
  pub fn upstream_proxy(mut self, resolver: ProxyResolver) -> Self {
    self.upstream_proxy = Some(resolver);
    self
  }
  /// Send requests for `host` to `addr`
  pub fn resolve(mut self, host: impl Into<String>, addr: SocketAddr) -> Self {
    self.resolve_overrides.insert(host.into(), addr);
    self
  }
  /// Proxy listener address
  pub fn tunnel_addr(&self) -> SocketAddr {
    SocketAddr::new(self.listen_host, self.tunnel_port)
  }
  /// TLS front address. Always loopback: only the tunnel acceptor talks to it.
  pub fn front_addr(&self) -> SocketAddr {
    let loopback = if self.listen_host.is_ipv6() {
      IpAddr::V6(Ipv6Addr::LOCALHOST)
    } else {
      IpAddr::V4(Ipv4Addr::LOCALHOST)
    };
    SocketAddr::new(loopback, self.fake_tls_port)
  }
  /// Forwarder settings derived from this configuration
  pub fn forwarder_config(&self) -> ForwarderConfig {
    ForwarderConfig {
      max_http_sockets: self.max_http_sockets,
      max_https_sockets: self.max_https_sockets,
      request_timeout: self.request_timeout,
      upstream_proxy: self.upstream_proxy.clone(),
      verify_upstream_certs: self.verify_upstream_certs,
      resolve_overrides: self.resolve_overrides.clone(),
      decode_content: self.decode_content,
      ..ForwarderConfig::default()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = MitmConfig::default();
    assert_eq!(config.tunnel_addr(), "127.0.0.1:8080".parse().unwrap());
    assert_eq!(config.fake_tls_port, 0);
    assert_eq!(config.max_http_sockets, 256);
    assert_eq!(config.request_timeout, Duration::from_secs(30));
    assert!(config.ca_storage_path.ends_with(".vproxy"));
    let forwarder = config.forwarder_config();
    assert_eq!(forwarder.max_https_sockets, 256);
    assert!(forwarder.upstream_proxy.is_none());
  }

  #[tokio::test]
  async fn test_resolver_per_call() {
    let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let resolver = {
      let counter = counter.clone();
      ProxyResolver::from_fn(move || {
        let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        async move { Some(format!("http://10.0.0.{}:3128", n + 1)) }
      })
    };
    assert_eq!(resolver.resolve().await.unwrap().unwrap().host(), "10.0.0.1");
    assert_eq!(resolver.resolve().await.unwrap().unwrap().host(), "10.0.0.2");
    assert!(ProxyResolver::fixed("ftp://x").resolve().await.is_err());
  }
}

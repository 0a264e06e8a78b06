//! Top-level wiring of the listeners, the CA and the pipeline

use crate::ca::CertificateAuthority;
use crate::config::MitmConfig;
use crate::error::{Error, Result};
use crate::forward::{ForwarderStats, UpstreamForwarder};
use crate::pipeline::{Handler, Pipeline};
use crate::store::{CertStore, FsCertStore};
use crate::tls::TlsFront;
use crate::tunnel::{SniHints, TunnelAcceptor, TunnelStats};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// MITM proxy main struct
pub struct MitmProxy {
  config: MitmConfig,
  ca: Arc<CertificateAuthority>,
  pipeline: Pipeline,
}

impl std::fmt::Debug for MitmProxy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MitmProxy")
      .field("config", &self.config)
      .field("ca", &self.ca)
      .field("handlers", &self.pipeline.len())
      .finish()
  }
}

impl MitmProxy {
  /// Create a proxy and bootstrap its root CA.
  ///
  /// Fails when the root can be neither loaded nor created; there is no
  /// degraded mode without one.
  pub async fn new(config: MitmConfig) -> Result<Self> {
    let store: Arc<dyn CertStore> = match &config.cert_store {
      Some(store) => store.clone(),
      None => Arc::new(FsCertStore::new(&config.ca_storage_path)),
    };
    let ca = CertificateAuthority::bootstrap(store).await.map_err(|e| {
      tracing::error!("root CA bootstrap failed: {}", e);
      e
    })?;
    Ok(Self {
      config,
      ca: Arc::new(ca),
      pipeline: Pipeline::new(),
    })
  }

  /// Append a handler. Handlers run in the order they are added, before the
  /// upstream forwarder.
  pub fn add_handler(&mut self, handler: impl Handler) -> &mut Self {
    self.pipeline.add_handler(handler);
    self
  }

  /// The certificate authority
  pub fn ca(&self) -> Arc<CertificateAuthority> {
    self.ca.clone()
  }

  /// Configuration in use
  pub fn config(&self) -> &MitmConfig {
    &self.config
  }

  /// Bind both listeners and freeze the pipeline
  pub async fn bind(self) -> Result<BoundProxy> {
    let Self {
      config,
      ca,
      mut pipeline,
    } = self;
    let hints = SniHints::default();
    let front = TlsFront::bind(config.front_addr(), ca.clone(), hints.clone()).await?;
    let front_addr = front.local_addr()?;
    if config.install_root {
      ca.install_root(Some(&config.root_export_path)).await?;
    }
    let forwarder_stats = if config.forward_upstream {
      let forwarder = UpstreamForwarder::new(config.forwarder_config())?;
      let stats = forwarder.stats();
      pipeline.add_handler(forwarder);
      Some(stats)
    } else {
      None
    };
    let dispatcher = Arc::new(pipeline.into_dispatcher());
    front.subscribe(dispatcher.clone())?;
    let tunnel = TunnelAcceptor::bind(config.tunnel_addr(), front_addr, dispatcher, hints.clone()).await?;
    let proxy_addr = tunnel.local_addr()?;
    Ok(BoundProxy {
      front: Arc::new(front),
      tunnel: Arc::new(tunnel),
      ca,
      hints,
      forwarder_stats,
      proxy_addr,
      front_addr,
    })
  }

  /// Bind and serve until a listener fails
  pub async fn run(self) -> Result<()> {
    self.bind().await?.run().await
  }
}

/// Listeners bound and ready to serve
pub struct BoundProxy {
  front: Arc<TlsFront>,
  tunnel: Arc<TunnelAcceptor>,
  ca: Arc<CertificateAuthority>,
  hints: SniHints,
  forwarder_stats: Option<Arc<ForwarderStats>>,
  proxy_addr: SocketAddr,
  front_addr: SocketAddr,
}

impl BoundProxy {
  /// Address clients use as their proxy
  pub fn proxy_addr(&self) -> SocketAddr {
    self.proxy_addr
  }

  /// Loopback address of the TLS front
  pub fn front_addr(&self) -> SocketAddr {
    self.front_addr
  }

  /// The certificate authority
  pub fn ca(&self) -> Arc<CertificateAuthority> {
    self.ca.clone()
  }

  /// Tunnel counters
  pub fn tunnel_stats(&self) -> Arc<TunnelStats> {
    self.tunnel.stats()
  }

  /// Forwarder counters, when the forwarder is installed
  pub fn forwarder_stats(&self) -> Option<Arc<ForwarderStats>> {
    self.forwarder_stats.clone()
  }

  /// SNI hints of the live tunnels
  pub fn sni_hints(&self) -> SniHints {
    self.hints.clone()
  }

  /// Serve until a listener fails
  pub async fn run(self) -> Result<()> {
    tokio::try_join!(self.front.clone().run(), self.tunnel.clone().run())?;
    Ok(())
  }

  /// Serve on a background task
  pub fn spawn(self) -> ProxyHandle {
    let proxy_addr = self.proxy_addr;
    let front_addr = self.front_addr;
    ProxyHandle {
      proxy_addr,
      front_addr,
      task: tokio::spawn(self.run()),
    }
  }
}

/// A proxy serving in the background
#[derive(Debug)]
pub struct ProxyHandle {
  proxy_addr: SocketAddr,
  front_addr: SocketAddr,
  task: JoinHandle<Result<()>>,
}

impl ProxyHandle {
  /// Address clients use as their proxy
  pub fn proxy_addr(&self) -> SocketAddr {
    self.proxy_addr
  }

  /// Loopback address of the TLS front
  pub fn front_addr(&self) -> SocketAddr {
    self.front_addr
  }

  /// Stop accepting. Connections already being served keep their tasks.
  pub fn abort(&self) {
    self.task.abort();
  }

  /// Wait for the listeners to stop
  pub async fn join(self) -> Result<()> {
    match self.task.await {
      Ok(result) => result,
      Err(e) if e.is_cancelled() => Ok(()),
      Err(e) => Err(Error::other(e.to_string())),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryCertStore;

  fn test_config() -> MitmConfig {
    MitmConfig::default()
      .tunnel_port(0)
      .cert_store(Arc::new(MemoryCertStore::new()))
  }

  #[tokio::test]
  async fn test_bind_ephemeral() {
    let proxy = MitmProxy::new(test_config()).await.unwrap();
    let bound = proxy.bind().await.unwrap();
    assert_ne!(bound.proxy_addr().port(), 0);
    assert_ne!(bound.front_addr().port(), 0);
    assert!(bound.front_addr().ip().is_loopback());
    assert_eq!(bound.tunnel_stats().opened(), 0);
    assert!(bound.forwarder_stats().is_some());
    let handle = bound.spawn();
    handle.abort();
    handle.join().await.unwrap();
  }

  #[tokio::test]
  async fn test_install_root_on_bind() {
    let path = std::env::temp_dir().join(format!("vproxy-export-{}.crt", rand::random::<u64>()));
    let mut config = test_config();
    config.install_root = true;
    config.root_export_path = path.clone();
    let proxy = MitmProxy::new(config).await.unwrap();
    let pem = proxy.ca().root_cert_pem().to_string();
    let _bound = proxy.bind().await.unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), pem);
    std::fs::remove_file(&path).ok();
  }
}

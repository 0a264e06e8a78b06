use crate::error::{new_io_error, Error, Result};
use crate::proxy::{establish_tunnel, UpstreamProxy};
use crate::socket::{MaybeTlsStream, Socket};
use crate::tls::upstream_client_config;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpSocket;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::TlsConnector;

/// ConnectorBuilder
#[derive(Clone, Debug)]
pub struct ConnectorBuilder {
  certs_verification: bool,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  roots: Vec<CertificateDer<'static>>,
  resolve_overrides: HashMap<String, SocketAddr>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      certs_verification: false,
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: true,
      keepalive: false,
      roots: vec![],
      resolve_overrides: HashMap::new(),
    }
  }
}

impl ConnectorBuilder {
  /// Controls the use of certificate validation toward origins.
  ///
  /// Defaults to `false`: interception targets are arbitrary hosts.
  pub fn certs_verification(mut self, value: bool) -> ConnectorBuilder {
    self.certs_verification = value;
    self
  }
  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `true`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Sets value for the `SO_KEEPALIVE` option on this socket.
  ///
  /// Default is `false`.
  pub fn keepalive(mut self, value: bool) -> ConnectorBuilder {
    self.keepalive = value;
    self
  }
  /// Adds a certificate to the set of roots trusted when verification is on.
  pub fn root_certificate(mut self, cert: CertificateDer<'static>) -> ConnectorBuilder {
    self.roots.push(cert);
    self
  }
  /// Connect to `addr` whenever `host` is requested, skipping DNS.
  pub fn resolve(mut self, host: impl Into<String>, addr: SocketAddr) -> ConnectorBuilder {
    self
      .resolve_overrides
      .insert(host.into().to_ascii_lowercase(), addr);
    self
  }
  /// Replace every resolve override
  pub fn resolve_overrides(mut self, overrides: HashMap<String, SocketAddr>) -> ConnectorBuilder {
    self.resolve_overrides = overrides
      .into_iter()
      .map(|(host, addr)| (host.to_ascii_lowercase(), addr))
      .collect();
    self
  }
  /// Enables a read timeout.
  ///
  /// The timeout applies to each read operation, and resets after a
  /// successful read.
  ///
  /// Default is 30 seconds.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.read_timeout = timeout;
    self
  }
  /// Enables a write timeout.
  ///
  /// Default is 30 seconds.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.write_timeout = timeout;
    self
  }
  /// Set a timeout for only the connect phase.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
}

impl ConnectorBuilder {
  /// Combine the configuration of this builder to create a `Connector`.
  pub fn build(&self) -> Result<Connector> {
    let tls = TlsConnector::from(upstream_client_config(self.certs_verification, &self.roots)?);
    Ok(Connector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      keepalive: self.keepalive,
      read_timeout: self.read_timeout,
      write_timeout: self.write_timeout,
      resolve_overrides: self.resolve_overrides.clone(),
      tls,
    })
  }
}

/// Opens upstream connections: direct, through a chained proxy, plain or TLS.
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  resolve_overrides: HashMap<String, SocketAddr>,
  tls: TlsConnector,
}

impl std::fmt::Debug for Connector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connector")
      .field("connect_timeout", &self.connect_timeout)
      .field("read_timeout", &self.read_timeout)
      .field("write_timeout", &self.write_timeout)
      .field("resolve_overrides", &self.resolve_overrides)
      .finish()
  }
}

impl Connector {
  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<Socket> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    if self.keepalive {
      socket.set_keepalive(self.keepalive)?;
    }
    let s = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|x| new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))??,
    };
    Ok(Socket::new(
      MaybeTlsStream::Tcp(s),
      self.read_timeout,
      self.write_timeout,
    ))
  }

  /// Resolve `host`, honoring the overrides first
  pub async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
    if let Some(addr) = self.resolve_overrides.get(&host.to_ascii_lowercase()) {
      return Ok(*addr);
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    tokio::net::lookup_host((host, port))
      .await?
      .next()
      .ok_or_else(|| Error::connection_error(format!("no address for {}", host)))
  }

  async fn connect_host(&self, host: &str, port: u16) -> Result<Socket> {
    let addr = self.resolve(host, port).await?;
    tracing::debug!("connecting to {}:{} at {}", host, port, addr);
    self.connect_with_addr(addr).await
  }

  /// Wrap `stream` in TLS with `domain` as the server name
  pub async fn upgrade_to_tls(&self, stream: Socket, domain: &str) -> Result<Socket> {
    let domain = domain.trim_start_matches('[').trim_end_matches(']');
    let domain = ServerName::try_from(domain.to_owned()).map_err(|e| Error::Other(e.to_string()))?;
    let this = self.tls.clone();
    let tls = stream
      .tls(move |t| async move { this.connect(domain, t).await })
      .await?;
    Ok(tls)
  }

  /// Open a connection to `host:port`.
  ///
  /// Through a chained proxy, https targets are reached by a CONNECT tunnel
  /// and TLS on top of it; plain http targets get a connection to the proxy
  /// itself, and the request must then be written in absolute-form.
  pub async fn connect(
    &self,
    https: bool,
    host: &str,
    port: u16,
    proxy: Option<&UpstreamProxy>,
  ) -> Result<Socket> {
    match proxy {
      Some(proxy) => {
        let mut socket = self.connect_host(proxy.host(), proxy.port()).await?;
        if !https {
          return Ok(socket);
        }
        establish_tunnel(&mut socket, proxy, &authority(host, port)).await?;
        self.upgrade_to_tls(socket, host).await
      }
      None => {
        let socket = self.connect_host(host, port).await?;
        if https {
          self.upgrade_to_tls(socket, host).await
        } else {
          Ok(socket)
        }
      }
    }
  }
}

/// `host:port`, bracketing IPv6 literals
pub fn authority(host: &str, port: u16) -> String {
  if host.contains(':') && !host.starts_with('[') {
    format!("[{}]:{}", host, port)
  } else {
    format!("{}:{}", host, port)
  }
}

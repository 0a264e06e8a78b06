//! TLS on both legs of the interception
//!
//! Inbound, [`TlsFront`] terminates the client's TLS with a leaf issued on
//! the fly for the SNI host name. Outbound, [`upstream_client_config`] builds
//! the rustls client configuration used toward origins.

use crate::ca::CertificateAuthority;
use crate::context::Protocol;
use crate::error::{Error, Result};
use crate::pipeline::Dispatcher;
use crate::tunnel::{accept_loop, SniHints};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, ClientConfig, DigitallySignedStruct, Error as TLSError,
  RootCertStore, ServerConfig, SignatureScheme,
};
use tokio_rustls::LazyConfigAcceptor;

/// ALPN identifier offered on both legs
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
  Arc::new(rustls::crypto::ring::default_provider())
}

/// Client configuration toward origin servers.
///
/// With `verify` off every server certificate is accepted, which is the
/// default: interception targets are arbitrary hosts. With it on, the
/// platform trust store plus `extra_roots` anchor the chain.
pub fn upstream_client_config(
  verify: bool,
  extra_roots: &[CertificateDer<'static>],
) -> Result<Arc<ClientConfig>> {
  let builder =
    ClientConfig::builder_with_provider(crypto_provider()).with_protocol_versions(rustls::ALL_VERSIONS)?;
  let mut config = if verify {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
      tracing::debug!("skipping platform certificate: {}", e);
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::debug!("loaded {} platform roots, ignored {}", added, ignored);
    for cert in extra_roots {
      roots.add(cert.clone())?;
    }
    builder.with_root_certificates(roots).with_no_client_auth()
  } else {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth()
  };
  config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
  Ok(Arc::new(config))
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}

/// Presents one already resolved identity
#[derive(Debug)]
struct ResolvedIdentity(Arc<CertifiedKey>);

impl ResolvesServerCert for ResolvedIdentity {
  fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
    Some(self.0.clone())
  }
}

/// Server configuration for one handshake with an issued leaf
pub(crate) fn front_server_config(key: Arc<CertifiedKey>) -> Result<Arc<ServerConfig>> {
  let mut config = ServerConfig::builder_with_provider(crypto_provider())
    .with_protocol_versions(rustls::ALL_VERSIONS)?
    .with_no_client_auth()
    .with_cert_resolver(Arc::new(ResolvedIdentity(key)));
  config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
  Ok(Arc::new(config))
}

/// Loopback TLS listener terminating intercepted connections.
///
/// The certificate is chosen after the ClientHello is read and before any
/// server flight is written. When no leaf can be produced for the requested
/// name the handshake is dropped; the root is never presented.
pub struct TlsFront {
  listener: TcpListener,
  ca: Arc<CertificateAuthority>,
  hints: SniHints,
  dispatcher: OnceLock<Arc<Dispatcher>>,
}

impl std::fmt::Debug for TlsFront {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TlsFront")
      .field("listener", &self.listener)
      .field("subscribed", &self.dispatcher.get().is_some())
      .finish()
  }
}

impl TlsFront {
  /// Bind the listener. Port 0 picks an ephemeral port.
  pub async fn bind(addr: SocketAddr, ca: Arc<CertificateAuthority>, hints: SniHints) -> Result<Self> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("TLS front listening on {}", listener.local_addr()?);
    Ok(Self {
      listener,
      ca,
      hints,
      dispatcher: OnceLock::new(),
    })
  }

  /// Address the tunnel acceptor connects to
  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  /// Register the consumer of decrypted requests. Only one is accepted.
  pub fn subscribe(&self, dispatcher: Arc<Dispatcher>) -> Result<()> {
    self
      .dispatcher
      .set(dispatcher)
      .map_err(|_| Error::other("TLS front already has a subscriber"))
  }

  /// Accept connections until the task is dropped
  pub async fn run(self: Arc<Self>) -> Result<()> {
    let dispatcher = self
      .dispatcher
      .get()
      .cloned()
      .ok_or_else(|| Error::other("TLS front started without a subscriber"))?;
    let listener = &self.listener;
    accept_loop("TLS front", move || listener.accept(), |(stream, peer): (TcpStream, SocketAddr)| {
      let front = self.clone();
      let dispatcher = dispatcher.clone();
      tokio::spawn(async move {
        if let Err(e) = front.handle(stream, peer, dispatcher).await {
          tracing::debug!("TLS connection from {} ended: {}", peer, e);
        }
      });
    })
    .await
  }

  async fn handle(&self, stream: TcpStream, peer: SocketAddr, dispatcher: Arc<Dispatcher>) -> Result<()> {
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
    let start = acceptor.await?;
    let server_name = start.client_hello().server_name().map(str::to_owned);
    let domain = match server_name.or_else(|| self.hints.get(&peer)) {
      Some(domain) => domain,
      None => {
        return Err(Error::certificate_unavailable(format!(
          "no SNI and no tunnel hint for {}",
          peer
        )))
      }
    };
    // dropping `start` aborts the handshake without a certificate
    let key = self.ca.certified_key_for(&domain).await?;
    let config = front_server_config(key)?;
    let tls = start.into_stream(config).await?;
    tracing::debug!("intercepting {} for {}", domain, peer);
    dispatcher.serve(tls, Protocol::Https, Some(peer)).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_permissive_client_config() {
    let config = upstream_client_config(false, &[]).unwrap();
    assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
  }

  #[tokio::test]
  async fn test_subscribe_once() {
    let store = Arc::new(crate::store::MemoryCertStore::new());
    let ca = Arc::new(CertificateAuthority::bootstrap(store).await.unwrap());
    let front = TlsFront::bind("127.0.0.1:0".parse().unwrap(), ca, SniHints::default())
      .await
      .unwrap();
    assert_ne!(front.local_addr().unwrap().port(), 0);
    let dispatcher = Arc::new(crate::pipeline::Pipeline::new().into_dispatcher());
    front.subscribe(dispatcher.clone()).unwrap();
    assert!(front.subscribe(dispatcher).is_err());
  }
}

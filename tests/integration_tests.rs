//! Integration tests for vproxy

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use vproxy::rustls;
use vproxy::rustls::pki_types::{CertificateDer, ServerName};
use vproxy::{
  BoundProxy, CaEntry, CertStore, CertificateAuthority, FsCertStore, MemoryCertStore, MitmConfig,
  MitmProxy, ProxyResolver, ROOT_NAME,
};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
  Arc::new(rustls::crypto::ring::default_provider())
}

fn temp_dir(tag: &str) -> std::path::PathBuf {
  std::env::temp_dir().join(format!("vproxy-it-{}-{}", tag, rand::random::<u32>()))
}

fn dns_names(der: &[u8]) -> Vec<String> {
  let (_, cert) = parse_x509_certificate(der).unwrap();
  let san = cert.subject_alternative_name().unwrap().unwrap();
  san
    .value
    .general_names
    .iter()
    .filter_map(|n| match n {
      GeneralName::DNSName(name) => Some(name.to_string()),
      _ => None,
    })
    .collect()
}

fn pem_der(pem: &str) -> CertificateDer<'static> {
  rustls_pemfile::certs(&mut pem.as_bytes())
    .next()
    .unwrap()
    .unwrap()
}

/// Assert `leaf` is issued and signed by `root`
fn assert_signed_by(leaf: &[u8], root: &[u8]) {
  let (_, leaf) = parse_x509_certificate(leaf).unwrap();
  let (_, root) = parse_x509_certificate(root).unwrap();
  assert_eq!(leaf.issuer().as_raw(), root.subject().as_raw());
  assert!(leaf.verify_signature(Some(root.public_key())).is_ok());
  assert!(!leaf.is_ca());
}

#[tokio::test]
async fn test_root_bootstrap_is_idempotent() {
  let dir = temp_dir("root");
  let store = Arc::new(FsCertStore::new(&dir));
  let first = CertificateAuthority::bootstrap(store.clone()).await.unwrap();
  let second = CertificateAuthority::bootstrap(store.clone()).await.unwrap();
  assert_eq!(first.root_cert_pem(), second.root_cert_pem());
  assert!(dir.join("@root-ca.crt").exists());
  assert!(dir.join("@root-ca.key").exists());

  // leaves of one instance validate against the other's root
  let entry = second.certificate_for("shop.example.com").await.unwrap();
  let leaf = pem_der(&entry.cert_pem);
  assert_signed_by(&leaf, first.root_certificate());
  assert_eq!(dns_names(&leaf), vec!["shop.example.com".to_string()]);

  // and the stored leaf is reused rather than reissued
  let third = CertificateAuthority::bootstrap(store).await.unwrap();
  let again = third.certificate_for("shop.example.com").await.unwrap();
  assert_eq!(again.cert_pem, entry.cert_pem);
  assert_eq!(third.issued_count(), 0);
  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_leaf_properties() {
  let ca = CertificateAuthority::bootstrap(Arc::new(MemoryCertStore::new()))
    .await
    .unwrap();
  let (_, root) = parse_x509_certificate(ca.root_certificate()).unwrap();
  assert!(root.is_ca());
  for domain in ["example.com", "a.b.example.org", "xn--bcher-kva.example"] {
    let entry = ca.certificate_for(domain).await.unwrap();
    let leaf = pem_der(&entry.cert_pem);
    assert!(dns_names(&leaf).contains(&domain.to_string()));
    assert_signed_by(&leaf, ca.root_certificate());
    let (_, cert) = parse_x509_certificate(&leaf).unwrap();
    let usage = cert.key_usage().unwrap().unwrap().value;
    assert!(usage.digital_signature());
    assert!(usage.key_encipherment());
    assert!(!usage.key_cert_sign());
    assert!(cert.extended_key_usage().unwrap().unwrap().value.server_auth);
  }
}

#[tokio::test]
async fn test_concurrent_issuance_is_single_flight() {
  let ca = Arc::new(
    CertificateAuthority::bootstrap(Arc::new(MemoryCertStore::new()))
      .await
      .unwrap(),
  );
  let calls = (0..16).map(|_| {
    let ca = ca.clone();
    async move { ca.certified_key_for("burst.example.com").await.unwrap() }
  });
  let keys = futures::future::join_all(calls).await;
  assert_eq!(ca.issued_count(), 1);
  assert!(keys.iter().all(|k| Arc::ptr_eq(k, &keys[0])));
}

/// TLS origin for example.com answering every request with `status_line`
async fn tls_origin(status_line: &'static str) -> SocketAddr {
  let ca = CertificateAuthority::bootstrap(Arc::new(MemoryCertStore::new()))
    .await
    .unwrap();
  let entry = ca.certificate_for("example.com").await.unwrap();
  let certs = rustls_pemfile::certs(&mut entry.cert_pem.as_bytes())
    .collect::<Result<Vec<_>, _>>()
    .unwrap();
  let key = rustls_pemfile::private_key(&mut entry.key_pem.as_bytes())
    .unwrap()
    .unwrap();
  let config = rustls::ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .unwrap();
  let acceptor = TlsAcceptor::from(Arc::new(config));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let (stream, _) = listener.accept().await.unwrap();
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        let Ok(mut tls) = acceptor.accept(stream).await else {
          return;
        };
        let mut buf = vec![0u8; 4096];
        let mut request = Vec::new();
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
          match tls.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
          }
        }
        let body = "from origin";
        let reply = format!(
          "{}\r\nContent-Length: {}\r\n\r\n{}",
          status_line,
          body.len(),
          body
        );
        tls.write_all(reply.as_bytes()).await.ok();
        tls.flush().await.ok();
        // hold the connection open like a keep-alive origin
        let _ = tls.read(&mut buf).await;
      });
    }
  });
  addr
}

/// CONNECT through the proxy, handshake with SNI `host`, GET /hello
async fn https_via_proxy(
  proxy: SocketAddr,
  root: &CertificateDer<'static>,
  host: &str,
) -> (Vec<CertificateDer<'static>>, String) {
  let mut tcp = TcpStream::connect(proxy).await.unwrap();
  tcp
    .write_all(format!("CONNECT {host}:443 HTTP/1.1\r\nHost: {host}:443\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let mut head = Vec::new();
  let mut byte = [0u8; 1];
  while !head.ends_with(b"\r\n\r\n") {
    tcp.read_exact(&mut byte).await.unwrap();
    head.push(byte[0]);
  }
  let head = String::from_utf8(head).unwrap();
  assert!(head.starts_with("HTTP/1.1 200 Connection Established\r\n"), "{}", head);

  let mut roots = rustls::RootCertStore::empty();
  roots.add(root.clone()).unwrap();
  let config = rustls::ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(config));
  let mut tls = connector
    .connect(ServerName::try_from(host.to_string()).unwrap(), tcp)
    .await
    .unwrap();
  let presented = tls.get_ref().1.peer_certificates().unwrap().to_vec();
  tls
    .write_all(format!("GET /hello HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let mut out = String::new();
  tls.read_to_string(&mut out).await.unwrap();
  (presented, out)
}

async fn bind_proxy(config: MitmConfig) -> BoundProxy {
  let config = config
    .tunnel_port(0)
    .cert_store(Arc::new(MemoryCertStore::new()));
  MitmProxy::new(config).await.unwrap().bind().await.unwrap()
}

async fn eventually(check: impl Fn() -> bool) -> bool {
  for _ in 0..100 {
    if check() {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
  check()
}

#[tokio::test]
async fn test_end_to_end_connect() {
  let origin = tls_origin("HTTP/1.1 418 I'm a teapot").await;
  let bound = bind_proxy(MitmConfig::default().resolve("example.com", origin)).await;
  let root = bound.ca().root_certificate().clone();
  let tunnel_stats = bound.tunnel_stats();
  let forwarder_stats = bound.forwarder_stats().unwrap();
  let hints = bound.sni_hints();
  let handle = bound.spawn();

  let (presented, out) = https_via_proxy(handle.proxy_addr(), &root, "example.com").await;
  assert_eq!(dns_names(&presented[0]), vec!["example.com".to_string()]);
  assert_signed_by(&presented[0], &root);
  assert!(out.starts_with("HTTP/1.1 418 I'm a teapot\r\n"), "{}", out);
  assert!(out.ends_with("\r\n\r\nfrom origin"), "{}", out);
  assert_eq!(forwarder_stats.requests_forwarded(), 1);

  // both spliced sockets are released exactly once
  assert!(eventually(|| tunnel_stats.active() == 0 && tunnel_stats.torn_down() == 1).await);
  assert_eq!(tunnel_stats.opened(), 1);
  assert!(hints.is_empty());
  handle.abort();
}

/// Keeps the root in memory and refuses to persist any leaf
#[derive(Debug, Default)]
struct ReadOnlyLeafStore {
  root: MemoryCertStore,
  refused: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl CertStore for ReadOnlyLeafStore {
  async fn save(&self, entry: &CaEntry) -> vproxy::Result<()> {
    if entry.domain == ROOT_NAME {
      return self.root.save(entry).await;
    }
    self.refused.lock().unwrap().push(entry.domain.clone());
    Err(vproxy::Error::other("store is read-only"))
  }

  async fn get(&self, name: &str) -> vproxy::Result<Option<CaEntry>> {
    self.root.get(name).await
  }
}

#[tokio::test]
async fn test_leaf_save_failure_aborts_handshake() {
  let store = Arc::new(ReadOnlyLeafStore::default());
  let config = MitmConfig::default().tunnel_port(0).cert_store(store.clone());
  let bound = MitmProxy::new(config).await.unwrap().bind().await.unwrap();
  let root = bound.ca().root_certificate().clone();
  let tunnel_stats = bound.tunnel_stats();
  let handle = bound.spawn();

  let mut tcp = TcpStream::connect(handle.proxy_addr()).await.unwrap();
  tcp
    .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
    .await
    .unwrap();
  let mut head = Vec::new();
  let mut byte = [0u8; 1];
  while !head.ends_with(b"\r\n\r\n") {
    tcp.read_exact(&mut byte).await.unwrap();
    head.push(byte[0]);
  }
  assert!(head.starts_with(b"HTTP/1.1 200 Connection Established\r\n"));

  let mut roots = rustls::RootCertStore::empty();
  roots.add(root).unwrap();
  let config = rustls::ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(config));
  let handshake = tokio::time::timeout(
    Duration::from_secs(5),
    connector.connect(ServerName::try_from("example.com").unwrap(), tcp),
  )
  .await
  .unwrap();
  assert!(handshake.is_err());
  assert_eq!(*store.refused.lock().unwrap(), vec!["example.com".to_string()]);

  // the tunnel behind the failed handshake is released
  assert!(eventually(|| tunnel_stats.active() == 0 && tunnel_stats.torn_down() == 1).await);
  handle.abort();
}

#[tokio::test]
async fn test_plain_http_host_validation() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut buf = vec![0u8; 4096];
    let _ = stream.read(&mut buf).await.unwrap();
    stream
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
      .await
      .unwrap();
    let _ = stream.read(&mut buf).await;
  });
  let bound = bind_proxy(MitmConfig::default()).await;
  let stats = bound.forwarder_stats().unwrap();
  let handle = bound.spawn();

  let proxy = handle.proxy_addr();
  let get = |raw: String| async move {
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(raw.as_bytes()).await.unwrap();
    let mut out = String::new();
    client.read_to_string(&mut out).await.unwrap();
    out
  };

  let out = get("GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n".to_string()).await;
  assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", out);
  assert_eq!(stats.connections_opened(), 0);
  assert_eq!(stats.rejected_hosts(), 1);

  let out = get(format!(
    "GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n"
  ))
  .await;
  assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{}", out);
  assert!(out.ends_with("ok"));
  assert_eq!(stats.connections_opened(), 1);
  handle.abort();
}

/// Chained proxy answering CONNECT with `reply`, then bridging to `origin`
async fn chained_proxy(reply: &'static str, origin: SocketAddr) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let record = seen.clone();
  tokio::spawn(async move {
    loop {
      let (mut client, _) = listener.accept().await.unwrap();
      let record = record.clone();
      tokio::spawn(async move {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
          if client.read_exact(&mut byte).await.is_err() {
            return;
          }
          head.push(byte[0]);
        }
        record
          .lock()
          .unwrap()
          .push(String::from_utf8_lossy(&head).to_string());
        client.write_all(reply.as_bytes()).await.unwrap();
        if reply.starts_with("HTTP/1.1 200") {
          let mut upstream = TcpStream::connect(origin).await.unwrap();
          let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
        }
      });
    }
  });
  (addr, seen)
}

#[tokio::test]
async fn test_chained_proxy_connect() {
  let origin = tls_origin("HTTP/1.1 200 OK").await;
  let (chained, seen) = chained_proxy("HTTP/1.1 200 Connection Established\r\n\r\n", origin).await;
  let config =
    MitmConfig::default().upstream_proxy(ProxyResolver::fixed(format!("http://user:pw@{}", chained)));
  let bound = bind_proxy(config).await;
  let root = bound.ca().root_certificate().clone();
  let handle = bound.spawn();

  let (_, out) = https_via_proxy(handle.proxy_addr(), &root, "example.com").await;
  assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{}", out);
  assert!(out.ends_with("from origin"));
  let seen = seen.lock().unwrap().clone();
  assert_eq!(seen.len(), 1);
  assert!(seen[0].starts_with("CONNECT example.com:443 HTTP/1.1\r\n"), "{}", seen[0]);
  assert!(seen[0].contains("Proxy-Authorization: Basic dXNlcjpwdw==\r\n"));
  handle.abort();
}

#[tokio::test]
async fn test_chained_proxy_refusal_is_503() {
  let origin = tls_origin("HTTP/1.1 200 OK").await;
  let (chained, _) = chained_proxy("HTTP/1.1 403 Forbidden\r\n\r\n", origin).await;
  let config = MitmConfig::default().upstream_proxy(ProxyResolver::fixed(format!("http://{}", chained)));
  let bound = bind_proxy(config).await;
  let root = bound.ca().root_certificate().clone();
  let stats = bound.forwarder_stats().unwrap();
  let handle = bound.spawn();

  let (_, out) = https_via_proxy(handle.proxy_addr(), &root, "example.com").await;
  assert!(out.starts_with("HTTP/1.1 503 Service Unavailable\r\n"), "{}", out);
  assert_eq!(stats.upstream_failures(), 1);
  handle.abort();
}

//! Proxy port: CONNECT tunnels into the TLS front, plain HTTP into the pipeline

use crate::context::Protocol;
use crate::error::{Error, Result};
use crate::http::{read_head, RequestHead, MAX_HEAD_SIZE};
use crate::pipeline::Dispatcher;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const CONNECT_ESTABLISHED: &str = concat!(
  "HTTP/1.1 200 Connection Established\r\nProxy-agent: vproxy/",
  env!("CARGO_PKG_VERSION"),
  "\r\n\r\n"
);

/// CONNECT host names keyed by the tunnel's local address on its front
/// connection, which is the peer address the TLS front observes.
#[derive(Debug, Clone, Default)]
pub struct SniHints {
  inner: Arc<Mutex<HashMap<SocketAddr, String>>>,
}

impl SniHints {
  fn map(&self) -> std::sync::MutexGuard<'_, HashMap<SocketAddr, String>> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }
  /// Record the CONNECT host for a front connection
  pub fn insert(&self, addr: SocketAddr, host: impl Into<String>) {
    self.map().insert(addr, host.into());
  }
  /// Host recorded for `addr`
  pub fn get(&self, addr: &SocketAddr) -> Option<String> {
    self.map().get(addr).cloned()
  }
  /// Forget `addr`
  pub fn remove(&self, addr: &SocketAddr) -> Option<String> {
    self.map().remove(addr)
  }
  /// Live hints
  pub fn len(&self) -> usize {
    self.map().len()
  }
  /// Whether no hint is live
  pub fn is_empty(&self) -> bool {
    self.map().is_empty()
  }
}

/// Tunnel counters
#[derive(Debug, Default)]
pub struct TunnelStats {
  opened: AtomicU64,
  active: AtomicU64,
  torn_down: AtomicU64,
  failed: AtomicU64,
}

impl TunnelStats {
  /// Tunnels spliced since start
  pub fn opened(&self) -> u64 {
    self.opened.load(Ordering::SeqCst)
  }
  /// Tunnels currently spliced
  pub fn active(&self) -> u64 {
    self.active.load(Ordering::SeqCst)
  }
  /// Tunnels whose sockets were released
  pub fn torn_down(&self) -> u64 {
    self.torn_down.load(Ordering::SeqCst)
  }
  /// CONNECT requests that never reached the TLS front
  pub fn failed(&self) -> u64 {
    self.failed.load(Ordering::SeqCst)
  }
}

/// The two spliced sockets of one CONNECT tunnel and their cleanup.
///
/// Teardown runs exactly once, whichever side ends first, and also when the
/// pair is dropped mid-splice.
pub struct TunnelPair {
  client: Option<TcpStream>,
  front: Option<TcpStream>,
  front_local: SocketAddr,
  hints: SniHints,
  stats: Arc<TunnelStats>,
  torn_down: AtomicBool,
}

impl TunnelPair {
  fn new(
    client: TcpStream,
    front: TcpStream,
    host: &str,
    hints: SniHints,
    stats: Arc<TunnelStats>,
  ) -> Result<Self> {
    let front_local = front.local_addr()?;
    hints.insert(front_local, host);
    stats.opened.fetch_add(1, Ordering::SeqCst);
    stats.active.fetch_add(1, Ordering::SeqCst);
    Ok(Self {
      client: Some(client),
      front: Some(front),
      front_local,
      hints,
      stats,
      torn_down: AtomicBool::new(false),
    })
  }

  /// Forward `early` to the front, then relay both directions until either
  /// side closes or fails. Returns the bytes relayed client to front and
  /// front to client.
  async fn splice(&mut self, early: &[u8]) -> Result<(u64, u64)> {
    let (Some(client), Some(front)) = (self.client.as_mut(), self.front.as_mut()) else {
      return Err(Error::connection_error("tunnel already torn down"));
    };
    if !early.is_empty() {
      front.write_all(early).await?;
    }
    let (mut client_read, mut client_write) = client.split();
    let (mut front_read, mut front_write) = front.split();
    let relayed = tokio::select! {
      up = tokio::io::copy(&mut client_read, &mut front_write) => up.map(|n| (n, 0)),
      down = tokio::io::copy(&mut front_read, &mut client_write) => down.map(|n| (0, n)),
    };
    // a clean EOF closes normally so bytes already relayed still arrive
    self.release(relayed.is_err());
    Ok(relayed?)
  }

  /// Reset both sockets and release the SNI hint. Idempotent.
  pub fn teardown(&mut self) {
    self.release(true);
  }

  fn release(&mut self, hard: bool) {
    if self.torn_down.swap(true, Ordering::SeqCst) {
      return;
    }
    self.hints.remove(&self.front_local);
    self.stats.active.fetch_sub(1, Ordering::SeqCst);
    self.stats.torn_down.fetch_add(1, Ordering::SeqCst);
    for stream in [self.client.take(), self.front.take()].into_iter().flatten() {
      if hard {
        reset(stream);
      }
    }
  }
}

impl Drop for TunnelPair {
  fn drop(&mut self) {
    self.teardown();
  }
}

/// Pause after a failed accept, so fd exhaustion does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Hand every accepted connection to `on_accept`. A failed accept is logged
/// and retried; it never ends the loop.
pub(crate) async fn accept_loop<T, A, F, H>(name: &str, mut accept: A, mut on_accept: H) -> Result<()>
where
  A: FnMut() -> F,
  F: Future<Output = std::io::Result<T>>,
  H: FnMut(T),
{
  loop {
    match accept().await {
      Ok(conn) => on_accept(conn),
      Err(e) => {
        tracing::warn!("{} listener failed to accept connection: {}", name, e);
        tokio::time::sleep(ACCEPT_BACKOFF).await;
      }
    }
  }
}

/// Close with RST instead of FIN
fn reset(stream: TcpStream) {
  let sock = socket2::SockRef::from(&stream);
  sock.set_linger(Some(Duration::ZERO)).ok();
  drop(stream);
}

/// Externally advertised proxy listener.
pub struct TunnelAcceptor {
  listener: TcpListener,
  front_addr: SocketAddr,
  dispatcher: Arc<Dispatcher>,
  hints: SniHints,
  stats: Arc<TunnelStats>,
}

impl TunnelAcceptor {
  /// Bind the proxy port; CONNECT tunnels go to `front_addr`
  pub async fn bind(
    addr: SocketAddr,
    front_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    hints: SniHints,
  ) -> Result<Self> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("proxy listening on {}", listener.local_addr()?);
    Ok(Self {
      listener,
      front_addr,
      dispatcher,
      hints,
      stats: Arc::new(TunnelStats::default()),
    })
  }

  /// Bound proxy address
  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  /// Shared counters
  pub fn stats(&self) -> Arc<TunnelStats> {
    self.stats.clone()
  }

  /// Accept clients until the task is dropped
  pub async fn run(self: Arc<Self>) -> Result<()> {
    let listener = &self.listener;
    accept_loop("proxy", move || listener.accept(), |(stream, peer): (TcpStream, SocketAddr)| {
      stream.set_nodelay(true).ok();
      let acceptor = self.clone();
      tokio::spawn(async move {
        if let Err(e) = acceptor.handle(stream, peer).await {
          tracing::debug!("client {} ended: {}", peer, e);
        }
      });
    })
    .await
  }

  async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    loop {
      let Some(raw) = read_head(&mut reader, MAX_HEAD_SIZE).await? else {
        return Ok(());
      };
      let head = match RequestHead::parse(&raw) {
        Ok(Some((head, _))) => head,
        _ => {
          writer
            .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await?;
          return Ok(());
        }
      };
      if head.is_connect() {
        let Some((host, port)) = parse_host_port(&head.target) else {
          writer
            .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await?;
          return Ok(());
        };
        tracing::debug!("CONNECT {}:{} from {}", host, port, peer);
        let front = match TcpStream::connect(self.front_addr).await {
          Ok(front) => front,
          Err(e) => {
            self.stats.failed.fetch_add(1, Ordering::SeqCst);
            tracing::warn!("TLS front unreachable for {}: {}", peer, e);
            if let Ok(client) = reader.into_inner().reunite(writer) {
              reset(client);
            }
            return Ok(());
          }
        };
        front.set_nodelay(true).ok();
        writer.write_all(CONNECT_ESTABLISHED.as_bytes()).await?;
        let early = reader.buffer().to_vec();
        let client = reader
          .into_inner()
          .reunite(writer)
          .map_err(|e| Error::other(e.to_string()))?;
        let mut pair = TunnelPair::new(client, front, &host, self.hints.clone(), self.stats.clone())?;
        let (up, down) = pair.splice(&early).await?;
        tracing::debug!("tunnel {}:{} closed, {} bytes up, {} down", host, port, up, down);
        return Ok(());
      }
      let keep = self
        .dispatcher
        .dispatch(head, &mut reader, &mut writer, Protocol::Http, Some(peer))
        .await?;
      if !keep {
        writer.shutdown().await.ok();
        return Ok(());
      }
    }
  }
}

/// Split a CONNECT authority into host and port. Brackets around IPv6
/// literals are removed.
pub fn parse_host_port(target: &str) -> Option<(String, u16)> {
  let (host, port) = target.rsplit_once(':')?;
  let port = port.parse::<u16>().ok()?;
  let host = host
    .strip_prefix('[')
    .and_then(|h| h.strip_suffix(']'))
    .unwrap_or(host);
  if host.is_empty() || port == 0 {
    return None;
  }
  Some((host.to_string(), port))
}

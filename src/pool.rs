//! Bounded keep-alive pool for upstream connections
//!
//! Every connection, idle or in use, holds one semaphore permit, so the pool
//! never has more than `limit` sockets open. A checkout that finds no idle
//! connection and no free permit evicts the oldest idle connection of another
//! destination, or waits for a permit or a check-in.

use crate::socket::Socket;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// Idle connections older than this are closed instead of reused
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Destination a pooled connection is bound to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
  /// TLS toward the origin
  pub https: bool,
  /// Origin host, lowercase
  pub host: String,
  /// Origin port
  pub port: u16,
  /// Chained proxy URL the connection goes through
  pub proxy: Option<String>,
}

impl PoolKey {
  /// Key for one destination
  pub fn new(https: bool, host: &str, port: u16, proxy: Option<String>) -> Self {
    Self {
      https,
      host: host.to_ascii_lowercase(),
      port,
      proxy,
    }
  }
}

/// An upstream connection owning its pool slot
#[derive(Debug)]
pub struct PooledConnection {
  /// Buffered upstream stream
  pub reader: BufReader<Socket>,
  key: PoolKey,
  _permit: OwnedSemaphorePermit,
  idle_since: Instant,
}

impl PooledConnection {
  /// Destination of this connection
  pub fn key(&self) -> &PoolKey {
    &self.key
  }
}

/// Result of [`ConnectionPool::checkout`]
#[derive(Debug)]
pub enum Checkout {
  /// An idle connection to the same destination
  Reused(PooledConnection),
  /// A free slot; the caller opens the connection and calls
  /// [`ConnectionPool::attach`]
  Fresh(OwnedSemaphorePermit),
}

/// Semaphore-bounded connection pool
#[derive(Debug)]
pub struct ConnectionPool {
  limit: usize,
  semaphore: Arc<Semaphore>,
  idle: Mutex<HashMap<PoolKey, Vec<PooledConnection>>>,
  idle_timeout: Duration,
  released: Notify,
}

impl ConnectionPool {
  /// Pool with at most `limit` open connections
  pub fn new(limit: usize) -> Self {
    Self::with_idle_timeout(limit, DEFAULT_IDLE_TIMEOUT)
  }

  /// Pool with a custom idle timeout
  pub fn with_idle_timeout(limit: usize, idle_timeout: Duration) -> Self {
    let limit = limit.max(1);
    Self {
      limit,
      semaphore: Arc::new(Semaphore::new(limit)),
      idle: Mutex::new(HashMap::new()),
      idle_timeout,
      released: Notify::new(),
    }
  }

  fn idle(&self) -> MutexGuard<'_, HashMap<PoolKey, Vec<PooledConnection>>> {
    self.idle.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Socket ceiling
  pub fn limit(&self) -> usize {
    self.limit
  }

  /// Idle connections across every destination
  pub fn idle_count(&self) -> usize {
    self.idle().values().map(Vec::len).sum()
  }

  /// Slots neither in use nor idle
  pub fn available_permits(&self) -> usize {
    self.semaphore.available_permits()
  }

  /// Reuse an idle connection to `key` or reserve a slot for a new one,
  /// waiting while the pool is full.
  pub async fn checkout(&self, key: &PoolKey) -> Checkout {
    loop {
      let released = self.released.notified();
      tokio::pin!(released);
      released.as_mut().enable();

      if let Some(conn) = self.take_idle(key) {
        return Checkout::Reused(conn);
      }
      if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
        return Checkout::Fresh(permit);
      }
      if let Some(victim) = self.evict_oldest() {
        tracing::debug!("evicting idle connection to {}:{}", victim.key.host, victim.key.port);
        drop(victim);
        continue;
      }
      tokio::select! {
        permit = self.semaphore.clone().acquire_owned() => {
          if let Ok(permit) = permit {
            return Checkout::Fresh(permit);
          }
        }
        _ = released.as_mut() => {}
      }
    }
  }

  fn take_idle(&self, key: &PoolKey) -> Option<PooledConnection> {
    let mut idle = self.idle();
    let conns = idle.get_mut(key)?;
    while let Some(mut conn) = conns.pop() {
      if conn.idle_since.elapsed() >= self.idle_timeout || !is_reusable(&mut conn.reader) {
        continue;
      }
      if conns.is_empty() {
        idle.remove(key);
      }
      return Some(conn);
    }
    idle.remove(key);
    None
  }

  fn evict_oldest(&self) -> Option<PooledConnection> {
    let mut idle = self.idle();
    let key = idle
      .iter()
      .filter_map(|(key, conns)| conns.first().map(|c| (key, c.idle_since)))
      .min_by_key(|(_, since)| *since)
      .map(|(key, _)| key.clone())?;
    let conns = idle.get_mut(&key)?;
    let victim = conns.remove(0);
    if conns.is_empty() {
      idle.remove(&key);
    }
    Some(victim)
  }

  /// Wrap a freshly opened socket into a pooled connection
  pub fn attach(&self, key: PoolKey, socket: Socket, permit: OwnedSemaphorePermit) -> PooledConnection {
    PooledConnection {
      reader: BufReader::new(socket),
      key,
      _permit: permit,
      idle_since: Instant::now(),
    }
  }

  /// Return a connection whose exchange completed cleanly
  pub fn checkin(&self, mut conn: PooledConnection) {
    if !conn.reader.buffer().is_empty() {
      // unread bytes would poison the next exchange
      return;
    }
    conn.idle_since = Instant::now();
    self.idle().entry(conn.key.clone()).or_default().push(conn);
    self.released.notify_waiters();
  }
}

/// An idle connection is reusable when nothing is readable on it: pending
/// bytes or EOF both mean the origin is done with it.
fn is_reusable(reader: &mut BufReader<Socket>) -> bool {
  let reusable = match reader.fill_buf().now_or_never() {
    None => true,
    Some(_) => false,
  };
  // the probe may have armed the idle read deadline
  let socket = reader.get_mut();
  let (read, write) = socket.timeouts();
  socket.set_timeouts(read, write);
  reusable
}

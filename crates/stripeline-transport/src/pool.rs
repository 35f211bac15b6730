//! Size-bounded cache of idle connections keyed by peer and identity.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::connection::Connection;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle connections kept per key (default: 4).
    pub max_idle_per_key: usize,
    /// Idle connections kept across all keys (default: 64).
    pub max_idle_total: usize,
    /// Idle connection timeout in seconds (default: 300).
    pub idle_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_key: 4,
            max_idle_total: 64,
            idle_timeout_secs: 300,
        }
    }
}

/// Identifies interchangeable connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    /// Peer host name or address.
    pub host: String,
    /// Peer port.
    pub port: u16,
    /// Local identity the connection was authenticated as.
    pub identity: String,
}

impl PoolKey {
    /// Creates a key.
    pub fn new(host: impl Into<String>, port: u16, identity: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            identity: identity.into(),
        }
    }

    /// `host:port` form suitable for connecting.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle connections across all keys.
    pub idle_connections: usize,
    /// Keys with at least one idle connection.
    pub keys: usize,
    /// Connections handed out by `acquire`.
    pub hits: u64,
    /// `acquire` calls that found nothing usable.
    pub misses: u64,
    /// Connections closed because of the caps or the idle timeout.
    pub evictions: u64,
}

struct IdleEntry {
    conn: Connection,
    released_at: Instant,
    seq: u64,
}

#[derive(Default)]
struct PoolInner {
    idle: HashMap<PoolKey, VecDeque<IdleEntry>>,
    next_seq: u64,
    stats: PoolStats,
}

impl PoolInner {
    fn total(&self) -> usize {
        self.idle.values().map(VecDeque::len).sum()
    }

    /// Removes the least recently released entry across all keys.
    fn pop_oldest(&mut self) -> Option<Connection> {
        let key = self
            .idle
            .iter()
            .filter_map(|(key, queue)| queue.front().map(|e| (e.seq, key)))
            .min_by_key(|(seq, _)| *seq)
            .map(|(_, key)| key.clone())?;
        let queue = self.idle.get_mut(&key)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            self.idle.remove(&key);
        }
        entry.map(|e| e.conn)
    }
}

/// Idle-connection pool.
///
/// Holds no global state: each owner creates its own pool. The lock is never
/// held across an await; evicted connections are closed after it is dropped.
pub struct ConnectionPool {
    config: PoolConfig,
    inner: Mutex<PoolInner>,
}

impl ConnectionPool {
    /// Create a new connection pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// Takes the most recently released idle connection for `key`, closing
    /// any that sat idle past the timeout.
    pub async fn acquire(&self, key: &PoolKey) -> Option<Connection> {
        let timeout = Duration::from_secs(self.config.idle_timeout_secs);
        let mut expired = Vec::new();
        let found = {
            let mut inner = self.inner.lock();
            let mut found = None;
            if let Some(queue) = inner.idle.get_mut(key) {
                while let Some(entry) = queue.pop_back() {
                    if entry.released_at.elapsed() <= timeout {
                        found = Some(entry.conn);
                        break;
                    }
                    expired.push(entry.conn);
                }
                if queue.is_empty() {
                    inner.idle.remove(key);
                }
            }
            inner.stats.evictions += expired.len() as u64;
            if found.is_some() {
                inner.stats.hits += 1;
            } else {
                inner.stats.misses += 1;
            }
            found
        };
        close_all(expired).await;
        found
    }

    /// Returns a connection for reuse, evicting the least recently used
    /// entries beyond the caps.
    pub async fn release(&self, key: PoolKey, conn: Connection) {
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let queue = inner.idle.entry(key).or_default();
            queue.push_back(IdleEntry {
                conn,
                released_at: Instant::now(),
                seq,
            });
            while queue.len() > self.config.max_idle_per_key {
                if let Some(entry) = queue.pop_front() {
                    evicted.push(entry.conn);
                }
            }
            while inner.total() > self.config.max_idle_total {
                match inner.pop_oldest() {
                    Some(conn) => evicted.push(conn),
                    None => break,
                }
            }
            inner.idle.retain(|_, queue| !queue.is_empty());
            inner.stats.evictions += evicted.len() as u64;
        }
        close_all(evicted).await;
    }

    /// Closes every idle connection for `key`.
    pub async fn purge_key(&self, key: &PoolKey) {
        let drained: Vec<Connection> = {
            let mut inner = self.inner.lock();
            inner
                .idle
                .remove(key)
                .map(|queue| queue.into_iter().map(|e| e.conn).collect())
                .unwrap_or_default()
        };
        close_all(drained).await;
    }

    /// Get pool statistics.
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            idle_connections: inner.total(),
            keys: inner.idle.len(),
            ..inner.stats.clone()
        }
    }
}

async fn close_all(conns: Vec<Connection>) {
    for conn in conns {
        let peer = conn.peer().to_string();
        if let Err(e) = conn.flush_and_close().await {
            warn!(peer = %peer, error = %e, "closing pooled connection failed");
        } else {
            debug!(peer = %peer, "pooled connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(peer: &str) -> Connection {
        let (a, _b) = tokio::io::duplex(64);
        Connection::from_stream(a, peer)
    }

    fn key(host: &str) -> PoolKey {
        PoolKey::new(host, 601, "alice")
    }

    #[tokio::test]
    async fn test_pool_stats() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 0);
        assert_eq!(stats.keys, 0);
    }

    #[tokio::test]
    async fn test_acquire_returns_most_recent() {
        let pool = ConnectionPool::new(PoolConfig::default());
        pool.release(key("a"), conn("first")).await;
        pool.release(key("a"), conn("second")).await;
        let got = pool.acquire(&key("a")).await.unwrap();
        assert_eq!(got.peer(), "second");
        assert!(pool.acquire(&key("b")).await.is_none());
        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.idle_connections, 1);
    }

    #[tokio::test]
    async fn test_identity_is_part_of_key() {
        let pool = ConnectionPool::new(PoolConfig::default());
        pool.release(PoolKey::new("h", 1, "alice"), conn("x")).await;
        assert!(pool.acquire(&PoolKey::new("h", 1, "bob")).await.is_none());
        assert!(pool.acquire(&PoolKey::new("h", 1, "alice")).await.is_some());
    }

    #[tokio::test]
    async fn test_per_key_cap_evicts_oldest() {
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_key: 2,
            ..PoolConfig::default()
        });
        for name in ["c1", "c2", "c3"] {
            pool.release(key("a"), conn(name)).await;
        }
        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 2);
        assert_eq!(stats.evictions, 1);
        assert_eq!(pool.acquire(&key("a")).await.unwrap().peer(), "c3");
        assert_eq!(pool.acquire(&key("a")).await.unwrap().peer(), "c2");
    }

    #[tokio::test]
    async fn test_total_cap_evicts_lru_across_keys() {
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_total: 2,
            ..PoolConfig::default()
        });
        pool.release(key("a"), conn("a1")).await;
        pool.release(key("b"), conn("b1")).await;
        pool.release(key("c"), conn("c1")).await;
        assert!(pool.acquire(&key("a")).await.is_none());
        assert!(pool.acquire(&key("b")).await.is_some());
        assert!(pool.acquire(&key("c")).await.is_some());
    }

    #[tokio::test]
    async fn test_purge_key() {
        let pool = ConnectionPool::new(PoolConfig::default());
        pool.release(key("a"), conn("a1")).await;
        pool.release(key("b"), conn("b1")).await;
        pool.purge_key(&key("a")).await;
        assert_eq!(pool.stats().keys, 1);
    }
}

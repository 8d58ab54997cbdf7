//! Per-node connection pools.
//!
//! Each known node address gets a [`NodePool`]. Connections are dialed
//! lazily, handed out as [`PooledConn`] guards and returned to the idle list
//! when the guard is dropped, unless they are broken or still have replies
//! in flight.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::core::builder::DialOptions;
use crate::core::connection::NodeConnection;
use crate::{Error, Result};

/// Configuration for the per-node connection pools.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use slotlink::PoolConfig;
///
/// let config = PoolConfig::new()
///     .max_idle(4)
///     .max_active(32)
///     .idle_timeout(Some(Duration::from_secs(60)));
/// assert_eq!(config.max_idle, 4);
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum idle connections kept per node
    pub max_idle: usize,
    /// Maximum connections checked out per node (0 = unlimited)
    pub max_active: usize,
    /// Idle connections older than this are closed instead of reused
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 8,
            max_active: 0,
            idle_timeout: None,
        }
    }
}

impl PoolConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of idle connections per node.
    pub fn max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Sets the maximum number of checked out connections per node.
    pub fn max_active(mut self, max_active: usize) -> Self {
        self.max_active = max_active;
        self
    }

    /// Sets the idle timeout.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// Connection counts for one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently checked out
    pub active: usize,
    /// Connections waiting in the idle list
    pub idle: usize,
}

struct IdleConn {
    conn: NodeConnection,
    since: Instant,
}

/// The connection pool for a single node address.
pub(crate) struct NodePool {
    address: String,
    options: Arc<DialOptions>,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleConn>>,
    active: AtomicUsize,
    closed: AtomicBool,
}

impl NodePool {
    pub(crate) fn new(address: String, options: Arc<DialOptions>, config: PoolConfig) -> Self {
        Self {
            address,
            options,
            config,
            idle: Mutex::new(VecDeque::new()),
            active: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    /// Checks out a connection, reusing the most recently returned idle one
    /// or dialing a new one.
    pub(crate) async fn get(self: &Arc<Self>) -> Result<PooledConn> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ClusterClosed);
        }
        let mut pooled = self.reserve()?;

        if let Some(conn) = self.take_idle() {
            pooled.conn = Some(conn);
            return Ok(pooled);
        }

        // Dropping `pooled` while dialing gives the reservation back.
        let conn = NodeConnection::dial(&self.address, &self.options)
            .await
            .inspect_err(|e| debug!(address = %self.address, error = %e, "dial failed"))?;
        pooled.conn = Some(conn);
        Ok(pooled)
    }

    /// Closes the pool. Idle connections are handed back for shutdown;
    /// connections still checked out are dropped when returned.
    pub(crate) fn close(&self) -> Vec<NodeConnection> {
        self.closed.store(true, Ordering::Release);
        self.idle_list().drain(..).map(|idle| idle.conn).collect()
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.active.load(Ordering::Acquire),
            idle: self.idle_list().len(),
        }
    }

    /// Takes an active slot. The returned guard holds no connection yet and
    /// releases the slot if dropped empty.
    fn reserve(self: &Arc<Self>) -> Result<PooledConn> {
        let max = self.config.max_active;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .map_err(|_| Error::PoolExhausted {
                address: self.address.clone(),
            })?;
        Ok(PooledConn {
            pool: self.clone(),
            conn: None,
        })
    }

    fn release(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    fn take_idle(&self) -> Option<NodeConnection> {
        let mut idle = self.idle_list();
        while let Some(entry) = idle.pop_back() {
            let expired = self
                .config
                .idle_timeout
                .is_some_and(|timeout| entry.since.elapsed() > timeout);
            if expired || !entry.conn.is_reusable() {
                continue;
            }
            return Some(entry.conn);
        }
        None
    }

    fn put(&self, conn: NodeConnection) {
        self.release();

        if self.closed.load(Ordering::Acquire) || !conn.is_reusable() {
            debug!(address = %self.address, "discarding connection");
            return;
        }

        let mut idle = self.idle_list();
        idle.push_back(IdleConn {
            conn,
            since: Instant::now(),
        });
        while idle.len() > self.config.max_idle {
            idle.pop_front();
        }
    }

    fn idle_list(&self) -> MutexGuard<'_, VecDeque<IdleConn>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A connection checked out of a [`NodePool`]. Dropping it returns the
/// connection to the pool.
pub(crate) struct PooledConn {
    pool: Arc<NodePool>,
    conn: Option<NodeConnection>,
}

impl PooledConn {
    pub(crate) fn address(&self) -> &str {
        self.pool.address()
    }

    pub(crate) fn get(&self) -> Result<&NodeConnection> {
        self.conn.as_ref().ok_or(Error::ClosedConnection)
    }

    pub(crate) fn get_mut(&mut self) -> Result<&mut NodeConnection> {
        self.conn.as_mut().ok_or(Error::ClosedConnection)
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        match self.conn.take() {
            Some(conn) => self.pool.put(conn),
            None => self.pool.release(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command;
    use crate::proto::frame::Frame;
    use crate::testing::MockServer;

    fn pong_server() -> MockServer {
        MockServer::start(|_, _| Frame::SimpleString(b"PONG".to_vec()))
    }

    fn pool(addr: &str, config: PoolConfig) -> Arc<NodePool> {
        Arc::new(NodePool::new(
            addr.to_string(),
            Arc::new(DialOptions::new()),
            config,
        ))
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle, 8);
        assert_eq!(config.max_active, 0);
        assert!(config.idle_timeout.is_none());
    }

    #[tokio::test]
    async fn test_connection_is_reused() {
        let server = pong_server();
        let pool = pool(server.addr(), PoolConfig::default());

        let conn = pool.get().await.unwrap();
        assert_eq!(pool.stats(), PoolStats { active: 1, idle: 0 });
        drop(conn);
        assert_eq!(pool.stats(), PoolStats { active: 0, idle: 1 });

        let mut conn = pool.get().await.unwrap();
        conn.get_mut().unwrap().execute(&command::ping()).await.unwrap();
        drop(conn);

        assert_eq!(server.accepted(), 1);
    }

    #[tokio::test]
    async fn test_max_active() {
        let server = pong_server();
        let pool = pool(server.addr(), PoolConfig::new().max_active(1));

        let first = pool.get().await.unwrap();
        let err = pool.get().await.err().unwrap();
        assert!(matches!(err, Error::PoolExhausted { ref address } if address == server.addr()));

        drop(first);
        assert!(pool.get().await.is_ok());
    }

    #[tokio::test]
    async fn test_max_idle() {
        let server = pong_server();
        let pool = pool(server.addr(), PoolConfig::new().max_idle(1));

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.stats(), PoolStats { active: 0, idle: 1 });
    }

    #[tokio::test]
    async fn test_idle_timeout_discards_old_connections() {
        let server = pong_server();
        let pool = pool(
            server.addr(),
            PoolConfig::new().idle_timeout(Some(Duration::from_millis(10))),
        );

        drop(pool.get().await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        let mut conn = pool.get().await.unwrap();
        conn.get_mut().unwrap().execute(&command::ping()).await.unwrap();
        drop(conn);

        assert_eq!(server.accepted(), 2);
    }

    #[tokio::test]
    async fn test_pending_replies_are_not_pooled() {
        let server = pong_server();
        let pool = pool(server.addr(), PoolConfig::default());

        let mut conn = pool.get().await.unwrap();
        conn.get_mut().unwrap().send(&command::ping()).unwrap();
        drop(conn);

        assert_eq!(pool.stats(), PoolStats { active: 0, idle: 0 });
    }

    #[tokio::test]
    async fn test_closed_pool() {
        let server = pong_server();
        let pool = pool(server.addr(), PoolConfig::default());

        let held = pool.get().await.unwrap();
        drop(pool.get().await.unwrap());
        assert_eq!(pool.close().len(), 1);

        drop(held);
        assert_eq!(pool.stats(), PoolStats::default());
        assert!(matches!(pool.get().await, Err(Error::ClusterClosed)));
    }

    #[tokio::test]
    async fn test_dial_failure_releases_slot() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let pool = pool(&addr, PoolConfig::new().max_active(1));
        assert!(pool.get().await.is_err());
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test]
    async fn test_cancelled_dial_releases_slot() {
        // Accepts at the TCP level but never answers CLIENT SETNAME.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let pool = Arc::new(NodePool::new(
            addr,
            Arc::new(DialOptions::new().client_name("stalled")),
            PoolConfig::new().max_active(1),
        ));

        let mut get = Box::pin(pool.get());
        assert!(futures::poll!(&mut get).is_pending());
        assert_eq!(pool.stats().active, 1);
        drop(get);
        assert_eq!(pool.stats().active, 0);

        let mut retry = Box::pin(pool.get());
        assert!(futures::poll!(&mut retry).is_pending());
        drop(retry);
        drop(listener);
    }
}

use super::memcache::MemcacheConnection;
use crate::core::{ProxyError, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Pool sizing and expiry for one storage node.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of open connections to the node
    pub max_connections: usize,
    /// Idle connections older than this are discarded on checkout
    pub idle_timeout: Option<Duration>,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// How long a checkout waits for a free slot
    pub checkout_timeout: Duration,
    /// Largest value length accepted in a node reply
    pub max_value_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            idle_timeout: Some(Duration::from_secs(60)),
            connect_timeout: Duration::from_millis(300),
            checkout_timeout: Duration::from_millis(500),
            max_value_size: 1024 * 1024,
        }
    }
}

impl PoolConfig {
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }

    pub fn max_value_size(mut self, max: usize) -> Self {
        self.max_value_size = max;
        self
    }
}

/// Reusable connections to a single storage node.
pub struct NodePool {
    addr: String,
    config: PoolConfig,
    /// Idle connections, most recently returned last
    available: Arc<Mutex<VecDeque<PooledConnection>>>,
    /// Open connections, idle or checked out
    total_connections: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

struct PooledConnection {
    connection: MemcacheConnection,
    last_used: Instant,
}

impl PooledConnection {
    fn new(connection: MemcacheConnection) -> Self {
        Self {
            connection,
            last_used: Instant::now(),
        }
    }

    fn is_idle_too_long(&self, idle_timeout: Option<Duration>) -> bool {
        match idle_timeout {
            Some(timeout) => self.last_used.elapsed() > timeout,
            None => false,
        }
    }
}

impl NodePool {
    pub fn new(addr: impl Into<String>, config: PoolConfig) -> Self {
        Self {
            addr: addr.into(),
            config,
            available: Arc::new(Mutex::new(VecDeque::new())),
            total_connections: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Checks out a connection, opening a new one while under the limit.
    pub async fn checkout(&self) -> Result<PoolGuard> {
        let start = Instant::now();

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(self.unavailable("connection pool is closed"));
            }

            if let Some(pooled) = self.try_get_available().await {
                return Ok(self.guard(pooled.connection));
            }

            if let Some(connection) = self.try_create_connection().await? {
                return Ok(self.guard(connection));
            }

            if start.elapsed() > self.config.checkout_timeout {
                return Err(self.unavailable("connection pool exhausted"));
            }

            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Pops a fresh idle connection, dropping the ones that idled out.
    async fn try_get_available(&self) -> Option<PooledConnection> {
        let mut available = self.available.lock().await;

        let before = available.len();
        available.retain(|pooled| !pooled.is_idle_too_long(self.config.idle_timeout));
        let removed = before - available.len();
        if removed > 0 {
            self.total_connections.fetch_sub(removed, Ordering::SeqCst);
        }

        available.pop_back()
    }

    async fn try_create_connection(&self) -> Result<Option<MemcacheConnection>> {
        let reserved = self
            .total_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total < self.config.max_connections).then_some(total + 1)
            })
            .is_ok();
        if !reserved {
            return Ok(None);
        }

        let connected = MemcacheConnection::connect(&self.addr, self.config.connect_timeout)
            .await
            .map(|connection| connection.max_value_size(self.config.max_value_size));
        match connected {
            Ok(connection) => Ok(Some(connection)),
            Err(err) => {
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn guard(&self, connection: MemcacheConnection) -> PoolGuard {
        PoolGuard {
            connection: Some(connection),
            pool: self.available.clone(),
            total_connections: self.total_connections.clone(),
            closed: self.closed.clone(),
        }
    }

    fn unavailable(&self, reason: &str) -> ProxyError {
        ProxyError::NodeUnavailable {
            addr: self.addr.clone(),
            reason: reason.to_string(),
        }
    }

    /// Refuses further checkouts and drops every idle connection.
    ///
    /// Checked-out connections are dropped when their guards are released.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut available = self.available.lock().await;
        let idle = available.len();
        available.clear();
        self.total_connections.fetch_sub(idle, Ordering::SeqCst);
    }

    pub async fn stats(&self) -> PoolStats {
        let available = self.available.lock().await;
        let total = self.total_connections.load(Ordering::SeqCst);

        PoolStats {
            total_connections: total,
            available_connections: available.len(),
            active_connections: total.saturating_sub(available.len()),
            max_connections: self.config.max_connections,
        }
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub total_connections: usize,
    pub available_connections: usize,
    pub active_connections: usize,
    pub max_connections: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} available, max {}",
            self.active_connections,
            self.total_connections,
            self.available_connections,
            self.max_connections
        )
    }
}

/// Checked-out connection.
///
/// Hand it back with [`PoolGuard::release`] after a complete request/response
/// exchange. A guard dropped any other way (error, cancelled by a timeout)
/// may sit mid-response, so its connection is discarded instead of reused.
pub struct PoolGuard {
    connection: Option<MemcacheConnection>,
    pool: Arc<Mutex<VecDeque<PooledConnection>>>,
    total_connections: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl PoolGuard {
    pub fn connection(&mut self) -> Option<&mut MemcacheConnection> {
        self.connection.as_mut()
    }

    /// Returns the connection to the pool for reuse.
    pub async fn release(mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        // Checked under the lock: `NodePool::close` sets the flag before it
        // takes the lock to clear the idle list.
        let mut pool = self.pool.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            self.total_connections.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        pool.push_back(PooledConnection::new(connection));
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if self.connection.take().is_some() {
            self.total_connections.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn idle_listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_checkout_and_release_reuses_connection() {
        let (listener, addr) = idle_listener().await;
        tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });

        let pool = NodePool::new(addr, PoolConfig::default().max_connections(2));
        let guard = pool.checkout().await.unwrap();
        assert_eq!(pool.stats().await.active_connections, 1);
        guard.release().await;

        let stats = pool.stats().await;
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.available_connections, 1);

        let _guard = pool.checkout().await.unwrap();
        assert_eq!(pool.stats().await.total_connections, 1);
    }

    #[tokio::test]
    async fn test_dropped_guard_is_discarded() {
        let (listener, addr) = idle_listener().await;
        tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });

        let pool = NodePool::new(addr, PoolConfig::default());
        {
            let _guard = pool.checkout().await.unwrap();
        }
        let stats = pool.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.available_connections, 0);
    }

    #[tokio::test]
    async fn test_max_connections_limit() {
        let (listener, addr) = idle_listener().await;
        tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });

        let pool = NodePool::new(
            addr,
            PoolConfig::default()
                .max_connections(1)
                .checkout_timeout(Duration::from_millis(50)),
        );
        let _held = pool.checkout().await.unwrap();
        let result = pool.checkout().await;
        assert!(matches!(result, Err(ProxyError::NodeUnavailable { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_release_racing_close_leaves_nothing_behind() {
        let (listener, addr) = idle_listener().await;
        tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });

        for _ in 0..50 {
            let pool = Arc::new(NodePool::new(addr.clone(), PoolConfig::default()));
            let guards = vec![
                pool.checkout().await.unwrap(),
                pool.checkout().await.unwrap(),
                pool.checkout().await.unwrap(),
            ];

            let releases: Vec<_> = guards
                .into_iter()
                .map(|guard| tokio::spawn(guard.release()))
                .collect();
            let closing = {
                let pool = pool.clone();
                tokio::spawn(async move { pool.close().await })
            };
            for release in releases {
                release.await.unwrap();
            }
            closing.await.unwrap();

            let stats = pool.stats().await;
            assert_eq!(stats.available_connections, 0);
            assert_eq!(stats.total_connections, 0);
        }
    }

    #[tokio::test]
    async fn test_release_after_close_discards_connection() {
        let (listener, addr) = idle_listener().await;
        tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });

        let pool = NodePool::new(addr, PoolConfig::default());
        let guard = pool.checkout().await.unwrap();
        pool.close().await;
        guard.release().await;

        let stats = pool.stats().await;
        assert_eq!(stats.available_connections, 0);
        assert_eq!(stats.total_connections, 0);
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_checkout() {
        let pool = NodePool::new("127.0.0.1:1", PoolConfig::default());
        pool.close().await;
        assert!(pool.checkout().await.is_err());
    }
}

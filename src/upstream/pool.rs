//! Per-server connection pooling.
//!
//! Each pool keeps a channel-backed ready queue of initialized clients and
//! counts borrowed connections against `max_connections`. Borrowing runs a
//! cheap health probe; releasing discards connections that have accumulated
//! too many upstream errors. A background sweeper closes idle connections.
//! The sweeper and `close` never hold the metrics lock across I/O: they
//! drain a snapshot first and act on it afterwards.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::PoolConfig;
use crate::error::{PoolError, TransportError};

use super::client::UpstreamClient;
use super::UpstreamAddress;

/// A pooled upstream connection with usage accounting.
pub struct PooledConnection {
    pub client: UpstreamClient,
    pub created_at: Instant,
    last_used: Instant,
    total_calls: u64,
    error_count: AtomicU64,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("created_at", &self.created_at)
            .field("last_used", &self.last_used)
            .field("total_calls", &self.total_calls)
            .field("error_count", &self.error_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl PooledConnection {
    fn new(client: UpstreamClient) -> Self {
        let now = Instant::now();
        Self {
            client,
            created_at: now,
            last_used: now,
            total_calls: 0,
            error_count: AtomicU64::new(0),
        }
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Record one completed upstream call.
    pub fn record_call(&mut self) {
        self.total_calls += 1;
    }

    /// Record an upstream error against this connection.
    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls
    }
}

#[derive(Debug, Default, Clone)]
struct PoolMetrics {
    acquires: u64,
    releases: u64,
    created: u64,
    closed: u64,
    errors: u64,
    active: usize,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub server: String,
    pub acquires: u64,
    pub releases: u64,
    pub created: u64,
    pub closed: u64,
    pub errors: u64,
    pub active: usize,
    pub idle: usize,
}

/// Bounded pool of initialized clients for one upstream server.
pub struct ConnectionPool {
    server: String,
    address: UpstreamAddress,
    config: PoolConfig,
    max_connections: usize,
    ready_tx: mpsc::Sender<PooledConnection>,
    ready_rx: Mutex<mpsc::Receiver<PooledConnection>>,
    metrics: StdMutex<PoolMetrics>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl ConnectionPool {
    pub fn new(server: impl Into<String>, config: PoolConfig) -> Arc<Self> {
        let server = server.into();
        let address = UpstreamAddress::parse(&server);
        // Each stdio connection owns a child process; cap those pools hard.
        let max_connections = if address.is_stdio() {
            config.max_connections.min(PoolConfig::STDIO_MAX_CONNECTIONS)
        } else {
            config.max_connections
        };
        let (ready_tx, ready_rx) = mpsc::channel(max_connections.max(1));
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            server,
            address,
            config,
            max_connections,
            ready_tx,
            ready_rx: Mutex::new(ready_rx),
            metrics: StdMutex::new(PoolMetrics::default()),
            closed: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Borrow a connection: a healthy ready one if available, otherwise a
    /// freshly initialized one, bounded by `max_connections`.
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed {
                server: self.server.clone(),
            });
        }
        self.lock_metrics().acquires += 1;

        loop {
            let ready = { self.ready_rx.lock().await.try_recv().ok() };
            let Some(mut conn) = ready else { break };

            self.lock_metrics().active += 1;
            if let Err(e) = conn.client.probe(self.config.health_check_timeout).await {
                tracing::debug!(server = %self.server, error = %e, "discarding unhealthy connection");
                conn.client.close().await;
                let mut m = self.lock_metrics();
                m.active -= 1;
                m.closed += 1;
                m.errors += 1;
                continue;
            }
            conn.touch();
            return Ok(conn);
        }

        // Nothing ready: create, unless the borrow cap is hit. The slot is
        // reserved under the lock before any I/O.
        {
            let mut m = self.lock_metrics();
            if m.active >= self.max_connections {
                return Err(PoolError::MaxConnections {
                    server: self.server.clone(),
                });
            }
            m.active += 1;
        }

        match self.create_initialized().await {
            Ok(conn) => {
                self.lock_metrics().created += 1;
                Ok(conn)
            }
            Err(e) => {
                let mut m = self.lock_metrics();
                m.active -= 1;
                m.errors += 1;
                drop(m);
                Err(PoolError::Initialize {
                    server: self.server.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn create_initialized(&self) -> Result<PooledConnection, TransportError> {
        let budget = self.config.init_timeout;
        let connect = async {
            let client = match &self.address {
                UpstreamAddress::Stdio { command, args } => {
                    let mut stdio = super::StdioConfig::new(command.as_str()).with_args(args.clone());
                    if self.config.stdio_auto_restart {
                        stdio = stdio.with_auto_restart(
                            self.config.stdio_max_restarts,
                            self.config.stdio_restart_interval,
                        );
                    }
                    UpstreamClient::connect_stdio(stdio).await?
                }
                address => UpstreamClient::connect(address).await?,
            };
            client.initialize().await?;
            Ok::<_, TransportError>(client)
        };
        match tokio::time::timeout(budget, connect).await {
            Ok(Ok(client)) => Ok(PooledConnection::new(client)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Timeout {
                id: 0,
                timeout: budget,
            }),
        }
    }

    /// Return a borrowed connection. Connections past the error threshold
    /// are closed instead of requeued, as is any overflow.
    pub async fn release(&self, mut conn: PooledConnection) {
        conn.touch();

        let discard = self.closed.load(Ordering::SeqCst)
            || conn.error_count() > self.config.max_connection_errors;
        {
            let mut m = self.lock_metrics();
            m.releases += 1;
            m.active = m.active.saturating_sub(1);
        }

        if discard {
            conn.client.close().await;
            self.lock_metrics().closed += 1;
            return;
        }

        if let Err(overflow) = self.ready_tx.try_send(conn) {
            let conn = match overflow {
                mpsc::error::TrySendError::Full(c) => c,
                mpsc::error::TrySendError::Closed(c) => c,
            };
            conn.client.close().await;
            self.lock_metrics().closed += 1;
        }
    }

    /// Spawn the idle sweeper. Runs until `close` or shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => pool.sweep().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    }

    /// Drain the ready queue, close idle connections, requeue the rest.
    async fn sweep(&self) {
        let mut drained = Vec::new();
        {
            let mut rx = self.ready_rx.lock().await;
            while let Ok(conn) = rx.try_recv() {
                drained.push(conn);
            }
        }

        let mut swept = 0u64;
        for conn in drained {
            if conn.idle_for() > self.config.idle_timeout {
                conn.client.close().await;
                swept += 1;
                continue;
            }
            if let Err(overflow) = self.ready_tx.try_send(conn) {
                let conn = match overflow {
                    mpsc::error::TrySendError::Full(c) => c,
                    mpsc::error::TrySendError::Closed(c) => c,
                };
                conn.client.close().await;
                swept += 1;
            }
        }

        if swept > 0 {
            self.lock_metrics().closed += swept;
            tracing::debug!(server = %self.server, swept, "closed idle connections");
        }
    }

    /// Close the pool: stop the sweeper and close every ready connection.
    /// Borrowed connections are closed when released.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        let mut drained = Vec::new();
        {
            let mut rx = self.ready_rx.lock().await;
            while let Ok(conn) = rx.try_recv() {
                drained.push(conn);
            }
        }
        let count = drained.len() as u64;
        for conn in drained {
            conn.client.close().await;
        }
        self.lock_metrics().closed += count;
    }

    pub fn stats(&self) -> PoolStats {
        let m = self.lock_metrics().clone();
        // Queue occupancy derived from the sender's remaining capacity.
        let idle = self.max_connections.saturating_sub(self.ready_tx.capacity());
        PoolStats {
            server: self.server.clone(),
            acquires: m.acquires,
            releases: m.releases,
            created: m.created,
            closed: m.closed,
            errors: m.errors,
            active: m.active,
            idle,
        }
    }

    fn lock_metrics(&self) -> std::sync::MutexGuard<'_, PoolMetrics> {
        self.metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Lazily creates one pool per upstream server.
pub struct PoolManager {
    pools: std::sync::RwLock<std::collections::HashMap<String, Arc<ConnectionPool>>>,
    config: PoolConfig,
}

impl PoolManager {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            pools: std::sync::RwLock::new(std::collections::HashMap::new()),
            config,
        }
    }

    /// Get the pool for a server, creating (and starting its sweeper) on
    /// first use. Double-checked so concurrent callers share one pool.
    pub fn get_or_create(&self, server: &str) -> Arc<ConnectionPool> {
        {
            let pools = self.pools.read().unwrap_or_else(|p| p.into_inner());
            if let Some(pool) = pools.get(server) {
                return Arc::clone(pool);
            }
        }

        let mut pools = self.pools.write().unwrap_or_else(|p| p.into_inner());
        if let Some(pool) = pools.get(server) {
            return Arc::clone(pool);
        }
        let pool = ConnectionPool::new(server, self.config.clone());
        pool.spawn_sweeper();
        pools.insert(server.to_string(), Arc::clone(&pool));
        pool
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let pools = self.pools.read().unwrap_or_else(|p| p.into_inner());
        pools.values().map(|p| p.stats()).collect()
    }

    pub async fn close_all(&self) {
        let snapshot: Vec<Arc<ConnectionPool>> = {
            let pools = self.pools.read().unwrap_or_else(|p| p.into_inner());
            pools.values().cloned().collect()
        };
        for pool in snapshot {
            pool.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> PoolConfig {
        PoolConfig {
            max_connections: 2,
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn stdio_pools_are_capped() {
        let config = PoolConfig {
            max_connections: 10,
            ..PoolConfig::default()
        };
        let pool = ConnectionPool::new("mock-mcp --flag", config);
        assert_eq!(pool.max_connections, PoolConfig::STDIO_MAX_CONNECTIONS);

        let http_pool = ConnectionPool::new("http://localhost:9", test_config());
        assert_eq!(http_pool.max_connections, 2);
    }

    #[tokio::test]
    async fn acquire_fails_when_cap_reached() {
        // Unreachable server: creation fails, but the cap check comes first
        // once `active` is saturated artificially.
        let pool = ConnectionPool::new("http://127.0.0.1:1", test_config());
        pool.lock_metrics().active = 2;

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::MaxConnections { .. }));
    }

    #[tokio::test]
    async fn acquire_after_close_fails() {
        let pool = ConnectionPool::new("http://127.0.0.1:1", test_config());
        pool.close().await;
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Closed { .. }));
    }

    #[tokio::test]
    async fn manager_shares_pools_per_server() {
        let manager = PoolManager::new(test_config());
        let a = manager.get_or_create("http://one");
        let b = manager.get_or_create("http://one");
        let c = manager.get_or_create("http://two");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        manager.close_all().await;
    }
}

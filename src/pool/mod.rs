//! Connection pooling for MCP transports
//!
//! The pool keeps a bounded slice of reusable connections per server.
//! `get` claims the first idle connection in insertion order, so
//! long-lived transports are reused as much as possible; a new transport
//! is only dialed when nothing idle remains and the cap allows it.
//! Structural mutation happens under the per-server map entry; flag
//! transitions take a connection-scoped lock. Transport I/O (connect,
//! close) never happens while either lock is held.

use crate::error::{Error, Result};
use crate::transport::{DefaultTransportFactory, McpTransport, TransportFactory};
use crate::types::{ServerId, ToolInfo};
use crate::workflow::ServerConfig;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pool defaults; tests shrink the intervals.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections_per_server: usize,
    pub idle_timeout: Duration,
    pub cleanup_interval: Duration,
    pub connect_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_server: 10,
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            connect_timeout: crate::transport::DEFAULT_CONNECT_TIMEOUT,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
}

struct ConnectionFlags {
    in_use: bool,
    closed: bool,
    refcount: u32,
    last_used: Instant,
}

/// A transport held by the pool, reusable across unrelated callers that
/// observe acquire/release discipline.
pub struct PooledConnection {
    server_id: ServerId,
    transport: tokio::sync::RwLock<Arc<dyn McpTransport>>,
    flags: parking_lot::Mutex<ConnectionFlags>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("server_id", &self.server_id)
            .finish()
    }
}

impl PooledConnection {
    fn new(server_id: ServerId, transport: Arc<dyn McpTransport>) -> Self {
        Self {
            server_id,
            transport: tokio::sync::RwLock::new(transport),
            flags: parking_lot::Mutex::new(ConnectionFlags {
                in_use: true,
                closed: false,
                refcount: 1,
                last_used: Instant::now(),
            }),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn is_in_use(&self) -> bool {
        self.flags.lock().in_use
    }

    pub fn refcount(&self) -> u32 {
        self.flags.lock().refcount
    }

    /// Clone the transport Arc so no lock is held across the I/O await.
    async fn transport(&self) -> Arc<dyn McpTransport> {
        self.transport.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.transport().await.is_connected()
    }

    pub async fn call_tool(&self, name: &str, arguments: Value, deadline: Duration) -> Result<Value> {
        self.transport().await.call_tool(name, arguments, deadline).await
    }

    pub async fn list_tools(&self, deadline: Duration) -> Result<Vec<ToolInfo>> {
        self.transport().await.list_tools(deadline).await
    }

    pub async fn ping(&self, deadline: Duration) -> Result<()> {
        self.transport().await.ping(deadline).await
    }

    async fn close_transport(&self) {
        let transport = self.transport().await;
        if let Err(e) = transport.close().await {
            debug!(server = %self.server_id, "transport close: {}", e);
        }
    }
}

pub struct ConnectionPool {
    config: PoolConfig,
    factory: Arc<dyn TransportFactory>,
    servers: DashMap<ServerId, ServerConfig>,
    connections: DashMap<ServerId, Vec<Arc<PooledConnection>>>,
    active_ops: AtomicUsize,
    leaks_detected: AtomicU64,
    closing: AtomicBool,
    cleanup_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Self::with_factory(config, Arc::new(DefaultTransportFactory))
    }

    pub fn with_factory(config: PoolConfig, factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            factory,
            servers: DashMap::new(),
            connections: DashMap::new(),
            active_ops: AtomicUsize::new(0),
            leaks_detected: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            cleanup_task: parking_lot::Mutex::new(None),
        });

        let task = tokio::spawn(Self::cleanup_loop(Arc::downgrade(&pool)));
        *pool.cleanup_task.lock() = Some(task);
        pool
    }

    /// Idempotent server registration. An empty ID is rejected.
    pub fn register(&self, server: ServerConfig) -> Result<()> {
        if server.id.is_empty() {
            return Err(Error::Validation("server ID cannot be empty".to_string()));
        }
        self.servers.entry(server.id.clone()).or_insert(server);
        Ok(())
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Acquire a connection using the pool's default connect deadline.
    pub async fn get(&self, server_id: &str) -> Result<Arc<PooledConnection>> {
        self.get_with_deadline(server_id, self.config.connect_timeout).await
    }

    /// Acquire an idle connection, or dial a new one while the per-server
    /// cap allows. Fails with [`Error::PoolExhausted`] when the cap is
    /// reached and every connection is in use.
    pub async fn get_with_deadline(
        &self,
        server_id: &str,
        deadline: Duration,
    ) -> Result<Arc<PooledConnection>> {
        if self.is_closing() {
            return Err(Error::PoolClosed);
        }

        let server = self
            .servers
            .get(server_id)
            .map(|s| s.clone())
            .ok_or_else(|| Error::ServerNotFound(server_id.to_string()))?;

        loop {
            match self.claim_or_reserve(server_id)? {
                Claim::Existing(conn) => {
                    // Connectivity is checked outside all locks; a dead
                    // connection is dropped and the scan restarts.
                    if conn.is_connected().await {
                        self.active_ops.fetch_add(1, Ordering::SeqCst);
                        return Ok(conn);
                    }
                    self.discard(server_id, &conn).await;
                    continue;
                },
                Claim::Dial => {
                    let transport = self.factory.create(&server);
                    transport.connect(deadline).await?;

                    let conn = Arc::new(PooledConnection::new(
                        server_id.to_string(),
                        transport,
                    ));

                    let accepted = {
                        let mut slot = self.connections.entry(server_id.to_string()).or_default();
                        if slot.len() < self.config.max_connections_per_server {
                            slot.push(conn.clone());
                            true
                        } else {
                            false
                        }
                    };

                    if !accepted {
                        // Another caller filled the last slot while we
                        // were dialing.
                        conn.close_transport().await;
                        continue;
                    }

                    self.active_ops.fetch_add(1, Ordering::SeqCst);
                    debug!(server = %server_id, "dialed new pooled connection");
                    return Ok(conn);
                },
            }
        }
    }

    /// Scan idle connections in insertion order; first eligible wins.
    fn claim_or_reserve(&self, server_id: &str) -> Result<Claim> {
        let slot = self.connections.entry(server_id.to_string()).or_default();
        for conn in slot.iter() {
            let mut flags = conn.flags.lock();
            if !flags.closed && !flags.in_use {
                flags.in_use = true;
                flags.refcount += 1;
                return Ok(Claim::Existing(conn.clone()));
            }
        }
        if slot.len() >= self.config.max_connections_per_server {
            return Err(Error::PoolExhausted(server_id.to_string()));
        }
        Ok(Claim::Dial)
    }

    /// Remove a dead connection claimed by `get`.
    async fn discard(&self, server_id: &str, conn: &Arc<PooledConnection>) {
        {
            let mut flags = conn.flags.lock();
            flags.closed = true;
            flags.in_use = false;
            flags.refcount = flags.refcount.saturating_sub(1);
        }
        if let Some(mut slot) = self.connections.get_mut(server_id) {
            slot.retain(|c| !Arc::ptr_eq(c, conn));
        }
        conn.close_transport().await;
        debug!(server = %server_id, "discarded dead pooled connection");
    }

    /// Release the most recently acquired in-use connection for a server.
    pub fn release(&self, server_id: &str) {
        let Some(slot) = self.connections.get(server_id) else {
            return;
        };
        for conn in slot.iter().rev() {
            let mut flags = conn.flags.lock();
            if flags.in_use {
                flags.in_use = false;
                flags.last_used = Instant::now();
                flags.refcount = flags.refcount.saturating_sub(1);
                drop(flags);
                self.active_ops.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        }
        warn!(server = %server_id, "release without a matching get");
    }

    /// Replace a broken connection's transport in place, holding its
    /// write lock so in-flight delegation waits for the swap.
    pub async fn reconnect(&self, server_id: &str, conn: &Arc<PooledConnection>) -> Result<()> {
        let server = self
            .servers
            .get(server_id)
            .map(|s| s.clone())
            .ok_or_else(|| Error::ServerNotFound(server_id.to_string()))?;

        let mut guard = conn.transport.write().await;
        if let Err(e) = guard.close().await {
            debug!(server = %server_id, "closing broken transport: {}", e);
        }
        let transport = self.factory.create(&server);
        transport.connect(self.config.connect_timeout).await?;
        *guard = transport;
        info!(server = %server_id, "reconnected pooled connection");
        Ok(())
    }

    /// Drain and shut down one server's connections.
    pub async fn close_server(&self, server_id: &str) -> Result<()> {
        if let Some((_, conns)) = self.connections.remove(server_id) {
            for conn in &conns {
                self.record_leak_if_referenced(conn);
            }
            for conn in conns {
                conn.close_transport().await;
            }
        }
        Ok(())
    }

    /// Graceful shutdown: reject new acquisitions, wait for active
    /// operations to drain, then close everything. Returns
    /// [`Error::ShutdownForced`] if the grace period expired with
    /// operations still in flight.
    pub async fn close(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);

        let deadline = Instant::now() + self.config.shutdown_grace;
        while self.active_ops.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let forced = self.active_ops.load(Ordering::SeqCst) > 0;

        if let Some(task) = self.cleanup_task.lock().take() {
            task.abort();
        }

        let server_ids: Vec<ServerId> =
            self.connections.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0usize;
        for server_id in server_ids {
            if let Some((_, conns)) = self.connections.remove(&server_id) {
                for conn in &conns {
                    self.record_leak_if_referenced(conn);
                }
                for conn in conns {
                    conn.close_transport().await;
                    closed += 1;
                }
            }
        }

        if forced {
            warn!(closed, "pool shutdown forced after grace period");
            Err(Error::ShutdownForced(closed))
        } else {
            info!(closed, "pool shut down gracefully");
            Ok(())
        }
    }

    fn record_leak_if_referenced(&self, conn: &Arc<PooledConnection>) {
        let mut flags = conn.flags.lock();
        flags.closed = true;
        if flags.refcount != 0 {
            self.leaks_detected.fetch_add(1, Ordering::SeqCst);
            warn!(
                server = %conn.server_id,
                refcount = flags.refcount,
                "connection leak detected at eviction"
            );
        }
    }

    pub fn stats(&self) -> HashMap<ServerId, PoolStats> {
        let mut out = HashMap::new();
        for entry in self.connections.iter() {
            let total = entry.value().len();
            let active = entry.value().iter().filter(|c| c.is_in_use()).count();
            out.insert(
                entry.key().clone(),
                PoolStats {
                    total,
                    active,
                    idle: total - active,
                },
            );
        }
        out
    }

    pub fn leak_stats(&self) -> u64 {
        self.leaks_detected.load(Ordering::SeqCst)
    }

    pub fn active_operations(&self) -> usize {
        self.active_ops.load(Ordering::SeqCst)
    }

    /// Background sweep: close connections idle past the timeout. A
    /// connection evicted while still referenced counts as a leak.
    async fn cleanup_loop(pool: Weak<ConnectionPool>) {
        let interval = match pool.upgrade() {
            Some(p) => p.config.cleanup_interval,
            None => return,
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(pool) = pool.upgrade() else {
                return;
            };
            if pool.is_closing() {
                return;
            }
            pool.evict_idle().await;
        }
    }

    async fn evict_idle(&self) {
        let server_ids: Vec<ServerId> =
            self.connections.iter().map(|e| e.key().clone()).collect();

        for server_id in server_ids {
            let mut evicted = Vec::new();
            if let Some(mut slot) = self.connections.get_mut(&server_id) {
                slot.retain(|conn| {
                    let mut flags = conn.flags.lock();
                    if !flags.in_use && flags.last_used.elapsed() > self.config.idle_timeout {
                        flags.closed = true;
                        if flags.refcount != 0 {
                            self.leaks_detected.fetch_add(1, Ordering::SeqCst);
                            warn!(
                                server = %conn.server_id,
                                refcount = flags.refcount,
                                "connection leak detected at eviction"
                            );
                        }
                        evicted.push(conn.clone());
                        false
                    } else {
                        true
                    }
                });
            }
            for conn in evicted {
                conn.close_transport().await;
                debug!(server = %server_id, "evicted idle connection");
            }
        }
    }
}

enum Claim {
    Existing(Arc<PooledConnection>),
    Dial,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::TransportConfig;

    fn server_config(id: &str) -> ServerConfig {
        ServerConfig {
            id: id.to_string(),
            name: format!("Server {}", id),
            transport: TransportConfig::Http {
                url: "http://localhost:0/mcp".to_string(),
                headers: Default::default(),
            },
            credential_ref: None,
        }
    }

    #[tokio::test]
    async fn register_rejects_empty_id() {
        let pool = ConnectionPool::new(PoolConfig::default());
        assert!(pool.register(server_config("")).is_err());
        assert!(pool.register(server_config("a")).is_ok());
        // Idempotent.
        assert!(pool.register(server_config("a")).is_ok());
    }

    #[tokio::test]
    async fn get_unknown_server_fails() {
        let pool = ConnectionPool::new(PoolConfig::default());
        match pool.get("ghost").await {
            Err(Error::ServerNotFound(id)) => assert_eq!(id, "ghost"),
            other => panic!("expected ServerNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_pool_rejects_get() {
        let pool = ConnectionPool::new(PoolConfig::default());
        pool.register(server_config("a")).unwrap();
        pool.close().await.unwrap();
        assert!(matches!(pool.get("a").await, Err(Error::PoolClosed)));
    }
}

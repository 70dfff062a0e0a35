//! Periodic health monitoring of registered MCP servers
//!
//! A background tick probes every registered server concurrently with a
//! `ping` obtained through the pool, under a per-check deadline. Servers
//! start optimistically healthy; consecutive failures past the threshold
//! flip them unhealthy, and a single success flips them back.

use crate::error::{Error, Result};
use crate::pool::ConnectionPool;
use crate::types::ServerId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Checks before an unreachable server is flagged unhealthy.
pub const MAX_FAILED_CHECKS: u32 = 3;

/// Default probe cadence.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Per-probe deadline.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct ServerHealth {
    pub server_id: ServerId,
    pub is_healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl ServerHealth {
    fn optimistic(server_id: ServerId) -> Self {
        Self {
            server_id,
            is_healthy: true,
            last_check: None,
            last_success: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub check_interval: Duration,
    pub check_timeout: Duration,
    pub max_failed_checks: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: HEALTH_CHECK_INTERVAL,
            check_timeout: HEALTH_CHECK_TIMEOUT,
            max_failed_checks: MAX_FAILED_CHECKS,
        }
    }
}

pub struct HealthMonitor {
    pool: Arc<ConnectionPool>,
    config: HealthMonitorConfig,
    statuses: Arc<DashMap<ServerId, ServerHealth>>,
    stopped: Arc<AtomicBool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(pool: Arc<ConnectionPool>, config: HealthMonitorConfig) -> Arc<Self> {
        Arc::new(Self {
            pool,
            config,
            statuses: Arc::new(DashMap::new()),
            stopped: Arc::new(AtomicBool::new(false)),
            task: parking_lot::Mutex::new(None),
        })
    }

    /// Track a server, optimistically healthy until a check says
    /// otherwise.
    pub fn register(&self, server_id: impl Into<ServerId>) {
        let server_id = server_id.into();
        self.statuses
            .entry(server_id.clone())
            .or_insert_with(|| ServerHealth::optimistic(server_id));
    }

    /// Start the periodic check loop.
    pub fn start(self: &Arc<Self>) {
        let monitor = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval(monitor.config.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            while !monitor.stopped.load(Ordering::SeqCst) {
                ticker.tick().await;
                monitor.check_all().await;
            }
        });
        *self.task.lock() = Some(task);
    }

    /// One tick: probe every registered server concurrently.
    pub async fn check_all(&self) {
        let server_ids: Vec<ServerId> =
            self.statuses.iter().map(|e| e.key().clone()).collect();

        let checks = server_ids.into_iter().map(|id| async move {
            let result = self.probe(&id).await;
            self.record(&id, result);
        });
        join_all(checks).await;
    }

    /// Force a probe of one server right now and return the updated
    /// status.
    pub async fn check_now(&self, server_id: &str) -> Result<ServerHealth> {
        if !self.statuses.contains_key(server_id) {
            return Err(Error::ServerNotFound(server_id.to_string()));
        }
        let result = self.probe(server_id).await;
        self.record(server_id, result);
        self.get(server_id)
            .ok_or_else(|| Error::ServerNotFound(server_id.to_string()))
    }

    async fn probe(&self, server_id: &str) -> Result<()> {
        let deadline = self.config.check_timeout;
        let outcome = tokio::time::timeout(deadline, async {
            let conn = self.pool.get_with_deadline(server_id, deadline).await?;
            let result = conn.ping(deadline).await;
            self.pool.release(server_id);
            result
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(deadline.as_millis() as u64)),
        }
    }

    fn record(&self, server_id: &str, result: Result<()>) {
        let Some(mut status) = self.statuses.get_mut(server_id) else {
            return;
        };
        let now = Utc::now();
        status.last_check = Some(now);

        match result {
            Ok(()) => {
                status.consecutive_failures = 0;
                status.last_success = Some(now);
                status.last_error = None;
                if !status.is_healthy {
                    info!(server = %server_id, "server recovered");
                }
                status.is_healthy = true;
            },
            Err(e) => {
                status.consecutive_failures += 1;
                status.last_error = Some(e.to_string());
                debug!(
                    server = %server_id,
                    failures = status.consecutive_failures,
                    "health check failed: {}", e
                );
                if status.consecutive_failures >= self.config.max_failed_checks
                    && status.is_healthy
                {
                    warn!(server = %server_id, "server marked unhealthy");
                    status.is_healthy = false;
                }
            },
        }
    }

    pub fn get(&self, server_id: &str) -> Option<ServerHealth> {
        self.statuses.get(server_id).map(|s| s.clone())
    }

    pub fn get_all(&self) -> Vec<ServerHealth> {
        self.statuses.iter().map(|e| e.value().clone()).collect()
    }

    /// Operator override: force healthy and clear the failure counter.
    pub fn mark_healthy(&self, server_id: &str) {
        if let Some(mut status) = self.statuses.get_mut(server_id) {
            status.is_healthy = true;
            status.consecutive_failures = 0;
            status.last_error = None;
        }
    }

    /// Operator override: force unhealthy.
    pub fn mark_unhealthy(&self, server_id: &str) {
        if let Some(mut status) = self.statuses.get_mut(server_id) {
            status.is_healthy = false;
        }
    }

    /// Idempotent stop.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        debug!("health monitor stopped");
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

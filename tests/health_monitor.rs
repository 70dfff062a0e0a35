//! Health monitor: failure thresholds, recovery, and overrides

mod common;

use common::{server_config, MockFactory, MockScript};
use mcpflow::health::{HealthMonitor, HealthMonitorConfig};
use mcpflow::pool::{ConnectionPool, PoolConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn fast_monitor_config() -> HealthMonitorConfig {
    HealthMonitorConfig {
        check_interval: Duration::from_millis(50),
        check_timeout: Duration::from_millis(500),
        max_failed_checks: 3,
    }
}

#[tokio::test]
async fn three_failures_flip_unhealthy_and_recovery_resets() {
    let fail_ping = Arc::new(AtomicBool::new(true));
    let factory = MockFactory::new(MockScript {
        fail_ping: fail_ping.clone(),
        ..MockScript::default()
    });
    let pool = ConnectionPool::with_factory(PoolConfig::default(), factory);
    pool.register(server_config("s")).unwrap();

    let monitor = HealthMonitor::new(pool, fast_monitor_config());
    monitor.register("s");

    // Two failures: still (optimistically) healthy.
    monitor.check_now("s").await.unwrap();
    monitor.check_now("s").await.unwrap();
    let health = monitor.get("s").unwrap();
    assert!(health.is_healthy);
    assert_eq!(health.consecutive_failures, 2);
    assert!(health.last_error.is_some());

    // Third failure crosses the threshold.
    monitor.check_now("s").await.unwrap();
    let health = monitor.get("s").unwrap();
    assert!(!health.is_healthy);
    assert_eq!(health.consecutive_failures, 3);

    // One success resets the counter and restores health.
    fail_ping.store(false, Ordering::SeqCst);
    monitor.check_now("s").await.unwrap();
    let health = monitor.get("s").unwrap();
    assert!(health.is_healthy);
    assert_eq!(health.consecutive_failures, 0);
    assert!(health.last_success.is_some());
    assert!(health.last_error.is_none());
}

#[tokio::test]
async fn background_ticks_flip_failing_server() {
    let factory = MockFactory::new(MockScript {
        fail_ping: Arc::new(AtomicBool::new(true)),
        ..MockScript::default()
    });
    let pool = ConnectionPool::with_factory(PoolConfig::default(), factory);
    pool.register(server_config("s")).unwrap();

    let monitor = HealthMonitor::new(pool, fast_monitor_config());
    monitor.register("s");
    monitor.start();

    // Three tick intervals plus slack.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let health = monitor.get("s").unwrap();
    assert!(!health.is_healthy, "server should be unhealthy after repeated tick failures");
    assert!(health.consecutive_failures >= 3);

    monitor.mark_healthy("s");
    let health = monitor.get("s").unwrap();
    assert!(health.is_healthy);
    assert_eq!(health.consecutive_failures, 0);

    monitor.stop();
}

#[tokio::test]
async fn unreachable_server_counts_as_failure() {
    // No mock override: connecting fails outright.
    let factory = MockFactory::new(MockScript {
        fail_connect: true,
        ..MockScript::default()
    });
    let pool = ConnectionPool::with_factory(PoolConfig::default(), factory);
    pool.register(server_config("s")).unwrap();

    let monitor = HealthMonitor::new(pool, fast_monitor_config());
    monitor.register("s");

    let health = monitor.check_now("s").await.unwrap();
    assert_eq!(health.consecutive_failures, 1);
    assert!(health.last_error.is_some());
}

#[tokio::test]
async fn get_all_reports_every_registered_server() {
    let pool = ConnectionPool::with_factory(PoolConfig::default(), MockFactory::with_default());
    let monitor = HealthMonitor::new(pool, fast_monitor_config());
    monitor.register("a");
    monitor.register("b");

    let mut ids: Vec<String> =
        monitor.get_all().into_iter().map(|h| h.server_id).collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b"]);
}

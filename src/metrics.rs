//! Rolling metrics collection.
//!
//! Combines pool occupancy, error pressure, breaker state, and monitor
//! facts into periodic snapshots with bounded retention, for dashboards
//! and alerting.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::events::{emit, EventSink, ResilienceEvent};
use crate::health::HealthState;
use crate::pool::{ConnectionPool, PoolStats};
use crate::retry::ErrorCounters;

/// Snapshots older than this are pruned every collection cycle.
pub const SNAPSHOT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
/// Average response time above which the store counts as degraded.
pub const DEGRADED_RESPONSE_TIME_MS: f64 = 1_000.0;
/// Error counters are halved once per this many collection cycles.
const COUNTER_DECAY_CYCLES: u32 = 60;
/// Default spacing between collection cycles.
pub const DEFAULT_COLLECTION_INTERVAL: Duration = Duration::from_secs(60);

/// Derived health classification, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// One collection cycle's view of the connection layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp_ms: u64,
    pub pool: PoolStats,
    pub failed_connections: u64,
    pub connection_errors: u64,
    pub timeout_errors: u64,
    pub breaker_state: CircuitState,
    pub status: HealthStatus,
    pub avg_response_time_ms: f64,
}

/// Pruned rolling window of snapshots.
#[derive(Default)]
pub struct MetricsStore {
    snapshots: Mutex<Vec<MetricsSnapshot>>,
}

impl MetricsStore {
    pub fn push(&self, snapshot: MetricsSnapshot) {
        if let Ok(mut snaps) = self.snapshots.lock() {
            snaps.push(snapshot);
        }
    }

    /// Drop everything past the retention window.
    pub fn prune(&self) {
        let cutoff = now_ms().saturating_sub(SNAPSHOT_RETENTION.as_millis() as u64);
        if let Ok(mut snaps) = self.snapshots.lock() {
            snaps.retain(|s| s.timestamp_ms >= cutoff);
        }
    }

    pub fn all(&self) -> Vec<MetricsSnapshot> {
        self.snapshots.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn latest(&self) -> Option<MetricsSnapshot> {
        self.snapshots
            .lock()
            .ok()
            .and_then(|s| s.last().cloned())
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Status precedence: unhealthy beats degraded beats healthy.
pub fn derive_status(
    monitor_healthy: bool,
    breaker_state: CircuitState,
    avg_response_time_ms: f64,
) -> HealthStatus {
    if !monitor_healthy {
        HealthStatus::Unhealthy
    } else if breaker_state != CircuitState::Closed
        || avg_response_time_ms > DEGRADED_RESPONSE_TIME_MS
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Periodic snapshot producer.
pub struct MetricsCollector {
    interval: Duration,
    pool: Arc<dyn ConnectionPool>,
    breaker: CircuitBreaker,
    health: Arc<HealthState>,
    counters: Arc<ErrorCounters>,
    store: Arc<MetricsStore>,
    sink: Arc<dyn EventSink>,
    cycles: AtomicU32,
}

impl MetricsCollector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        interval: Duration,
        pool: Arc<dyn ConnectionPool>,
        breaker: CircuitBreaker,
        health: Arc<HealthState>,
        counters: Arc<ErrorCounters>,
        store: Arc<MetricsStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            interval,
            pool,
            breaker,
            health,
            counters,
            store,
            sink,
            cycles: AtomicU32::new(0),
        }
    }

    pub fn store(&self) -> Arc<MetricsStore> {
        Arc::clone(&self.store)
    }

    /// Spawn the collection loop. Collection problems are logged; the loop
    /// never crashes the host process.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::spawn(async move {
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        self.collect_cycle().await;
                    }
                }
            }
            debug!("metrics collector stopped");
        })
    }

    /// One collection cycle. Exposed so tests can drive cycles directly.
    pub async fn collect_cycle(&self) {
        let pool_stats = self.pool.stats().await;
        let counters = self.counters.snapshot();
        let breaker_state = self.breaker.state();
        let monitor_healthy = self.health.is_healthy();
        let avg_response_time_ms = self.health.avg_response_time_ms();

        let status = derive_status(monitor_healthy, breaker_state, avg_response_time_ms);
        let timestamp_ms = now_ms();
        let snapshot = MetricsSnapshot {
            timestamp_ms,
            pool: pool_stats,
            failed_connections: counters.failed_connections,
            connection_errors: counters.connection_errors,
            timeout_errors: counters.timeout_errors,
            breaker_state,
            status,
            avg_response_time_ms,
        };
        self.store.push(snapshot);
        self.store.prune();

        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        if cycle % COUNTER_DECAY_CYCLES == 0 {
            self.counters.decay();
        }

        debug!(
            status = status.as_str(),
            breaker = breaker_state.as_str(),
            active = pool_stats.active_connections,
            queued = pool_stats.queued_requests,
            "metrics collected"
        );
        emit(
            &self.sink,
            ResilienceEvent::MetricsCollected {
                timestamp_ms,
                status,
            },
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::events::{InMemoryEventSink, NoopEventSink};
    use crate::Result;
    use async_trait::async_trait;

    struct StaticPool(PoolStats);

    #[async_trait]
    impl ConnectionPool for StaticPool {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        async fn reconnect(&self) -> Result<()> {
            Ok(())
        }
        async fn stats(&self) -> PoolStats {
            self.0
        }
        async fn execute(&self, _statement: &str) -> Result<()> {
            Ok(())
        }
    }

    fn collector() -> (MetricsCollector, Arc<MetricsStore>, Arc<InMemoryEventSink>) {
        let sink = Arc::new(InMemoryEventSink::new(200));
        let store = Arc::new(MetricsStore::default());
        let pool = Arc::new(StaticPool(PoolStats {
            total_connections: 10,
            active_connections: 4,
            idle_connections: 6,
            queued_requests: 0,
        }));
        let c = MetricsCollector::new(
            DEFAULT_COLLECTION_INTERVAL,
            pool,
            CircuitBreaker::new(
                CircuitBreakerConfig::default(),
                Arc::new(NoopEventSink) as Arc<dyn EventSink>,
            ),
            Arc::new(HealthState::default()),
            Arc::new(ErrorCounters::default()),
            store.clone(),
            sink.clone() as Arc<dyn EventSink>,
        );
        (c, store, sink)
    }

    #[test]
    fn test_status_precedence() {
        assert_eq!(
            derive_status(false, CircuitState::Closed, 10.0),
            HealthStatus::Unhealthy
        );
        // unhealthy wins even with an open breaker
        assert_eq!(
            derive_status(false, CircuitState::Open, 10.0),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            derive_status(true, CircuitState::Open, 10.0),
            HealthStatus::Degraded
        );
        assert_eq!(
            derive_status(true, CircuitState::HalfOpen, 10.0),
            HealthStatus::Degraded
        );
        assert_eq!(
            derive_status(true, CircuitState::Closed, 1_500.0),
            HealthStatus::Degraded
        );
        assert_eq!(
            derive_status(true, CircuitState::Closed, 10.0),
            HealthStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_collect_cycle_appends_and_notifies() {
        let (c, store, sink) = collector();
        c.collect_cycle().await;
        c.collect_cycle().await;

        assert_eq!(store.len(), 2);
        let latest = store.latest().unwrap();
        assert_eq!(latest.pool.total_connections, 10);
        assert_eq!(latest.status, HealthStatus::Healthy);
        assert_eq!(latest.breaker_state, CircuitState::Closed);
        assert_eq!(sink.count_named("metricsCollected"), 2);
    }

    #[tokio::test]
    async fn test_old_snapshots_pruned() {
        let (c, store, _sink) = collector();

        // seed a snapshot already past the retention window
        let stale_ms = now_ms() - SNAPSHOT_RETENTION.as_millis() as u64 - 1_000;
        store.push(MetricsSnapshot {
            timestamp_ms: stale_ms,
            pool: PoolStats::default(),
            failed_connections: 0,
            connection_errors: 0,
            timeout_errors: 0,
            breaker_state: CircuitState::Closed,
            status: HealthStatus::Healthy,
            avg_response_time_ms: 0.0,
        });

        c.collect_cycle().await;
        let all = store.all();
        assert_eq!(all.len(), 1);
        assert!(all[0].timestamp_ms > stale_ms);
    }

    #[tokio::test]
    async fn test_counters_decay_on_schedule() {
        let (c, _store, _sink) = collector();
        for _ in 0..8 {
            c.counters.record_connection_error();
        }

        for _ in 0..59 {
            c.collect_cycle().await;
        }
        assert_eq!(c.counters.snapshot().connection_errors, 8);

        c.collect_cycle().await;
        // halved, not zeroed
        assert_eq!(c.counters.snapshot().connection_errors, 4);
    }

    #[tokio::test]
    async fn test_snapshot_serializes() {
        let (c, store, _sink) = collector();
        c.collect_cycle().await;
        let json = serde_json::to_string(&store.latest().unwrap()).unwrap();
        assert!(json.contains("\"status\":\"healthy\""));
        assert!(json.contains("\"breaker_state\":\"closed\""));
    }
}

//! Resilience service.
//!
//! Owns the circuit breaker, retry executor, health monitor, metrics
//! collector, and recovery coordinator, and exposes the public query and
//! control surface. Constructed as an explicitly owned instance and passed
//! through application context; there is no global singleton.

use futures::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot, CircuitState};
use crate::config::ResilienceConfig;
use crate::events::{emit, EventSink, ResilienceEvent};
use crate::health::{HealthMonitor, HealthState};
use crate::metrics::{
    MetricsCollector, MetricsSnapshot, MetricsStore, DEFAULT_COLLECTION_INTERVAL,
};
use crate::pool::ConnectionPool;
use crate::recovery::RecoveryCoordinator;
use crate::retry::{
    CallOptions, ErrorCounters, InflightRegistry, RetryExecutor, RetryOperationSnapshot,
};
use crate::Result;

/// How long shutdown waits for the periodic loops to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Aggregated point-in-time view for callers and health endpoints.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub healthy: bool,
    pub breaker_state: CircuitState,
    pub consecutive_failures: u32,
    pub avg_response_time_ms: f64,
    pub in_flight: usize,
}

pub struct ResilienceService {
    cfg: ResilienceConfig,
    metrics_interval: Duration,
    pool: Arc<dyn ConnectionPool>,
    breaker: CircuitBreaker,
    executor: RetryExecutor,
    health_state: Arc<HealthState>,
    counters: Arc<ErrorCounters>,
    store: Arc<MetricsStore>,
    recovery: RecoveryCoordinator,
    sink: Arc<dyn EventSink>,
    shutdown: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ResilienceService {
    /// Build the service around an external pool. The configuration should
    /// already be validated (see [`ResilienceConfig::validate`]).
    pub fn new(
        cfg: ResilienceConfig,
        pool: Arc<dyn ConnectionPool>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let breaker = CircuitBreaker::new(cfg.circuit_breaker.clone(), Arc::clone(&sink));
        let counters = Arc::new(ErrorCounters::default());
        let registry = Arc::new(InflightRegistry::default());
        let executor = RetryExecutor::new(
            cfg.retry.clone(),
            cfg.timeouts.query_timeout(),
            breaker.clone(),
            Arc::clone(&counters),
            registry,
            shutdown.clone(),
        );
        let recovery =
            RecoveryCoordinator::new(cfg.recovery.clone(), Arc::clone(&pool), Arc::clone(&sink));

        Self {
            metrics_interval: DEFAULT_COLLECTION_INTERVAL,
            pool,
            breaker,
            executor,
            health_state: Arc::new(HealthState::default()),
            counters,
            store: Arc::new(MetricsStore::default()),
            recovery,
            sink,
            shutdown,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            cfg,
        }
    }

    /// Override the metrics collection cadence before calling `start`.
    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Spawn the periodic loops (per their `enabled` flags) and announce
    /// readiness. Idempotent.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("resilience service already started");
            return;
        }

        let mut tasks = Vec::new();
        if self.cfg.health_check.enabled {
            let monitor = HealthMonitor::new(
                self.cfg.health_check.clone(),
                Arc::clone(&self.pool),
                self.breaker.clone(),
                Arc::clone(&self.health_state),
                Arc::clone(&self.sink),
            );
            tasks.push(monitor.spawn(self.shutdown.clone()));
        }

        let collector = MetricsCollector::new(
            self.metrics_interval,
            Arc::clone(&self.pool),
            self.breaker.clone(),
            Arc::clone(&self.health_state),
            Arc::clone(&self.counters),
            Arc::clone(&self.store),
            Arc::clone(&self.sink),
        );
        tasks.push(collector.spawn(self.shutdown.clone()));

        if let Ok(mut slot) = self.tasks.lock() {
            slot.extend(tasks);
        }

        info!(
            health_check = self.cfg.health_check.enabled,
            circuit_breaker = self.cfg.circuit_breaker.enabled,
            "resilience service started"
        );
        emit(&self.sink, ResilienceEvent::Initialized).await;
    }

    /// Execute an operation under the retry policy. See
    /// [`RetryExecutor::execute_with_retry`].
    pub async fn execute_with_retry<T, F, Fut>(&self, opts: CallOptions, op: F) -> Result<T>
    where
        F: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.executor.execute_with_retry(opts, op).await
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        ConnectionStatus {
            healthy: self.health_state.is_healthy(),
            breaker_state: self.breaker.state(),
            consecutive_failures: self.health_state.consecutive_failures(),
            avg_response_time_ms: self.health_state.avg_response_time_ms(),
            in_flight: self.executor.registry().len(),
        }
    }

    /// Full retained metrics time series, oldest first.
    pub fn metrics(&self) -> Vec<MetricsSnapshot> {
        self.store.all()
    }

    pub fn latest_metrics(&self) -> Option<MetricsSnapshot> {
        self.store.latest()
    }

    pub fn circuit_breaker_snapshot(&self) -> CircuitBreakerSnapshot {
        self.breaker.snapshot()
    }

    /// Operator override: stop admitting calls immediately.
    pub async fn force_circuit_breaker_open(&self) {
        self.breaker.force_open().await;
    }

    /// Operator override: skip the reset wait and resume admitting trial
    /// calls immediately (Open -> HalfOpen).
    pub async fn force_circuit_breaker_close(&self) {
        self.breaker.force_close().await;
    }

    /// Deliberate reconnection sequence; see
    /// [`RecoveryCoordinator::attempt_connection_recovery`].
    pub async fn attempt_connection_recovery(&self) -> Result<u32> {
        self.recovery.attempt_connection_recovery().await
    }

    /// Introspection over currently executing calls.
    pub fn in_flight(&self) -> Vec<RetryOperationSnapshot> {
        self.executor.registry().snapshot()
    }

    /// Cancel one in-flight call by id. Returns false if it already settled.
    pub fn cancel(&self, id: Uuid) -> bool {
        self.executor.registry().cancel(id)
    }

    /// Graceful teardown: stop the periodic timers, wait for them up to a
    /// grace period, and cancel whatever is still in flight.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, join_all(handles))
            .await
            .is_err()
        {
            warn!("periodic tasks did not stop within the grace period");
        }

        self.executor.registry().clear();
        info!("resilience service shut down");
    }
}

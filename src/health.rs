//! Independent health monitor.
//!
//! Probes the backing store on its own timer so a quiet traffic period
//! neither masks a failing dependency nor delays the discovery of
//! recovery. Probe outcomes feed the shared circuit breaker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::HealthCheckConfig;
use crate::events::{emit, EventSink, ResilienceEvent};
use crate::pool::ConnectionPool;

/// Most recent samples kept in the response-time ring buffer.
const RESPONSE_TIME_CAPACITY: usize = 100;
/// Size the buffer is trimmed back to once capacity is exceeded.
const RESPONSE_TIME_TRIMMED: usize = 50;

/// Shared health facts, readable without touching the monitor loop.
#[derive(Debug)]
pub struct HealthState {
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    response_times: Mutex<VecDeque<Duration>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            response_times: Mutex::new(VecDeque::new()),
        }
    }
}

impl HealthState {
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Rolling average over the ring buffer, in milliseconds.
    pub fn avg_response_time_ms(&self) -> f64 {
        let times = match self.response_times.lock() {
            Ok(times) => times,
            Err(_) => return 0.0,
        };
        if times.is_empty() {
            return 0.0;
        }
        let total: f64 = times.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
        total / times.len() as f64
    }

    pub(crate) fn record_response_time(&self, elapsed: Duration) {
        if let Ok(mut times) = self.response_times.lock() {
            times.push_back(elapsed);
            if times.len() > RESPONSE_TIME_CAPACITY {
                while times.len() > RESPONSE_TIME_TRIMMED {
                    times.pop_front();
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn sample_count(&self) -> usize {
        self.response_times.lock().map(|t| t.len()).unwrap_or(0)
    }
}

/// Periodic prober feeding the circuit breaker and the health state.
pub struct HealthMonitor {
    cfg: HealthCheckConfig,
    pool: Arc<dyn ConnectionPool>,
    breaker: CircuitBreaker,
    state: Arc<HealthState>,
    sink: Arc<dyn EventSink>,
}

impl HealthMonitor {
    pub fn new(
        cfg: HealthCheckConfig,
        pool: Arc<dyn ConnectionPool>,
        breaker: CircuitBreaker,
        state: Arc<HealthState>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            cfg,
            pool,
            breaker,
            state,
            sink,
        }
    }

    pub fn state(&self) -> Arc<HealthState> {
        Arc::clone(&self.state)
    }

    /// Spawn the probe loop. The loop is sequential, so at most one probe
    /// is in flight per check, and a failing probe never kills it.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut interval = tokio::time::interval(self.cfg.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::spawn(async move {
            // the first tick fires immediately; skip it so startup probes
            // wait one full interval
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        self.run_probe_cycle().await;
                    }
                }
            }
            debug!("health monitor stopped");
        })
    }

    /// One probe: race `ping` against the per-probe timeout and apply the
    /// outcome. Exposed so tests can drive cycles without the timer.
    pub async fn run_probe_cycle(&self) {
        let start = Instant::now();
        match tokio::time::timeout(self.cfg.probe_timeout(), self.pool.ping()).await {
            Ok(Ok(())) => {
                self.on_probe_success(start.elapsed()).await;
            }
            Ok(Err(e)) => {
                self.on_probe_failure(&e.to_string()).await;
            }
            Err(_) => {
                self.on_probe_failure("probe timed out").await;
            }
        }
    }

    async fn on_probe_success(&self, elapsed: Duration) {
        self.state.record_response_time(elapsed);
        self.state.consecutive_failures.store(0, Ordering::Relaxed);

        let was_unhealthy = !self.state.healthy.swap(true, Ordering::Relaxed);
        if was_unhealthy {
            debug!(elapsed_ms = elapsed.as_millis() as u64, "health restored");
            emit(&self.sink, ResilienceEvent::HealthRestored).await;
        }

        // A clean probe counts as proof of recovery for a half-open breaker.
        if self.breaker.state() == CircuitState::HalfOpen {
            self.breaker.record_success().await;
        }
    }

    async fn on_probe_failure(&self, reason: &str) {
        let failures = self
            .state
            .consecutive_failures
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        warn!(consecutive_failures = failures, reason, "health probe failed");

        if failures >= self.cfg.failure_threshold {
            let was_healthy = self.state.healthy.swap(false, Ordering::Relaxed);
            if was_healthy {
                emit(
                    &self.sink,
                    ResilienceEvent::HealthDegraded {
                        consecutive_failures: failures,
                    },
                )
                .await;
            }
            // keep feeding the breaker while the store stays unreachable
            self.breaker.record_failure().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::events::InMemoryEventSink;
    use crate::pool::PoolStats;
    use crate::{Error, ErrorContext, Result};
    use async_trait::async_trait;

    /// Pool whose ping outcomes follow a script; falls back to success.
    struct ScriptedPool {
        script: Mutex<VecDeque<bool>>,
    }

    impl ScriptedPool {
        fn new(script: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
            })
        }
    }

    #[async_trait]
    impl ConnectionPool for ScriptedPool {
        async fn ping(&self) -> Result<()> {
            let ok = self.script.lock().unwrap().pop_front().unwrap_or(true);
            if ok {
                Ok(())
            } else {
                Err(Error::transient_with_context(
                    "connection refused",
                    ErrorContext::new(),
                ))
            }
        }

        async fn reconnect(&self) -> Result<()> {
            Ok(())
        }

        async fn stats(&self) -> PoolStats {
            PoolStats::default()
        }

        async fn execute(&self, _statement: &str) -> Result<()> {
            Ok(())
        }
    }

    fn monitor(
        pool: Arc<dyn ConnectionPool>,
        threshold: u32,
    ) -> (HealthMonitor, Arc<HealthState>, Arc<InMemoryEventSink>) {
        let sink = Arc::new(InMemoryEventSink::new(100));
        let state = Arc::new(HealthState::default());
        let cfg = HealthCheckConfig {
            failure_threshold: threshold,
            probe_timeout_ms: 100,
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::default(),
            sink.clone() as Arc<dyn EventSink>,
        );
        let m = HealthMonitor::new(
            cfg,
            pool,
            breaker,
            state.clone(),
            sink.clone() as Arc<dyn EventSink>,
        );
        (m, state, sink)
    }

    #[tokio::test]
    async fn test_unhealthy_only_at_threshold() {
        let pool = ScriptedPool::new(&[false, false, false]);
        let (m, state, sink) = monitor(pool, 3);

        m.run_probe_cycle().await;
        m.run_probe_cycle().await;
        assert!(state.is_healthy());
        assert_eq!(state.consecutive_failures(), 2);
        assert_eq!(sink.count_named("healthDegraded"), 0);

        m.run_probe_cycle().await;
        assert!(!state.is_healthy());
        assert_eq!(sink.count_named("healthDegraded"), 1);
    }

    #[tokio::test]
    async fn test_recovers_on_next_successful_probe() {
        let pool = ScriptedPool::new(&[false, false, true]);
        let (m, state, sink) = monitor(pool, 2);

        m.run_probe_cycle().await;
        m.run_probe_cycle().await;
        assert!(!state.is_healthy());

        m.run_probe_cycle().await;
        assert!(state.is_healthy());
        assert_eq!(state.consecutive_failures(), 0);
        assert_eq!(sink.count_named("healthRestored"), 1);
    }

    #[tokio::test]
    async fn test_degraded_emitted_once_while_unhealthy() {
        let pool = ScriptedPool::new(&[false, false, false, false]);
        let (m, _state, sink) = monitor(pool, 2);

        for _ in 0..4 {
            m.run_probe_cycle().await;
        }
        assert_eq!(sink.count_named("healthDegraded"), 1);
    }

    #[tokio::test]
    async fn test_successful_probe_closes_half_open_breaker() {
        let sink = Arc::new(InMemoryEventSink::new(100));
        let state = Arc::new(HealthState::default());
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_reset_timeout(Duration::from_millis(30)),
            sink.clone() as Arc<dyn EventSink>,
        );
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let m = HealthMonitor::new(
            HealthCheckConfig::default(),
            ScriptedPool::new(&[true]),
            breaker.clone(),
            state,
            sink.clone() as Arc<dyn EventSink>,
        );
        m.run_probe_cycle().await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_probe_timeout_counts_as_failure() {
        struct SlowPool;
        #[async_trait]
        impl ConnectionPool for SlowPool {
            async fn ping(&self) -> Result<()> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
            async fn reconnect(&self) -> Result<()> {
                Ok(())
            }
            async fn stats(&self) -> PoolStats {
                PoolStats::default()
            }
            async fn execute(&self, _statement: &str) -> Result<()> {
                Ok(())
            }
        }

        let (m, state, _sink) = monitor(Arc::new(SlowPool), 3);
        m.run_probe_cycle().await;
        assert_eq!(state.consecutive_failures(), 1);
    }

    #[test]
    fn test_ring_buffer_trims_to_fifty() {
        let state = HealthState::default();
        for i in 0..101 {
            state.record_response_time(Duration::from_millis(i));
        }
        assert_eq!(state.sample_count(), RESPONSE_TIME_TRIMMED);
        // the retained samples are the most recent ones
        assert!(state.avg_response_time_ms() > 50.0);
    }

    #[test]
    fn test_avg_response_time_empty_is_zero() {
        let state = HealthState::default();
        assert_eq!(state.avg_response_time_ms(), 0.0);
    }
}

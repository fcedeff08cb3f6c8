//! Retry executor.
//!
//! Wraps an arbitrary asynchronous operation with a per-attempt timeout,
//! transient-error classification, and exponential backoff with optional
//! jitter. Consults the circuit breaker before attempting anything and
//! feeds it (and the error counters) with the outcome.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::RetryConfig;
use crate::{Error, Result};

/// Classifier deciding whether a failed attempt may be retried.
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Default classification: retry anything matching a transient signature.
pub fn default_retry_predicate(err: &Error) -> bool {
    err.is_transient()
}

/// Per-call options for [`RetryExecutor::execute_with_retry`].
#[derive(Clone)]
pub struct CallOptions {
    /// Operation name for logs, errors, and introspection.
    pub name: String,
    /// Per-attempt budget; falls back to the configured query timeout.
    pub timeout: Option<Duration>,
    /// Override of the configured retry count.
    pub max_retries: Option<u32>,
    /// Override of the default transient classification.
    pub retry_predicate: Option<RetryPredicate>,
}

impl CallOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: None,
            max_retries: None,
            retry_predicate: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_retry_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.retry_predicate = Some(Arc::new(predicate));
        self
    }
}

/// Cumulative error pressure, read by the metrics collector.
///
/// Counters decay (halve) periodically rather than hard-resetting so
/// long-lived processes do not report stale, ever-growing totals.
#[derive(Debug, Default)]
pub struct ErrorCounters {
    connection_errors: AtomicU64,
    timeout_errors: AtomicU64,
    failed_connections: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorCountersSnapshot {
    pub connection_errors: u64,
    pub timeout_errors: u64,
    pub failed_connections: u64,
}

impl ErrorCounters {
    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout_error(&self) {
        self.timeout_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_connection(&self) {
        self.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Halve every counter. Lossy under concurrent increments, which is
    /// acceptable for trend metrics.
    pub fn decay(&self) {
        for counter in [
            &self.connection_errors,
            &self.timeout_errors,
            &self.failed_connections,
        ] {
            let current = counter.load(Ordering::Relaxed);
            counter.store(current / 2, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> ErrorCountersSnapshot {
        ErrorCountersSnapshot {
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            timeout_errors: self.timeout_errors.load(Ordering::Relaxed),
            failed_connections: self.failed_connections.load(Ordering::Relaxed),
        }
    }
}

struct InflightRecord {
    name: String,
    attempts_made: u32,
    max_attempts: u32,
    last_error: Option<String>,
    started_at: Instant,
    delays: Vec<Duration>,
    token: CancellationToken,
}

/// Introspection view of one in-flight call.
#[derive(Debug, Clone)]
pub struct RetryOperationSnapshot {
    pub id: Uuid,
    pub name: String,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub elapsed: Duration,
    pub delays: Vec<Duration>,
}

/// Registry of in-flight calls, keyed by operation id.
///
/// Purely bookkeeping on the hot path; cancellation is the one control
/// operation it offers.
#[derive(Default)]
pub struct InflightRegistry {
    ops: Mutex<HashMap<Uuid, InflightRecord>>,
}

impl InflightRegistry {
    fn insert(&self, id: Uuid, record: InflightRecord) {
        if let Ok(mut ops) = self.ops.lock() {
            ops.insert(id, record);
        }
    }

    fn with_record(&self, id: Uuid, f: impl FnOnce(&mut InflightRecord)) {
        if let Ok(mut ops) = self.ops.lock() {
            if let Some(record) = ops.get_mut(&id) {
                f(record);
            }
        }
    }

    fn remove(&self, id: Uuid) {
        if let Ok(mut ops) = self.ops.lock() {
            ops.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.ops.lock().map(|ops| ops.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<RetryOperationSnapshot> {
        let now = Instant::now();
        self.ops
            .lock()
            .map(|ops| {
                ops.iter()
                    .map(|(id, r)| RetryOperationSnapshot {
                        id: *id,
                        name: r.name.clone(),
                        attempts_made: r.attempts_made,
                        max_attempts: r.max_attempts,
                        last_error: r.last_error.clone(),
                        elapsed: now.duration_since(r.started_at),
                        delays: r.delays.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Cancel one call. The in-flight attempt is aborted at its next
    /// suspension point; the caller observes [`Error::Cancelled`].
    pub fn cancel(&self, id: Uuid) -> bool {
        if let Ok(ops) = self.ops.lock() {
            if let Some(record) = ops.get(&id) {
                record.token.cancel();
                return true;
            }
        }
        false
    }

    /// Cancel everything and drop the bookkeeping (shutdown path).
    pub fn clear(&self) {
        if let Ok(mut ops) = self.ops.lock() {
            for record in ops.values() {
                record.token.cancel();
            }
            ops.clear();
        }
    }
}

/// Compute the backoff delay for a 0-based attempt index, without jitter:
/// `min(base_delay * multiplier^attempt, max_delay)`.
pub fn compute_backoff(cfg: &RetryConfig, attempt: u32) -> Duration {
    let base = cfg.base_delay_ms as f64;
    let raw = base * cfg.backoff_multiplier.powi(attempt as i32);
    let capped = raw.min(cfg.max_delay_ms as f64);
    Duration::from_millis(capped as u64)
}

fn apply_jitter(delay: Duration) -> Duration {
    // +/-10%
    let factor = 0.9 + fastrand::f64() * 0.2;
    Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
}

/// Executes caller-supplied operations under the retry policy.
///
/// Cheaply cloneable; clones share the breaker, counters, and registry.
#[derive(Clone)]
pub struct RetryExecutor {
    cfg: RetryConfig,
    default_timeout: Duration,
    breaker: CircuitBreaker,
    counters: Arc<ErrorCounters>,
    registry: Arc<InflightRegistry>,
    shutdown: CancellationToken,
}

impl RetryExecutor {
    pub fn new(
        cfg: RetryConfig,
        default_timeout: Duration,
        breaker: CircuitBreaker,
        counters: Arc<ErrorCounters>,
        registry: Arc<InflightRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            cfg,
            default_timeout,
            breaker,
            counters,
            registry,
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<InflightRegistry> {
        &self.registry
    }

    pub fn counters(&self) -> &Arc<ErrorCounters> {
        &self.counters
    }

    /// Execute `op` with per-attempt timeout, retry classification, and
    /// exponential backoff.
    ///
    /// `op` is a factory invoked once per attempt; it receives the call's
    /// cancellation token so implementations can observe aborts inside
    /// their own suspension points. On exhaustion the ORIGINAL last error
    /// is surfaced, not a synthetic wrapper.
    pub async fn execute_with_retry<T, F, Fut>(&self, opts: CallOptions, op: F) -> Result<T>
    where
        F: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // Fast-fail while open: no attempt, no timer, no registry entry.
        self.breaker.try_acquire()?;

        let max_retries = opts.max_retries.unwrap_or(self.cfg.max_retries);
        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        let id = Uuid::new_v4();
        let token = self.shutdown.child_token();

        self.registry.insert(
            id,
            InflightRecord {
                name: opts.name.clone(),
                attempts_made: 0,
                max_attempts: max_retries + 1,
                last_error: None,
                started_at: Instant::now(),
                delays: Vec::new(),
                token: token.clone(),
            },
        );

        let result = self
            .run_attempts(&opts, op, id, token, timeout, max_retries)
            .await;

        // Remove the bookkeeping entry however the call settled.
        self.registry.remove(id);
        result
    }

    async fn run_attempts<T, F, Fut>(
        &self,
        opts: &CallOptions,
        op: F,
        id: Uuid,
        token: CancellationToken,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<T>
    where
        F: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            self.registry
                .with_record(id, |r| r.attempts_made = attempt + 1);

            let outcome = tokio::select! {
                res = op(token.clone()) => res,
                _ = tokio::time::sleep(timeout) => Err(Error::Timeout {
                    operation: opts.name.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
                _ = token.cancelled() => Err(Error::Cancelled {
                    operation: opts.name.clone(),
                }),
            };

            match outcome {
                Ok(value) => {
                    // A clean trial call is proof of recovery.
                    if self.breaker.state() == CircuitState::HalfOpen {
                        self.breaker.record_success().await;
                    }
                    return Ok(value);
                }
                Err(err @ Error::Cancelled { .. }) => {
                    debug!(operation = opts.name.as_str(), "call cancelled");
                    return Err(err);
                }
                Err(err) => {
                    let is_timeout = matches!(err, Error::Timeout { .. });
                    if is_timeout {
                        self.counters.record_timeout_error();
                    }

                    let retryable = match &opts.retry_predicate {
                        Some(predicate) => predicate(&err),
                        None => default_retry_predicate(&err),
                    };
                    if retryable && !is_timeout {
                        self.counters.record_connection_error();
                    }

                    self.registry
                        .with_record(id, |r| r.last_error = Some(err.to_string()));

                    if !retryable || attempt >= max_retries {
                        warn!(
                            operation = opts.name.as_str(),
                            attempts = attempt + 1,
                            retryable,
                            error = %err,
                            "operation failed"
                        );
                        self.counters.record_failed_connection();
                        self.breaker.record_failure().await;
                        return Err(err);
                    }

                    let mut delay = compute_backoff(&self.cfg, attempt);
                    if self.cfg.jitter {
                        delay = apply_jitter(delay);
                    }
                    debug!(
                        operation = opts.name.as_str(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    self.registry.with_record(id, |r| r.delays.push(delay));

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => {
                            return Err(Error::Cancelled {
                                operation: opts.name.clone(),
                            });
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }
}

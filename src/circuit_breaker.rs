//! Three-state circuit breaker.
//!
//! - **Closed**: normal operation, failures are counted
//! - **Open**: calls fail fast until the reset timer fires
//! - **HalfOpen**: trial calls probe for recovery
//!
//! All mutation funnels through `record_success` / `record_failure` /
//! `force_open` / `force_close`, each of which re-checks the current state
//! under the lock so a reset timer racing a call-path failure cannot double
//! transition. A generation counter guarantees at most one live reset timer:
//! stale timers observe a mismatch and do nothing.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::debug;

use crate::config::CircuitBreakerConfig;
use crate::events::{emit, EventSink, ResilienceEvent};
use crate::{Error, ErrorContext, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time view of the breaker for introspection and metrics.
#[derive(Debug, Clone)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

#[derive(Debug)]
struct State {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    /// Bumped on every transition into or out of Open; a pending reset
    /// timer only fires if its generation still matches.
    generation: u64,
    /// Calls admitted since entering HalfOpen (trial_call_limit > 0 only).
    trial_calls_admitted: u32,
}

struct Shared {
    cfg: CircuitBreakerConfig,
    state: Mutex<State>,
    sink: Arc<dyn EventSink>,
}

/// Cheaply cloneable handle; all clones share one state machine.
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                cfg,
                state: Mutex::new(State {
                    state: CircuitState::Closed,
                    failure_count: 0,
                    last_failure: None,
                    opened_at: None,
                    generation: 0,
                    trial_calls_admitted: 0,
                }),
                sink,
            }),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.shared.cfg
    }

    pub fn state(&self) -> CircuitState {
        if let Ok(st) = self.shared.state.lock() {
            st.state
        } else {
            // a poisoned breaker reads as Open: stop admitting traffic
            // rather than bypassing unknown state
            CircuitState::Open
        }
    }

    /// Whether calls are currently admitted. False only while Open.
    pub fn is_call_allowed(&self) -> bool {
        !self.shared.cfg.enabled || self.state() != CircuitState::Open
    }

    /// Admission check used by the retry executor.
    ///
    /// Unlike [`is_call_allowed`](Self::is_call_allowed) this consumes a
    /// trial slot while HalfOpen when `trial_call_limit` is bounded.
    pub fn try_acquire(&self) -> Result<()> {
        if !self.shared.cfg.enabled {
            return Ok(());
        }
        let mut st = self.lock()?;
        match st.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let retry_after_ms = self.open_remaining_ms(&st);
                Err(Error::CircuitOpen { retry_after_ms })
            }
            CircuitState::HalfOpen => {
                let limit = self.shared.cfg.trial_call_limit;
                if limit > 0 && st.trial_calls_admitted >= limit {
                    let retry_after_ms = self.open_remaining_ms(&st);
                    return Err(Error::CircuitOpen { retry_after_ms });
                }
                st.trial_calls_admitted = st.trial_calls_admitted.saturating_add(1);
                Ok(())
            }
        }
    }

    /// Feed a successful operation or health probe.
    ///
    /// HalfOpen → Closed on the first success; `failure_count` resets to 0
    /// exactly on that transition.
    pub async fn record_success(&self) {
        if !self.shared.cfg.enabled {
            return;
        }
        let closed = {
            let mut st = match self.lock() {
                Ok(st) => st,
                Err(_) => return,
            };
            if st.state == CircuitState::HalfOpen {
                st.state = CircuitState::Closed;
                st.failure_count = 0;
                st.last_failure = None;
                st.opened_at = None;
                st.trial_calls_admitted = 0;
                st.generation = st.generation.wrapping_add(1);
                true
            } else {
                false
            }
        };
        if closed {
            debug!("circuit breaker closed after successful trial");
            emit(&self.shared.sink, ResilienceEvent::CircuitBreakerClosed).await;
        }
    }

    /// Feed a failed operation or health probe.
    ///
    /// Closed → Open once `failure_threshold` is reached within the
    /// monitoring window. A failure while HalfOpen re-opens immediately.
    /// While already Open this is a no-op, so overlapping failures cannot
    /// schedule duplicate reset timers.
    pub async fn record_failure(&self) {
        if !self.shared.cfg.enabled {
            return;
        }
        let opened = {
            let mut st = match self.lock() {
                Ok(st) => st,
                Err(_) => return,
            };
            let now = Instant::now();
            match st.state {
                CircuitState::Closed => {
                    // A stale failure streak restarts the count.
                    if let Some(last) = st.last_failure {
                        if now.duration_since(last) > self.shared.cfg.monitoring_window() {
                            st.failure_count = 0;
                        }
                    }
                    st.failure_count = st.failure_count.saturating_add(1);
                    st.last_failure = Some(now);
                    if st.failure_count >= self.shared.cfg.failure_threshold {
                        Some(self.open_locked(&mut st, now))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    st.failure_count = st.failure_count.saturating_add(1);
                    st.last_failure = Some(now);
                    Some(self.open_locked(&mut st, now))
                }
                CircuitState::Open => None,
            }
        };
        if let Some(failure_count) = opened {
            debug!(failure_count, "circuit breaker opened");
            emit(
                &self.shared.sink,
                ResilienceEvent::CircuitBreakerOpened { failure_count },
            )
            .await;
        }
    }

    /// Operator override: open regardless of thresholds.
    pub async fn force_open(&self) {
        let opened = {
            let mut st = match self.lock() {
                Ok(st) => st,
                Err(_) => return,
            };
            if st.state == CircuitState::Open {
                None
            } else {
                Some(self.open_locked(&mut st, Instant::now()))
            }
        };
        if let Some(failure_count) = opened {
            emit(
                &self.shared.sink,
                ResilienceEvent::CircuitBreakerOpened { failure_count },
            )
            .await;
        }
    }

    /// Operator override: leave Open immediately, without waiting for the
    /// reset timer. Lands in HalfOpen, so the next clean operation (not the
    /// override itself) is what closes the breaker.
    pub async fn force_close(&self) {
        let half_opened = {
            let mut st = match self.lock() {
                Ok(st) => st,
                Err(_) => return,
            };
            if st.state == CircuitState::Open {
                st.state = CircuitState::HalfOpen;
                st.opened_at = None;
                st.trial_calls_admitted = 0;
                st.generation = st.generation.wrapping_add(1);
                true
            } else {
                false
            }
        };
        if half_opened {
            debug!("circuit breaker half-opened by manual override");
            emit(&self.shared.sink, ResilienceEvent::CircuitBreakerHalfOpened).await;
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let cfg = &self.shared.cfg;
        if let Ok(st) = self.shared.state.lock() {
            CircuitBreakerSnapshot {
                state: st.state,
                failure_count: st.failure_count,
                failure_threshold: cfg.failure_threshold,
                reset_timeout_ms: cfg.reset_timeout_ms,
                open_remaining_ms: self.open_remaining_ms(&st),
            }
        } else {
            // same fail-safe reading as state()
            CircuitBreakerSnapshot {
                state: CircuitState::Open,
                failure_count: 0,
                failure_threshold: cfg.failure_threshold,
                reset_timeout_ms: cfg.reset_timeout_ms,
                open_remaining_ms: None,
            }
        }
    }

    /// Transition to Open under the lock and schedule the single reset
    /// timer. Returns the failure count at the moment of opening.
    fn open_locked(&self, st: &mut State, now: Instant) -> u32 {
        st.state = CircuitState::Open;
        st.opened_at = Some(now);
        st.trial_calls_admitted = 0;
        st.generation = st.generation.wrapping_add(1);
        self.schedule_reset(st.generation);
        st.failure_count
    }

    fn schedule_reset(&self, generation: u64) {
        let shared = Arc::clone(&self.shared);
        let timeout = shared.cfg.reset_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let half_opened = {
                let mut st = match shared.state.lock() {
                    Ok(st) => st,
                    Err(_) => return,
                };
                if st.state == CircuitState::Open && st.generation == generation {
                    st.state = CircuitState::HalfOpen;
                    st.trial_calls_admitted = 0;
                    true
                } else {
                    false
                }
            };
            if half_opened {
                debug!("circuit breaker half-opened after reset timeout");
                emit(&shared.sink, ResilienceEvent::CircuitBreakerHalfOpened).await;
            }
        });
    }

    fn open_remaining_ms(&self, st: &State) -> Option<u64> {
        if st.state != CircuitState::Open {
            return None;
        }
        let opened_at = st.opened_at?;
        let deadline = opened_at + self.shared.cfg.reset_timeout();
        let now = Instant::now();
        if deadline > now {
            Some((deadline - now).as_millis() as u64)
        } else {
            Some(0)
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.shared.state.lock().map_err(|_| {
            Error::non_retryable_with_context(
                "circuit breaker state poisoned",
                ErrorContext::new().with_source("circuit_breaker"),
            )
        })
    }
}

//! Explicit recovery coordinator.
//!
//! A deliberate, bounded reconnection procedure for use after a sustained
//! outage. Distinct from the per-call retry path: callers invoke it on
//! demand, and a successful reconnect is followed by warm-up operations
//! that prime state before normal traffic resumes.

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::RecoveryConfig;
use crate::events::{emit, EventSink, ResilienceEvent};
use crate::pool::ConnectionPool;
use crate::{Error, Result};

pub struct RecoveryCoordinator {
    cfg: RecoveryConfig,
    pool: Arc<dyn ConnectionPool>,
    sink: Arc<dyn EventSink>,
}

impl RecoveryCoordinator {
    pub fn new(cfg: RecoveryConfig, pool: Arc<dyn ConnectionPool>, sink: Arc<dyn EventSink>) -> Self {
        Self { cfg, pool, sink }
    }

    /// Run the reconnection sequence.
    ///
    /// Invokes the pool's reconnect up to `max_attempts` times, waiting
    /// `backoff` between failed attempts. The first success triggers the
    /// configured warm-up operations (best-effort) and returns the number
    /// of attempts used. Exhaustion yields [`Error::RecoveryExhausted`]
    /// carrying the last underlying error.
    pub async fn attempt_connection_recovery(&self) -> Result<u32> {
        if !self.cfg.enabled {
            return Err(Error::RecoveryExhausted {
                attempts: 0,
                last_error: Some("recovery disabled by configuration".into()),
            });
        }

        let mut last_error: Option<String> = None;
        for attempt in 1..=self.cfg.max_attempts {
            info!(attempt, max_attempts = self.cfg.max_attempts, "attempting connection recovery");
            match self.pool.reconnect().await {
                Ok(()) => {
                    self.run_warmups().await;
                    info!(attempts = attempt, "connection recovered");
                    emit(
                        &self.sink,
                        ResilienceEvent::ConnectionRecovered { attempts: attempt },
                    )
                    .await;
                    return Ok(attempt);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    last_error = Some(e.to_string());
                    if attempt < self.cfg.max_attempts {
                        tokio::time::sleep(self.cfg.backoff()).await;
                    }
                }
            }
        }

        Err(Error::RecoveryExhausted {
            attempts: self.cfg.max_attempts,
            last_error,
        })
    }

    /// Warm-up failures are logged, never fatal.
    async fn run_warmups(&self) {
        for statement in &self.cfg.warmup_operations {
            if let Err(e) = self.pool.execute(statement).await {
                warn!(statement = statement.as_str(), error = %e, "warm-up operation failed");
            }
        }
    }
}

//! Virtual-time verification of the retry schedule: with jitter disabled
//! the waits between attempts are exactly the configured exponential
//! sequence, capped at the maximum delay.

use pool_resilience::{
    CallOptions, CircuitBreakerConfig, ConnectionPool, Error, ErrorContext, EventSink,
    NoopEventSink, PoolStats, ResilienceConfig, ResilienceService, Result, RetryConfig,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

struct IdlePool;

#[async_trait]
impl ConnectionPool for IdlePool {
    async fn ping(&self) -> Result<()> {
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

#[tokio::test(start_paused = true)]
async fn retry_delays_follow_capped_exponential_sequence() {
    let mut cfg = ResilienceConfig::default();
    cfg.retry = RetryConfig::new()
        .with_max_retries(4)
        .with_base_delay(Duration::from_millis(1000))
        .with_max_delay(Duration::from_millis(5000))
        .with_backoff_multiplier(2.0)
        .with_jitter(false);
    // keep the breaker out of the way
    cfg.circuit_breaker = CircuitBreakerConfig::new().with_failure_threshold(100);

    let service = ResilienceService::new(
        cfg,
        Arc::new(IdlePool),
        Arc::new(NoopEventSink) as Arc<dyn EventSink>,
    );

    let attempt_times: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = attempt_times.clone();

    let result: Result<()> = service
        .execute_with_retry(CallOptions::new("timed"), |_token| {
            let recorder = recorder.clone();
            async move {
                recorder.lock().unwrap().push(Instant::now());
                Err(Error::transient_with_context(
                    "connection lost",
                    ErrorContext::new(),
                ))
            }
        })
        .await;
    assert!(result.is_err());

    let times = attempt_times.lock().unwrap();
    assert_eq!(times.len(), 5);
    let gaps: Vec<u64> = times
        .windows(2)
        .map(|w| (w[1] - w[0]).as_millis() as u64)
        .collect();
    assert_eq!(gaps, vec![1000, 2000, 4000, 5000]);
}

#[tokio::test(start_paused = true)]
async fn per_attempt_timeout_bounds_a_hung_operation() {
    let mut cfg = ResilienceConfig::default();
    cfg.retry = RetryConfig::new()
        .with_max_retries(0)
        .with_jitter(false);

    let service = ResilienceService::new(
        cfg,
        Arc::new(IdlePool),
        Arc::new(NoopEventSink) as Arc<dyn EventSink>,
    );

    let started = Instant::now();
    let result: Result<()> = service
        .execute_with_retry(
            CallOptions::new("hung").with_timeout(Duration::from_millis(250)),
            |_token| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            },
        )
        .await;

    match result {
        Err(Error::Timeout {
            operation,
            timeout_ms,
        }) => {
            assert_eq!(operation, "hung");
            assert_eq!(timeout_ms, 250);
        }
        other => panic!("expected Timeout, got {:?}", other.err()),
    }
    assert_eq!(started.elapsed(), Duration::from_millis(250));
}

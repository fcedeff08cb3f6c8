//! # pool-resilience
//!
//! A resilience layer that shields application code from transient failures
//! of a shared database connection pool. Per call it decides whether to
//! attempt an operation at all, how long to wait, how many times to retry,
//! when to stop sending traffic entirely, and when it is safe to resume.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CircuitBreaker`] | Three-state machine (closed/open/half-open) guarding admission |
//! | [`RetryExecutor`] | Per-attempt timeout, transient classification, exponential backoff |
//! | [`HealthMonitor`](health::HealthMonitor) | Periodic probe independent of application traffic |
//! | [`MetricsCollector`](metrics::MetricsCollector) | Rolling snapshots with 24h retention |
//! | [`RecoveryCoordinator`](recovery::RecoveryCoordinator) | Explicit reconnect + warm-up sequence |
//! | [`ResilienceService`] | Owns all of the above; the application-facing surface |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pool_resilience::{
//!     CallOptions, EventSink, ResilienceConfig, ResilienceService, TracingEventSink,
//! };
//! # use pool_resilience::{ConnectionPool, PoolStats, Result};
//! # struct MyPool;
//! # #[async_trait::async_trait]
//! # impl ConnectionPool for MyPool {
//! #     async fn ping(&self) -> Result<()> { Ok(()) }
//! #     async fn reconnect(&self) -> Result<()> { Ok(()) }
//! #     async fn stats(&self) -> PoolStats { PoolStats::default() }
//! #     async fn execute(&self, _statement: &str) -> Result<()> { Ok(()) }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> pool_resilience::Result<()> {
//!     let config = ResilienceConfig::from_env()?;
//!     let pool = Arc::new(MyPool);
//!     let service = ResilienceService::new(
//!         config,
//!         pool,
//!         Arc::new(TracingEventSink) as Arc<dyn EventSink>,
//!     );
//!     service.start().await;
//!
//!     let row_count = service
//!         .execute_with_retry(CallOptions::new("count_users"), |_token| async {
//!             // run the query against the pool here
//!             Ok(42u64)
//!         })
//!         .await?;
//!
//!     println!("{} rows", row_count);
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Design
//!
//! State is local to one running instance; this is not a distributed
//! circuit breaker. All breaker mutation funnels through guarded entry
//! points so timer callbacks racing call-path failures cannot double
//! transition. Cancellation is explicit: every call carries a token and
//! [`ResilienceService::cancel`] aborts the in-flight attempt at its next
//! suspension point.

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod pool;
pub mod recovery;
pub mod retry;
pub mod service;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot, CircuitState};
pub use config::{
    CircuitBreakerConfig, HealthCheckConfig, RecoveryConfig, ResilienceConfig, RetryConfig,
    TimeoutConfig,
};
pub use error::{Error, ErrorContext, TRANSIENT_SIGNATURES};
pub use events::{
    CompositeEventSink, EventSink, InMemoryEventSink, NoopEventSink, ResilienceEvent,
    TracingEventSink,
};
pub use health::HealthState;
pub use metrics::{HealthStatus, MetricsSnapshot};
pub use pool::{ConnectionPool, PoolStats};
pub use retry::{
    default_retry_predicate, CallOptions, ErrorCountersSnapshot, RetryExecutor,
    RetryOperationSnapshot,
};
pub use service::{ConnectionStatus, ResilienceService};

/// Convenience result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

//! Resilience configuration.
//!
//! All settings are environment-sourced with documented defaults and can
//! also be built programmatically or deserialized from a config file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Error, ErrorContext, Result};

/// Timeouts applied at the pool boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Establishing a new connection.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_ms: u64,
    /// Running a single query.
    #[serde(default = "default_query_timeout_ms")]
    pub query_ms: u64,
    /// Idle connection reap threshold.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_ms: u64,
    /// Waiting for a pooled connection.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_ms: u64,
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}
fn default_query_timeout_ms() -> u64 {
    30_000
}
fn default_idle_timeout_ms() -> u64 {
    300_000
}
fn default_acquire_timeout_ms() -> u64 {
    10_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connection_ms: default_connection_timeout_ms(),
            query_ms: default_query_timeout_ms(),
            idle_ms: default_idle_timeout_ms(),
            acquire_ms: default_acquire_timeout_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_ms)
    }
}

/// Retry policy for the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the initial attempt (total attempts = max_retries + 1).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Randomize each delay by +/-10% to avoid synchronized retry storms.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_true() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Consecutive failures (within the monitoring window) before opening.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing with half-open.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    /// Failures older than this window are forgotten.
    #[serde(default = "default_monitoring_window_ms")]
    pub monitoring_window_ms: u64,
    /// Calls admitted while half-open before rejecting; 0 = unlimited.
    #[serde(default)]
    pub trial_call_limit: u32,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_ms() -> u64 {
    30_000
}
fn default_monitoring_window_ms() -> u64 {
    60_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            monitoring_window_ms: default_monitoring_window_ms(),
            trial_call_limit: 0,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_monitoring_window(mut self, window: Duration) -> Self {
        self.monitoring_window_ms = window.as_millis() as u64;
        self
    }

    pub fn with_trial_call_limit(mut self, limit: u32) -> Self {
        self.trial_call_limit = limit;
        self
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn monitoring_window(&self) -> Duration {
        Duration::from_millis(self.monitoring_window_ms)
    }
}

/// Periodic health probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    /// Budget for a single probe.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Consecutive probe failures before flipping to unhealthy.
    #[serde(default = "default_health_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_health_interval_ms() -> u64 {
    30_000
}
fn default_probe_timeout_ms() -> u64 {
    5_000
}
fn default_health_failure_threshold() -> u32 {
    3
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_health_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            failure_threshold: default_health_failure_threshold(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Explicit reconnection procedure settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_recovery_attempts")]
    pub max_attempts: u32,
    /// Wait between failed reconnect attempts.
    #[serde(default = "default_recovery_backoff_ms")]
    pub backoff_ms: u64,
    /// Benign statements run after a successful reconnect to prime state.
    #[serde(default = "default_warmup_operations")]
    pub warmup_operations: Vec<String>,
}

fn default_recovery_attempts() -> u32 {
    3
}
fn default_recovery_backoff_ms() -> u64 {
    5_000
}
fn default_warmup_operations() -> Vec<String> {
    vec!["SELECT 1".to_string()]
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_recovery_attempts(),
            backoff_ms: default_recovery_backoff_ms(),
            warmup_operations: default_warmup_operations(),
        }
    }
}

impl RecoveryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Immutable top-level configuration, loaded once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl ResilienceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from `DB_RESILIENCE_*` environment variables.
    ///
    /// Unset variables fall back to the documented defaults; unparseable
    /// values are a configuration error rather than a silent fallback.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `DB_RESILIENCE_CONNECTION_TIMEOUT_MS` | 10000 |
    /// | `DB_RESILIENCE_QUERY_TIMEOUT_MS` | 30000 |
    /// | `DB_RESILIENCE_IDLE_TIMEOUT_MS` | 300000 |
    /// | `DB_RESILIENCE_ACQUIRE_TIMEOUT_MS` | 10000 |
    /// | `DB_RESILIENCE_MAX_RETRIES` | 3 |
    /// | `DB_RESILIENCE_BASE_DELAY_MS` | 1000 |
    /// | `DB_RESILIENCE_MAX_DELAY_MS` | 30000 |
    /// | `DB_RESILIENCE_BACKOFF_MULTIPLIER` | 2.0 |
    /// | `DB_RESILIENCE_JITTER` | true |
    /// | `DB_RESILIENCE_CB_ENABLED` | true |
    /// | `DB_RESILIENCE_CB_FAILURE_THRESHOLD` | 5 |
    /// | `DB_RESILIENCE_CB_RESET_TIMEOUT_MS` | 30000 |
    /// | `DB_RESILIENCE_CB_MONITORING_WINDOW_MS` | 60000 |
    /// | `DB_RESILIENCE_CB_TRIAL_CALL_LIMIT` | 0 (unlimited) |
    /// | `DB_RESILIENCE_HEALTH_ENABLED` | true |
    /// | `DB_RESILIENCE_HEALTH_INTERVAL_MS` | 30000 |
    /// | `DB_RESILIENCE_HEALTH_PROBE_TIMEOUT_MS` | 5000 |
    /// | `DB_RESILIENCE_HEALTH_FAILURE_THRESHOLD` | 3 |
    /// | `DB_RESILIENCE_RECOVERY_ENABLED` | true |
    /// | `DB_RESILIENCE_RECOVERY_MAX_ATTEMPTS` | 3 |
    /// | `DB_RESILIENCE_RECOVERY_BACKOFF_MS` | 5000 |
    /// | `DB_RESILIENCE_WARMUP_OPERATIONS` | `SELECT 1` (`;`-separated) |
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        cfg.timeouts.connection_ms =
            env_parse("DB_RESILIENCE_CONNECTION_TIMEOUT_MS", cfg.timeouts.connection_ms)?;
        cfg.timeouts.query_ms = env_parse("DB_RESILIENCE_QUERY_TIMEOUT_MS", cfg.timeouts.query_ms)?;
        cfg.timeouts.idle_ms = env_parse("DB_RESILIENCE_IDLE_TIMEOUT_MS", cfg.timeouts.idle_ms)?;
        cfg.timeouts.acquire_ms =
            env_parse("DB_RESILIENCE_ACQUIRE_TIMEOUT_MS", cfg.timeouts.acquire_ms)?;

        cfg.retry.max_retries = env_parse("DB_RESILIENCE_MAX_RETRIES", cfg.retry.max_retries)?;
        cfg.retry.base_delay_ms =
            env_parse("DB_RESILIENCE_BASE_DELAY_MS", cfg.retry.base_delay_ms)?;
        cfg.retry.max_delay_ms = env_parse("DB_RESILIENCE_MAX_DELAY_MS", cfg.retry.max_delay_ms)?;
        cfg.retry.backoff_multiplier =
            env_parse("DB_RESILIENCE_BACKOFF_MULTIPLIER", cfg.retry.backoff_multiplier)?;
        cfg.retry.jitter = env_parse("DB_RESILIENCE_JITTER", cfg.retry.jitter)?;

        cfg.circuit_breaker.enabled =
            env_parse("DB_RESILIENCE_CB_ENABLED", cfg.circuit_breaker.enabled)?;
        cfg.circuit_breaker.failure_threshold = env_parse(
            "DB_RESILIENCE_CB_FAILURE_THRESHOLD",
            cfg.circuit_breaker.failure_threshold,
        )?;
        cfg.circuit_breaker.reset_timeout_ms = env_parse(
            "DB_RESILIENCE_CB_RESET_TIMEOUT_MS",
            cfg.circuit_breaker.reset_timeout_ms,
        )?;
        cfg.circuit_breaker.monitoring_window_ms = env_parse(
            "DB_RESILIENCE_CB_MONITORING_WINDOW_MS",
            cfg.circuit_breaker.monitoring_window_ms,
        )?;
        cfg.circuit_breaker.trial_call_limit = env_parse(
            "DB_RESILIENCE_CB_TRIAL_CALL_LIMIT",
            cfg.circuit_breaker.trial_call_limit,
        )?;

        cfg.health_check.enabled =
            env_parse("DB_RESILIENCE_HEALTH_ENABLED", cfg.health_check.enabled)?;
        cfg.health_check.interval_ms =
            env_parse("DB_RESILIENCE_HEALTH_INTERVAL_MS", cfg.health_check.interval_ms)?;
        cfg.health_check.probe_timeout_ms = env_parse(
            "DB_RESILIENCE_HEALTH_PROBE_TIMEOUT_MS",
            cfg.health_check.probe_timeout_ms,
        )?;
        cfg.health_check.failure_threshold = env_parse(
            "DB_RESILIENCE_HEALTH_FAILURE_THRESHOLD",
            cfg.health_check.failure_threshold,
        )?;

        cfg.recovery.enabled = env_parse("DB_RESILIENCE_RECOVERY_ENABLED", cfg.recovery.enabled)?;
        cfg.recovery.max_attempts =
            env_parse("DB_RESILIENCE_RECOVERY_MAX_ATTEMPTS", cfg.recovery.max_attempts)?;
        cfg.recovery.backoff_ms =
            env_parse("DB_RESILIENCE_RECOVERY_BACKOFF_MS", cfg.recovery.backoff_ms)?;
        if let Ok(ops) = std::env::var("DB_RESILIENCE_WARMUP_OPERATIONS") {
            cfg.recovery.warmup_operations = ops
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations that would make the layer misbehave silently.
    pub fn validate(&self) -> Result<()> {
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::configuration_with_context(
                "backoff_multiplier must be >= 1.0",
                ErrorContext::new()
                    .with_operation("retry.backoff_multiplier")
                    .with_source("config"),
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(Error::configuration_with_context(
                "max_delay_ms must be >= base_delay_ms",
                ErrorContext::new()
                    .with_operation("retry.max_delay_ms")
                    .with_source("config"),
            ));
        }
        if self.circuit_breaker.enabled && self.circuit_breaker.failure_threshold == 0 {
            return Err(Error::configuration_with_context(
                "failure_threshold must be > 0 when the breaker is enabled",
                ErrorContext::new()
                    .with_operation("circuit_breaker.failure_threshold")
                    .with_source("config"),
            ));
        }
        if self.health_check.enabled && self.health_check.interval_ms == 0 {
            return Err(Error::configuration_with_context(
                "health check interval must be > 0",
                ErrorContext::new()
                    .with_operation("health_check.interval_ms")
                    .with_source("config"),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            Error::configuration_with_context(
                format!("invalid value '{}'", raw),
                ErrorContext::new().with_operation(key).with_source("config"),
            )
        }),
        Err(_) => Ok(default),
    }
}

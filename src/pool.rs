//! Connection-pool collaborator boundary.
//!
//! The resilience layer never owns the pool; it consumes this narrow
//! contract and leaves pooling, queries, and schema concerns to the
//! implementation behind it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Pool occupancy counters, read by the metrics collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_connections: u32,
    pub active_connections: u32,
    pub idle_connections: u32,
    pub queued_requests: u32,
}

/// Contract consumed from the connection-pool abstraction.
///
/// Implementations must keep `ping` lightweight; the health monitor issues
/// at most one probe at a time but calls it on every interval tick.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Lightweight reachability probe (e.g., `SELECT 1` on a checked-out
    /// connection).
    async fn ping(&self) -> Result<()>;

    /// Tear down and re-establish the underlying connections.
    async fn reconnect(&self) -> Result<()>;

    /// Current occupancy counters.
    async fn stats(&self) -> PoolStats;

    /// Raw execute capability, used for warm-up operations only.
    async fn execute(&self, statement: &str) -> Result<()>;
}

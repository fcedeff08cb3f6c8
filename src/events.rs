//! Typed lifecycle notifications.
//!
//! Every observable transition in the layer is a variant of
//! [`ResilienceEvent`], delivered to an [`EventSink`] owned by the service
//! instance. The enum makes the event contract exhaustive at compile time;
//! there are no string-keyed channels to typo.

use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tracing::warn;

use crate::metrics::HealthStatus;
use crate::Result;

/// Lifecycle notifications emitted for observability/alerting integration.
#[derive(Debug, Clone, PartialEq)]
pub enum ResilienceEvent {
    /// The service finished construction and its timers are running.
    Initialized,
    HealthRestored,
    HealthDegraded { consecutive_failures: u32 },
    CircuitBreakerOpened { failure_count: u32 },
    CircuitBreakerHalfOpened,
    CircuitBreakerClosed,
    ConnectionRecovered { attempts: u32 },
    MetricsCollected { timestamp_ms: u64, status: HealthStatus },
}

impl ResilienceEvent {
    /// Stable name for logs and external systems.
    pub fn name(&self) -> &'static str {
        match self {
            ResilienceEvent::Initialized => "initialized",
            ResilienceEvent::HealthRestored => "healthRestored",
            ResilienceEvent::HealthDegraded { .. } => "healthDegraded",
            ResilienceEvent::CircuitBreakerOpened { .. } => "circuitBreakerOpened",
            ResilienceEvent::CircuitBreakerHalfOpened => "circuitBreakerHalfOpened",
            ResilienceEvent::CircuitBreakerClosed => "circuitBreakerClosed",
            ResilienceEvent::ConnectionRecovered { .. } => "connectionRecovered",
            ResilienceEvent::MetricsCollected { .. } => "metricsCollected",
        }
    }
}

/// Destination for lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn report(&self, event: ResilienceEvent) -> Result<()>;
}

/// Default sink: drops everything.
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn report(&self, _event: ResilienceEvent) -> Result<()> {
        Ok(())
    }
}

/// In-memory sink for testing.
pub struct InMemoryEventSink {
    events: Arc<RwLock<Vec<ResilienceEvent>>>,
    max_events: usize,
}

impl InMemoryEventSink {
    pub fn new(max: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            max_events: max,
        }
    }

    pub fn events(&self) -> Vec<ResilienceEvent> {
        self.events.read().unwrap().clone()
    }

    pub fn count_named(&self, name: &str) -> usize {
        self.events
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }

    pub fn clear(&self) {
        self.events.write().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn report(&self, event: ResilienceEvent) -> Result<()> {
        let mut events = self.events.write().unwrap();
        events.push(event);
        if events.len() > self.max_events {
            events.remove(0);
        }
        Ok(())
    }
}

/// Sink that forwards events to structured logging.
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn report(&self, event: ResilienceEvent) -> Result<()> {
        tracing::info!(event = event.name(), detail = ?event, "resilience event");
        Ok(())
    }
}

/// Composite sink for multiple destinations.
pub struct CompositeEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl CompositeEventSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn add_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl Default for CompositeEventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for CompositeEventSink {
    async fn report(&self, event: ResilienceEvent) -> Result<()> {
        for s in &self.sinks {
            let _ = s.report(event.clone()).await;
        }
        Ok(())
    }
}

/// Deliver an event, logging (never propagating) sink failures.
pub(crate) async fn emit(sink: &Arc<dyn EventSink>, event: ResilienceEvent) {
    let name = event.name();
    if let Err(e) = sink.report(event).await {
        warn!(event = name, error = %e, "event sink rejected notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_sink_records_and_trims() {
        let sink = InMemoryEventSink::new(2);
        sink.report(ResilienceEvent::Initialized).await.unwrap();
        sink.report(ResilienceEvent::HealthRestored).await.unwrap();
        sink.report(ResilienceEvent::CircuitBreakerClosed)
            .await
            .unwrap();

        // oldest event evicted
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.events()[0], ResilienceEvent::HealthRestored);
    }

    #[tokio::test]
    async fn test_composite_fans_out() {
        let a = Arc::new(InMemoryEventSink::new(10));
        let b = Arc::new(InMemoryEventSink::new(10));
        let composite = CompositeEventSink::new()
            .add_sink(a.clone() as Arc<dyn EventSink>)
            .add_sink(b.clone() as Arc<dyn EventSink>);

        composite
            .report(ResilienceEvent::HealthDegraded {
                consecutive_failures: 3,
            })
            .await
            .unwrap();

        assert_eq!(a.count_named("healthDegraded"), 1);
        assert_eq!(b.count_named("healthDegraded"), 1);
    }

    #[test]
    fn test_event_names_are_stable() {
        assert_eq!(
            ResilienceEvent::CircuitBreakerOpened { failure_count: 5 }.name(),
            "circuitBreakerOpened"
        );
        assert_eq!(ResilienceEvent::Initialized.name(), "initialized");
    }
}

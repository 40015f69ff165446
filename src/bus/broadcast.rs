//! In-process broadcast implementation of the event bus.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;

use super::{BusError, EventBus, EventEnvelope};

/// Default buffer per subscriber before lagging consumers drop events.
const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out bus on a tokio broadcast channel.
///
/// Publishing is non-blocking; slow subscribers lag and lose the oldest
/// events rather than back-pressuring the engine. Downstream consumers
/// deduplicate by idempotency key, so redelivery after a publish retry is
/// harmless.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl BroadcastBus {
    /// Creates a bus with the default per-subscriber capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a bus with an explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Registers a new observer.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for BroadcastBus {
    async fn publish(&self, envelope: EventEnvelope) -> Result<(), BusError> {
        trace!(
            kind = envelope.event.kind(),
            key = %envelope.metadata.idempotency_key,
            "publishing event"
        );
        // A send with no subscribers is not an error: the engine runs the
        // same with or without observers attached.
        let _ = self.tx.send(envelope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EngineEvent;

    fn error_event(task: &str) -> EventEnvelope {
        EventEnvelope::new(EngineEvent::Error {
            task_id: task.to_string(),
            message: "boom".to_string(),
            context: "test".to_string(),
        })
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = BroadcastBus::new();
        bus.publish(error_event("t1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = BroadcastBus::new();
        let mut rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();

        bus.publish(error_event("t2")).await.unwrap();

        let got_a = rx_a.recv().await.unwrap();
        let got_b = rx_b.recv().await.unwrap();
        assert_eq!(got_a.metadata.idempotency_key, "error-t2");
        assert_eq!(got_b.metadata.idempotency_key, "error-t2");
    }
}

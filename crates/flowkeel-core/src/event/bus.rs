//! Broadcast event bus for distributing `FlowEvent` to multiple subscribers.
//!
//! Built on `tokio::sync::broadcast`. Publishing with no active subscribers
//! is a no-op, so the engine never blocks on observers.

use flowkeel_types::event::FlowEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus for run lifecycle and trace events.
///
/// Cloning the bus clones the sender, so engines and adapters can share one
/// channel.
pub struct EventBus {
    sender: broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a subscriber that receives all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Dropped silently when nobody listens; slow
    /// subscribers observe `RecvError::Lagged` instead of stalling runs.
    pub fn publish(&self, event: FlowEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowkeel_types::run::RunStatus;
    use uuid::Uuid;

    fn started(run_id: Uuid) -> FlowEvent {
        FlowEvent::RunStarted {
            run_id,
            flow_name: "nightly-sync".to_string(),
            trigger_kind: "manual".to_string(),
            resumed: false,
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_published_events() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.clone().subscribe();
        let run_id = Uuid::now_v7();

        bus.publish(started(run_id));

        assert_eq!(first.recv().await.unwrap().run_id(), run_id);
        assert_eq!(second.recv().await.unwrap().run_id(), run_id);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new(4);
        bus.publish(FlowEvent::RunFinished {
            run_id: Uuid::now_v7(),
            flow_name: "f".to_string(),
            status: RunStatus::Completed,
            duration_ms: 3,
        });
        assert_eq!(bus.receiver_count(), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_reports_lag() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(started(Uuid::now_v7()));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}

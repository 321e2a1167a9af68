//! In-process event bus. The only back-channel between the composite
//! detector's children and the rest of the system, the engine and
//! alerting, and alerting and the orchestrator — per the "cyclic
//! ownership" design note, components publish events rather than calling
//! back into their owner.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Topics emitted by the core. Kept as a tagged enum (not a bare string)
/// so subscribers can match exhaustively.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "topic", content = "payload", rename_all = "snake_case")]
pub enum Event {
    DataCollected { source_id: String, count: usize },
    DataBatchReady { batch_id: String, source_id: String, size: usize },
    DataQualityAnomaly { source_id: String, validity: f64 },
    AnomalyDetectionCompleted { detector: String, anomalies: usize, samples: usize },
    AnomalyAlertCreated { alert_id: String, anomaly_id: String },
    AnomalyAlertAcknowledged { alert_id: String, user: String },
    AnomalyAlertEscalated { alert_id: String, level: u32 },
    AnomalyAlertResolved { alert_id: String },
    DetectorPerformanceRecorded { detector: String },
    DetectorScaledUp { detector: String, reason: String },
    DetectorScaledDown { detector: String, reason: String },
}

/// A small broadcast-backed bus. Cloning shares the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publishing never blocks and never fails the caller: with no
    /// subscribers the send is simply dropped, matching the "events are the
    /// only back-channel, never a required collaborator" design.
    pub fn publish(&self, event: Event) {
        trace!(?event, "publishing event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(Event::AnomalyAlertResolved { alert_id: "a1".into() });
        let event = rx.recv().await.unwrap();
        matches!(event, Event::AnomalyAlertResolved { .. });
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(Event::DataCollected { source_id: "s".into(), count: 1 });
    }
}

use crate::types::RunEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: RunEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeStatus, RunId};

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(RunEvent::NodeStatusChanged {
            run_id: RunId::from_str("r"),
            node_id: "a".into(),
            status: NodeStatus::Running,
            timestamp: chrono::Utc::now(),
        });
        match rx.recv().await.unwrap() {
            RunEvent::NodeStatusChanged { node_id, status, .. } => {
                assert_eq!(node_id, "a");
                assert_eq!(status, NodeStatus::Running);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        EventBus::new(4).publish(RunEvent::LiveStopped {
            live_id: "l".into(),
            passes: 0,
            reason: crate::types::LiveStopReason::UserStopped,
        });
    }
}

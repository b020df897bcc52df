use crate::types::PipelineEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: PipelineEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
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

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(PipelineEvent::PipelineStopped {
            pipeline: "p".into(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, PipelineEvent::PipelineStopped { .. }));
    }

    #[test]
    fn test_publish_without_receivers_is_ok() {
        let bus = EventBus::default();
        bus.publish(PipelineEvent::PipelineStopped {
            pipeline: "p".into(),
        });
    }
}

use tokio::sync::broadcast;

use crate::models::HistoryEvent;

/// Receives download lifecycle events for the API layer and notifiers.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: HistoryEvent);
}

/// Broadcast-based sink. Subscribers that fall behind receive
/// `RecvError::Lagged` and should re-read the history store.
pub struct EventBus {
    tx: broadcast::Sender<HistoryEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for EventBus {
    /// Events published with no subscribers are dropped.
    fn emit(&self, event: HistoryEvent) {
        tracing::debug!("history event hash={}", event.hash());
        let _ = self.tx.send(event);
    }
}

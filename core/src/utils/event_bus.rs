/// Event bus for UI collaborators: fans SyncEvents out to every listener
use crate::types::SyncEvent;
use tokio::sync::broadcast;
use tracing::trace;

pub struct EventBus {
    viewer_id: String,
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(viewer_id: String, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { viewer_id, tx }
    }

    /// Publish an event. Having no listeners is fine.
    pub fn emit(&self, event: SyncEvent) {
        trace!("[{}] event {:?}", self.viewer_id, event);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            viewer_id: self.viewer_id.clone(),
            tx: self.tx.clone(),
        }
    }
}

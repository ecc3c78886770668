//! Lifecycle events published by the version manager.
//!
//! The index coordinator subscribes to [`LifecycleEvent::VersionReady`] instead
//! of being called by the version manager directly, so either side can be
//! replaced in tests.

use tokio::sync::broadcast;

use super::schema::IndexKey;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A version reached `completed`.
    VersionReady { key: IndexKey },
    /// A version reached `failed`.
    VersionFailed { key: IndexKey, reason: String },
    /// A version was deleted together with its index entry.
    VersionDeleted { key: IndexKey },
}

impl LifecycleEvent {
    pub fn key(&self) -> &IndexKey {
        match self {
            LifecycleEvent::VersionReady { key }
            | LifecycleEvent::VersionFailed { key, .. }
            | LifecycleEvent::VersionDeleted { key } => key,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: LifecycleEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("lifecycle event dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

//! # Lifecycle Events
//!
//! The core emits lifecycle events for external listeners (schedulers,
//! resource managers, monitors) and never interprets them itself. Each
//! subscriber gets an independent unbounded stream; a dropped receiver is
//! pruned on the next emission.

use crate::id::{ActiveObjectId, NodeAddress};
use crate::migration::MigrationTicket;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Lifecycle notifications emitted by a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RuntimeEvent {
    /// A body finished terminating (graceful or immediate).
    BodyTerminated { id: ActiveObjectId },
    /// A migration began; the source queue has been cut over.
    MigrationStarted {
        id: ActiveObjectId,
        source: NodeAddress,
        destination: NodeAddress,
    },
    /// The body is live at the destination and the directory is updated.
    MigrationCompleted { ticket: MigrationTicket },
    /// The migration aborted; the source body resumed unchanged.
    MigrationFailed { ticket: MigrationTicket },
}

/// Stamped event as delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StampedEvent {
    pub event: RuntimeEvent,
    /// Milliseconds since the Unix epoch, at emission.
    pub timestamp: u64,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<StampedEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StampedEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn emit(&self, event: RuntimeEvent) {
        let stamped = StampedEvent {
            event,
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
        };
        debug!(event = ?stamped.event, "emitting lifecycle event");
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(stamped.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_and_prune() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let second = bus.subscribe();
        drop(second);

        let id = ActiveObjectId::generate();
        bus.emit(RuntimeEvent::BodyTerminated { id });

        let received = first.recv().await.unwrap();
        assert!(matches!(
            received.event,
            RuntimeEvent::BodyTerminated { id: got } if got == id
        ));
        // The dropped subscriber was pruned.
        assert_eq!(bus.subscribers.lock().unwrap().len(), 1);
    }
}

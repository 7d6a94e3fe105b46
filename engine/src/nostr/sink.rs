//! Fire-and-forget event publishing.
//!
//! The ledger is the source of truth; events are advisory. Publishing goes
//! through a bounded queue drained by a dedicated task, and saturation drops
//! the event with a warning rather than blocking the engine.

use crate::nostr::event::NostrEvent;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub trait EventSink: Send + Sync {
    fn publish(&self, event: NostrEvent);
}

/// Production sink: non-blocking handoff into the relay publisher queue.
pub struct RelayQueueSink {
    tx: mpsc::Sender<NostrEvent>,
}

impl RelayQueueSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<NostrEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl EventSink for RelayQueueSink {
    fn publish(&self, event: NostrEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let event = match e {
                mpsc::error::TrySendError::Full(ev) => ev,
                mpsc::error::TrySendError::Closed(ev) => ev,
            };
            warn!(
                target = "bank",
                kind = event.kind,
                id = %event.id,
                "event queue saturated, dropping event"
            );
        }
    }
}

/// Drains the publish queue. Relay transport attaches here; this service
/// hands events off and never retries.
pub async fn run_relay_publisher(mut rx: mpsc::Receiver<NostrEvent>, relays: Vec<String>) {
    while let Some(event) = rx.recv().await {
        debug!(
            target = "bank",
            kind = event.kind,
            id = %event.id,
            relays = relays.len(),
            "publishing event"
        );
    }
}

/// Captures published events in memory; test support.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<NostrEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NostrEvent> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<u32> {
        self.events().iter().map(|e| e.kind).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut g) = self.events.lock() {
            g.clear();
        }
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: NostrEvent) {
        if let Ok(mut g) = self.events.lock() {
            g.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_event(kind: u32) -> NostrEvent {
        NostrEvent {
            id: format!("{kind:064}"),
            pubkey: "00".repeat(32),
            created_at: 0,
            kind,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        }
    }

    #[tokio::test]
    async fn queue_delivers_in_order() {
        let (sink, mut rx) = RelayQueueSink::new(4);
        sink.publish(dummy_event(1050));
        sink.publish(dummy_event(1051));
        assert_eq!(rx.recv().await.unwrap().kind, 1050);
        assert_eq!(rx.recv().await.unwrap().kind, 1051);
    }

    #[tokio::test]
    async fn saturated_queue_drops_instead_of_blocking() {
        let (sink, mut rx) = RelayQueueSink::new(1);
        sink.publish(dummy_event(1));
        sink.publish(dummy_event(2)); // dropped
        assert_eq!(rx.recv().await.unwrap().kind, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn memory_sink_captures() {
        let sink = MemorySink::new();
        sink.publish(dummy_event(30052));
        sink.publish(dummy_event(1050));
        assert_eq!(sink.kinds(), vec![30052, 1050]);
        sink.clear();
        assert!(sink.events().is_empty());
    }
}

//! Per-engine observer registry.
//!
//! Observers are how the application hears about the session: admission
//! requests, departures, crashes, and every outbound Media Event ready for
//! wire transport. Delivery is fire-and-forget; a slow observer loses
//! messages rather than back-pressuring the engine.

use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use roomcast_protocol::{EndpointId, PeerId};

/// Capacity of an observer channel.
pub const OBSERVER_CHANNEL_CAPACITY: usize = 1024;

const DROP_LOG_INTERVAL: u64 = 100;

/// Where an outbound Media Event should be delivered. Every observer
/// receives every event; the transport uses the target to pick sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventTarget {
    Broadcast,
    Peer(PeerId),
}

/// Messages delivered to registered observers.
#[derive(Debug, Clone)]
pub enum EngineMessage {
    /// A peer asked to join; the application must reply with accept or deny.
    NewPeer { peer_id: PeerId, metadata: Value },
    /// A peer is gone (leave, removal, or crash teardown).
    PeerLeft { peer_id: PeerId, metadata: Value },
    /// An endpoint task died abnormally and was contained.
    EndpointCrashed { endpoint_id: EndpointId },
    /// A serialized Media Event ready for the wire.
    MediaEvent { to: EventTarget, data: Bytes },
}

pub type ObserverSender = mpsc::Sender<EngineMessage>;

struct ObserverSlot {
    sender: ObserverSender,
    // Atomic so dispatch can bump it while iterating the table read-only.
    drop_count: AtomicU64,
}

/// Observer table of one engine. Written from the engine actor, read during
/// dispatch.
pub struct Registry {
    session_id: String,
    observers: DashMap<String, ObserverSlot>,
}

impl Registry {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            observers: DashMap::new(),
        }
    }

    /// Register an observer. Idempotent per observer id: a second register
    /// keeps the original channel.
    pub fn register(&self, observer_id: impl Into<String>, sender: ObserverSender) -> bool {
        let observer_id = observer_id.into();
        if self.observers.contains_key(&observer_id) {
            warn!(
                session = %self.session_id,
                observer = %observer_id,
                "observer already registered"
            );
            return false;
        }
        self.observers.insert(
            observer_id,
            ObserverSlot {
                sender,
                drop_count: AtomicU64::new(0),
            },
        );
        true
    }

    pub fn unregister(&self, observer_id: &str) -> bool {
        if self.observers.remove(observer_id).is_none() {
            warn!(
                session = %self.session_id,
                observer = %observer_id,
                "unregister of unknown observer"
            );
            return false;
        }
        true
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Deliver to every observer without blocking. Full channels drop the
    /// message, closed channels are unlinked.
    pub fn dispatch(&self, message: EngineMessage) {
        let mut closed = Vec::new();

        for entry in self.observers.iter() {
            let slot = entry.value();
            match slot.sender.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let dropped = slot.drop_count.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped % DROP_LOG_INTERVAL == 0 {
                        warn!(
                            session = %self.session_id,
                            observer = %entry.key(),
                            dropped,
                            "observer dropping messages due to backpressure"
                        );
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(entry.key().clone()),
            }
        }

        for id in closed {
            self.observers.remove(&id);
            debug!(session = %self.session_id, observer = %id, "removed closed observer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn message() -> EngineMessage {
        EngineMessage::NewPeer {
            peer_id: PeerId::from("p1"),
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn dispatch_reaches_every_observer() {
        let registry = Registry::new("s");
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        assert!(registry.register("a", tx_a));
        assert!(registry.register("b", tx_b));

        registry.dispatch(message());

        assert!(timeout(Duration::from_secs(1), rx_a.recv()).await.is_ok());
        assert!(timeout(Duration::from_secs(1), rx_b.recv()).await.is_ok());
    }

    #[tokio::test]
    async fn double_register_does_not_duplicate_deliveries() {
        let registry = Registry::new("s");
        let (tx, mut rx) = mpsc::channel(8);
        assert!(registry.register("a", tx.clone()));
        assert!(!registry.register("a", tx));

        registry.dispatch(message());

        rx.recv().await.unwrap();
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn closed_observers_are_unlinked() {
        let registry = Registry::new("s");
        let (tx, rx) = mpsc::channel(8);
        registry.register("a", tx);
        drop(rx);

        registry.dispatch(message());
        assert_eq!(registry.observer_count(), 0);
    }

    #[tokio::test]
    async fn full_observer_drops_instead_of_blocking() {
        let registry = Registry::new("s");
        let (tx, mut rx) = mpsc::channel(1);
        registry.register("slow", tx);

        registry.dispatch(message());
        registry.dispatch(message());

        // First message queued, second dropped; dispatch never blocked.
        rx.recv().await.unwrap();
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
        assert_eq!(registry.observer_count(), 1);
    }
}

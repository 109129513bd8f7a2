//! Streaming notification fan-out
//!
//! Each observer owns an independent bounded queue. Publishing is a
//! non-blocking `try_send` per observer: a full queue drops the event
//! (this channel is best-effort, at-least-attempted delivery — observers
//! needing strict consistency poll the registry instead), and a closed
//! queue gets the observer pruned. A background loop sends a keepalive on
//! any channel that has been idle past the configured interval so
//! stream-style consumers can tell "alive but idle" from "dead".

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use fleet_core::time::now_millis;

use crate::events::{EventBus, EventKind};

/// One streamed notification, serialized as `{"type": ..., "data": ...}`
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
}

impl Notification {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    fn keepalive() -> Self {
        Self::new("keepalive", serde_json::Value::Null)
    }
}

struct ObserverSlot {
    tx: mpsc::Sender<Notification>,
    /// Unix millis of the last successful enqueue on this channel
    last_sent: AtomicU64,
}

/// An observer's receiving end; dropping it ends the subscription (the
/// hub prunes the slot on its next delivery attempt)
pub struct Observer {
    pub id: Uuid,
    pub rx: mpsc::Receiver<Notification>,
}

/// Fan-out hub with per-observer bounded queues
pub struct NotificationHub {
    observers: DashMap<Uuid, Arc<ObserverSlot>>,
    queue_capacity: usize,
}

impl NotificationHub {
    /// Create a hub whose observer queues hold `queue_capacity` events
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            observers: DashMap::new(),
            queue_capacity,
        }
    }

    /// Register a new observer and hand back its queue.
    ///
    /// The first notification on the channel confirms the subscription.
    pub fn subscribe(&self) -> Observer {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = Uuid::new_v4();

        let slot = Arc::new(ObserverSlot {
            tx,
            last_sent: AtomicU64::new(now_millis()),
        });
        // Fresh channel, cannot be full
        let _ = slot.tx.try_send(Notification::new(
            "connected",
            serde_json::json!({"message": "notification stream connected"}),
        ));

        self.observers.insert(id, slot);
        tracing::debug!("Notification observer {} subscribed", id);
        Observer { id, rx }
    }

    /// Explicitly remove an observer
    pub fn unsubscribe(&self, id: &Uuid) {
        self.observers.remove(id);
    }

    /// Number of registered observers
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Deliver a notification to every observer, best-effort.
    pub fn publish(&self, notification: &Notification) {
        let mut dead = Vec::new();

        for entry in self.observers.iter() {
            match entry.value().tx.try_send(notification.clone()) {
                Ok(()) => {
                    entry.value().last_sent.store(now_millis(), Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(
                        "Observer {} queue full, dropping {}",
                        entry.key(),
                        notification.kind
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*entry.key());
                }
            }
        }

        for id in dead {
            tracing::debug!("Pruning dead notification observer {}", id);
            self.observers.remove(&id);
        }
    }

    /// Wire the hub to the event bus: connection transitions become
    /// `sut_online`/`sut_offline` notifications. The handlers only do a
    /// non-blocking enqueue, so bus dispatch never stalls on observers.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) {
        let hub = Arc::clone(self);
        bus.subscribe(EventKind::Connected, move |event| {
            hub.publish(&Notification::new("sut_online", event.data.clone()));
            Ok(())
        });

        let hub = Arc::clone(self);
        bus.subscribe(EventKind::Disconnected, move |event| {
            hub.publish(&Notification::new("sut_offline", event.data.clone()));
            Ok(())
        });
    }

    /// Run the keepalive loop until cancelled.
    pub async fn run_keepalive(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval.min(Duration::from_secs(5)));
        let idle_millis = interval.as_millis() as u64;

        tracing::info!("Starting notification keepalive loop (interval: {:?})", interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.send_keepalives(idle_millis);
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Notification keepalive loop shutting down");
                    break;
                }
            }
        }
    }

    fn send_keepalives(&self, idle_millis: u64) {
        let now = now_millis();
        let mut dead = Vec::new();

        for entry in self.observers.iter() {
            let idle = now.saturating_sub(entry.value().last_sent.load(Ordering::Relaxed));
            if idle < idle_millis {
                continue;
            }
            match entry.value().tx.try_send(Notification::keepalive()) {
                Ok(()) => {
                    entry.value().last_sent.store(now, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*entry.key()),
                Err(mpsc::error::TrySendError::Full(_)) => {}
            }
        }

        for id in dead {
            self.observers.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_receives_confirmation() {
        let hub = NotificationHub::new(8);
        let mut observer = hub.subscribe();

        let first = observer.rx.recv().await.unwrap();
        assert_eq!(first.kind, "connected");
    }

    #[tokio::test]
    async fn test_publish_reaches_all_observers() {
        let hub = NotificationHub::new(8);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        hub.publish(&Notification::new(
            "sut_online",
            serde_json::json!({"unique_id": "dev-1"}),
        ));

        // Skip the confirmation notification
        a.rx.recv().await.unwrap();
        b.rx.recv().await.unwrap();
        assert_eq!(a.rx.recv().await.unwrap().kind, "sut_online");
        assert_eq!(b.rx.recv().await.unwrap().kind, "sut_online");
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let hub = NotificationHub::new(2);
        let _observer = hub.subscribe();

        // Queue holds the confirmation plus one event; the rest must drop
        for i in 0..10 {
            hub.publish(&Notification::new("sut_online", serde_json::json!({"n": i})));
        }

        // Still subscribed: full is not dead
        assert_eq!(hub.observer_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_observer_pruned_on_publish() {
        let hub = NotificationHub::new(8);
        let observer = hub.subscribe();
        drop(observer.rx);

        hub.publish(&Notification::new("sut_offline", serde_json::Value::Null));
        assert_eq!(hub.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_keepalive_sent_when_idle() {
        let hub = Arc::new(NotificationHub::new(8));
        let mut observer = hub.subscribe();
        observer.rx.recv().await.unwrap(); // confirmation

        // Force the slot to look idle, then run one keepalive pass
        hub.observers
            .get(&observer.id)
            .unwrap()
            .last_sent
            .store(0, Ordering::Relaxed);
        hub.send_keepalives(1);

        let next = observer.rx.recv().await.unwrap();
        assert_eq!(next.kind, "keepalive");
    }

    #[tokio::test]
    async fn test_bus_attachment_translates_events() {
        use crate::events::{Event, EventKind};
        use fleet_core::SutId;

        let bus = EventBus::new();
        let hub = Arc::new(NotificationHub::new(8));
        hub.attach(&bus);

        let mut observer = hub.subscribe();
        observer.rx.recv().await.unwrap(); // confirmation

        bus.publish(&Event::new(
            EventKind::Disconnected,
            SutId::new("dev-1"),
            serde_json::json!({"unique_id": "dev-1"}),
        ));

        let n = observer.rx.recv().await.unwrap();
        assert_eq!(n.kind, "sut_offline");
        assert_eq!(n.data["unique_id"], "dev-1");
    }

    #[test]
    fn test_notification_serializes_with_type_tag() {
        let n = Notification::new("sut_online", serde_json::json!({"unique_id": "dev-1"}));
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["type"], "sut_online");
        assert_eq!(value["data"]["unique_id"], "dev-1");
    }
}

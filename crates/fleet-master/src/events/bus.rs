//! Typed publish/subscribe bus decoupling state changes from observers
//!
//! Dispatch is synchronous: `publish` invokes every handler registered for
//! the event's kind, in registration order, on the publishing task. A
//! handler that needs to do I/O must hand the work off (e.g. a non-blocking
//! enqueue) so that publish never stalls on a slow consumer. Handler errors
//! are logged and do not affect sibling handlers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use fleet_core::SutId;

/// Event kinds the bus dispatches on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A device's transport was admitted
    Connected,
    /// A device's transport closed
    Disconnected,
}

/// A state-transition notification
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub sut_id: SutId,
    /// Free-form payload forwarded to external observers
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, sut_id: SutId, data: serde_json::Value) -> Self {
        Self { kind, sut_id, data }
    }
}

type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// In-process typed pub/sub
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<Handler>>>,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event kind.
    ///
    /// Handlers run in registration order.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .expect("event bus lock poisoned")
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Dispatch an event to every handler registered for its kind.
    ///
    /// A failing handler is logged and skipped; the rest still run.
    pub fn publish(&self, event: &Event) {
        let handlers: Vec<Handler> = {
            let map = self.handlers.read().expect("event bus lock poisoned");
            match map.get(&event.kind) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        for handler in handlers {
            if let Err(e) = handler(event) {
                tracing::warn!(
                    "Event handler failed for {:?} ({}): {}",
                    event.kind,
                    event.sut_id,
                    e
                );
            }
        }
    }
}

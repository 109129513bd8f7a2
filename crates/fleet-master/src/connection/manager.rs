//! Connection manager: the bijection between device identity and live
//! transport, and the sole source of truth for "is this device reachable"
//!
//! Knows nothing about the device registry or pairing; its only side
//! channel is the event bus, which it raises `Connected`/`Disconnected`
//! on. Reconnects are last-writer-wins: admitting a session for an
//! identity that already has one cancels the prior transport, and the
//! session epoch lets the superseded driver recognise that its teardown
//! no longer owns the entry.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fleet_core::{FleetError, SutId};
use fleet_protocol::MasterMessage;

use crate::events::{Event, EventBus, EventKind};

/// Handle to one live device transport
#[derive(Debug)]
pub struct DeviceSession {
    /// Device identity
    pub sut_id: SutId,
    /// Session epoch assigned by the registry at admission
    pub session_id: u64,
    /// Peer address the device registered with
    pub ip: String,
    /// Outbound message queue drained by the transport driver
    outbound: mpsc::Sender<MasterMessage>,
    /// Cancelled to force the transport closed
    cancel: CancellationToken,
}

impl DeviceSession {
    /// Create a session handle for a freshly admitted transport
    pub fn new(
        sut_id: SutId,
        session_id: u64,
        ip: String,
        outbound: mpsc::Sender<MasterMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sut_id,
            session_id,
            ip,
            outbound,
            cancel,
        }
    }

    /// Non-blocking delivery attempt; false means "could not deliver now"
    pub fn try_send(&self, message: MasterMessage) -> bool {
        self.outbound.try_send(message).is_ok()
    }

    /// Force the transport closed
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether the transport is closing (or already closed)
    pub fn is_closing(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes when the session is closed
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }
}

/// Owns the set of live sessions, one per online device
pub struct ConnectionManager {
    sessions: DashMap<SutId, Arc<DeviceSession>>,
    events: Arc<EventBus>,
}

impl ConnectionManager {
    /// Create a manager publishing on the given bus
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            sessions: DashMap::new(),
            events,
        }
    }

    /// Admit a session. Any prior session for the same identity is
    /// forcibly closed first (last-writer-wins on the transport). Fails
    /// only if the new transport is itself already closing.
    pub fn connect(&self, session: DeviceSession) -> Result<Arc<DeviceSession>, FleetError> {
        if session.is_closing() {
            return Err(FleetError::Conflict(format!(
                "duplicate connection for {}: transport already closing",
                session.sut_id
            )));
        }

        let session = Arc::new(session);
        if let Some(prior) = self
            .sessions
            .insert(session.sut_id.clone(), Arc::clone(&session))
        {
            tracing::info!(
                "Superseding session {} for {} with session {}",
                prior.session_id,
                session.sut_id,
                session.session_id
            );
            prior.close();
        }

        self.events.publish(&Event::new(
            EventKind::Connected,
            session.sut_id.clone(),
            serde_json::json!({
                "unique_id": session.sut_id.as_str(),
                "ip": session.ip,
                "session_id": session.session_id,
            }),
        ));

        Ok(session)
    }

    /// Tear down the session for an identity, but only if the live entry
    /// still belongs to the given epoch. A superseded driver's teardown is
    /// a no-op success, so it cannot knock out its replacement. Returns
    /// whether a session was actually removed.
    pub fn disconnect(&self, id: &SutId, session_id: u64) -> bool {
        let removed = self
            .sessions
            .remove_if(id, |_, session| session.session_id == session_id);

        match removed {
            Some((_, session)) => {
                session.close();
                self.events.publish(&Event::new(
                    EventKind::Disconnected,
                    id.clone(),
                    serde_json::json!({
                        "unique_id": id.as_str(),
                        "ip": session.ip,
                        "session_id": session.session_id,
                    }),
                ));
                true
            }
            None => false,
        }
    }

    /// Deliver one message to one device. Addresses the device identity:
    /// whichever session is currently live receives it. False (not an
    /// error) when the device is not connected or its queue is full.
    pub fn send(&self, id: &SutId, message: MasterMessage) -> bool {
        match self.sessions.get(id) {
            Some(session) => session.try_send(message),
            None => false,
        }
    }

    /// Attempt delivery to every live session, reporting the outcome per
    /// device. Individual failures never abort the broadcast.
    pub fn broadcast(&self, message: &MasterMessage) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for entry in self.sessions.iter() {
            let delivered = entry.value().try_send(message.clone());
            results.insert(entry.key().as_str().to_string(), delivered);
        }
        results
    }

    /// Fetch the live session for an identity
    pub fn get(&self, id: &SutId) -> Option<Arc<DeviceSession>> {
        self.sessions.get(id).map(|entry| Arc::clone(&entry))
    }

    /// Number of live sessions
    pub fn online_count(&self) -> usize {
        self.sessions.len()
    }

    /// Identities with a live session
    pub fn list_online_ids(&self) -> Vec<SutId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_session(
        id: &str,
        session_id: u64,
    ) -> (DeviceSession, mpsc::Receiver<MasterMessage>) {
        let (tx, rx) = mpsc::channel(4);
        let session = DeviceSession::new(
            SutId::new(id),
            session_id,
            "10.0.0.5".to_string(),
            tx,
            CancellationToken::new(),
        );
        (session, rx)
    }

    fn manager() -> ConnectionManager {
        ConnectionManager::new(Arc::new(EventBus::new()))
    }

    #[tokio::test]
    async fn test_connect_supersedes_prior_session() {
        let manager = manager();

        let (first, _rx1) = make_session("dev-1", 1);
        let first = manager.connect(first).unwrap();

        let (second, _rx2) = make_session("dev-1", 2);
        let second = manager.connect(second).unwrap();

        // Prior transport was cancelled; exactly one live session remains
        assert!(first.is_closing());
        assert!(!second.is_closing());
        assert_eq!(manager.online_count(), 1);
        assert_ne!(first.session_id, second.session_id);
    }

    #[tokio::test]
    async fn test_connect_rejects_closing_transport() {
        let manager = manager();
        let (session, _rx) = make_session("dev-1", 1);
        session.close();

        let err = manager.connect(session).unwrap_err();
        assert!(matches!(err, FleetError::Conflict(_)));
        assert_eq!(manager.online_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_epoch_guarded() {
        let manager = manager();

        let (first, _rx1) = make_session("dev-1", 1);
        manager.connect(first).unwrap();
        let (second, _rx2) = make_session("dev-1", 2);
        manager.connect(second).unwrap();

        // The superseded driver tears down with its own epoch: no-op
        assert!(!manager.disconnect(&SutId::new("dev-1"), 1));
        assert_eq!(manager.online_count(), 1);

        // The live epoch wins
        assert!(manager.disconnect(&SutId::new("dev-1"), 2));
        assert_eq!(manager.online_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_absent_is_noop() {
        let manager = manager();
        assert!(!manager.disconnect(&SutId::new("ghost"), 1));
    }

    #[tokio::test]
    async fn test_send_to_offline_device_returns_false() {
        let manager = manager();
        assert!(!manager.send(&SutId::new("ghost"), MasterMessage::HeartbeatAck));
    }

    #[tokio::test]
    async fn test_send_delivers_to_live_session() {
        let manager = manager();
        let (session, mut rx) = make_session("dev-1", 1);
        manager.connect(session).unwrap();

        assert!(manager.send(&SutId::new("dev-1"), MasterMessage::HeartbeatAck));
        assert!(matches!(rx.recv().await, Some(MasterMessage::HeartbeatAck)));
    }

    #[tokio::test]
    async fn test_broadcast_isolates_failures() {
        let manager = manager();

        let (alive, mut rx_alive) = make_session("alive", 1);
        manager.connect(alive).unwrap();

        // A session whose queue is gone: drop the receiver
        let (dead, rx_dead) = make_session("dead", 1);
        manager.connect(dead).unwrap();
        drop(rx_dead);

        let message = MasterMessage::UpdateAvailable {
            master_ip: "10.0.0.1".to_string(),
            version: Some("1.2.0".to_string()),
            updated_at: None,
            components: None,
        };
        let results = manager.broadcast(&message);

        assert_eq!(results.len(), 2);
        assert_eq!(results["alive"], true);
        assert_eq!(results["dead"], false);
        assert!(rx_alive.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_events_raised_on_connect_and_disconnect() {
        let events = Arc::new(EventBus::new());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        for kind in [EventKind::Connected, EventKind::Disconnected] {
            let seen = Arc::clone(&seen);
            events.subscribe(kind, move |event| {
                seen.lock().unwrap().push(event.kind);
                Ok(())
            });
        }

        let manager = ConnectionManager::new(Arc::clone(&events));
        let (session, _rx) = make_session("dev-1", 1);
        manager.connect(session).unwrap();
        manager.disconnect(&SutId::new("dev-1"), 1);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventKind::Connected, EventKind::Disconnected]
        );
    }
}

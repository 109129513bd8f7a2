//! Shared service graph for the Master daemon
//!
//! Every service is constructed explicitly here and injected where it is
//! needed; there is no module-level singleton anywhere in the tree, so
//! tests build a fresh state per case.

use std::sync::Arc;

use fleet_core::{FleetError, MasterConfig};

use crate::connection::ConnectionManager;
use crate::events::EventBus;
use crate::notify::NotificationHub;
use crate::registry::DeviceRegistry;
use crate::ssh::{KeyStore, MasterKeyManager, RemoteShell};

/// Shared state for the Master daemon
pub struct MasterState {
    /// Configuration
    pub config: MasterConfig,
    /// Authoritative device inventory
    pub registry: Arc<DeviceRegistry>,
    /// Live transport sessions
    pub connections: Arc<ConnectionManager>,
    /// In-process event bus
    pub events: Arc<EventBus>,
    /// External observer fan-out
    pub notifications: Arc<NotificationHub>,
    /// Trusted device keys (device → Master)
    pub key_store: Arc<KeyStore>,
    /// Master's own identity (Master → device)
    pub master_keys: Arc<MasterKeyManager>,
    /// Outbound shell client for diagnostics
    pub remote: Arc<RemoteShell>,
}

impl MasterState {
    /// Build the full service graph from configuration.
    ///
    /// The notification hub is attached to the event bus here, so
    /// connection transitions flow to observers without further wiring.
    pub fn new(config: MasterConfig) -> Result<Self, FleetError> {
        let events = Arc::new(EventBus::new());
        let connections = Arc::new(ConnectionManager::new(Arc::clone(&events)));
        let registry = Arc::new(DeviceRegistry::open(
            config.paired_devices_path(),
            config.binding_history_cap,
            config.stale_timeout,
        )?);
        let key_store = Arc::new(KeyStore::open(config.key_store_path())?);
        let master_keys = Arc::new(MasterKeyManager::new(config.ssh_dir.clone()));
        let remote = Arc::new(RemoteShell::new(
            Arc::clone(&master_keys),
            config.ssh_username.clone(),
            config.ssh_connect_timeout,
            config.ssh_exec_timeout,
        ));

        let notifications = Arc::new(NotificationHub::new(config.observer_queue_capacity));
        notifications.attach(&events);

        Ok(Self {
            config,
            registry,
            connections,
            events,
            notifications,
            key_store,
            master_keys,
            remote,
        })
    }
}

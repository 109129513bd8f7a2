//! Device registry: inventory, pairing policy, binding reconciliation
//!
//! The primary map (`unique_id` → record) and the secondary IP index live
//! behind a single mutex and are only ever updated together; independently
//! locking them would open a window where the index points at a stale
//! owner. The mutex also totally orders operations on any one device's
//! record, so a reconnect racing a heartbeat cannot interleave partial
//! updates.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleet_core::time::now_millis;
use fleet_core::{FleetError, SutId};

use super::device::{BindingEntry, DeviceRecord, DeviceStats, Registration, SweepReport};

/// Result of an administrative delete
#[derive(Debug, Clone, Serialize)]
pub struct DeletedDevice {
    pub unique_id: String,
    pub was_paired: bool,
}

/// What survives a restart for a paired device
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PairedEntry {
    unique_id: String,
    ip: String,
    port: u16,
    hostname: String,
    display_name: String,
    #[serde(default)]
    capabilities: Vec<String>,
    paired_by: Option<String>,
    paired_at: Option<u64>,
}

struct Inner {
    devices: HashMap<String, DeviceRecord>,
    /// ip → unique_id; at most one non-stale owner per IP
    ip_index: HashMap<String, String>,
    stale_timeout: Duration,
}

/// Authoritative, partially persisted inventory of fleet devices
pub struct DeviceRegistry {
    inner: Mutex<Inner>,
    paired_path: PathBuf,
    history_cap: usize,
}

impl DeviceRegistry {
    /// Open the registry, reloading previously paired devices as offline
    /// records. A missing paired-device file is an empty fleet; a corrupt
    /// one is fatal (refusing to start beats silently forgetting pairings).
    pub fn open(
        paired_path: PathBuf,
        history_cap: usize,
        stale_timeout: Duration,
    ) -> Result<Self, FleetError> {
        let mut devices = HashMap::new();
        let mut ip_index = HashMap::new();

        if paired_path.exists() {
            let content = std::fs::read_to_string(&paired_path)?;
            let entries: Vec<PairedEntry> = serde_json::from_str(&content).map_err(|e| {
                FleetError::Config(fleet_core::ConfigError::Invalid(format!(
                    "corrupt paired-device list {:?}: {}",
                    paired_path, e
                )))
            })?;

            let now = now_millis();
            for entry in entries {
                tracing::info!("Restored paired device {} ({})", entry.unique_id, entry.ip);
                ip_index.insert(entry.ip.clone(), entry.unique_id.clone());
                devices.insert(
                    entry.unique_id.clone(),
                    DeviceRecord {
                        unique_id: SutId::new(&entry.unique_id),
                        ip: entry.ip,
                        port: entry.port,
                        hostname: entry.hostname,
                        cpu_model: None,
                        display_name: entry.display_name,
                        capabilities: entry.capabilities,
                        is_online: false,
                        last_seen: now,
                        is_paired: true,
                        paired_by: entry.paired_by,
                        paired_at: entry.paired_at,
                        session_id: 0,
                        last_ip_change: None,
                        binding_history: Vec::new(),
                        ssh_public_key: None,
                        ssh_fingerprint: None,
                        master_key_installed: false,
                        master_key_installed_at: None,
                    },
                );
            }
        }

        Ok(Self {
            inner: Mutex::new(Inner {
                devices,
                ip_index,
                stale_timeout,
            }),
            paired_path,
            history_cap,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("registry lock poisoned")
    }

    /// Upsert a device from a registration payload.
    ///
    /// Bumps the session epoch, marks the device online, refreshes
    /// `last_seen`, merges present fields over the stored record, and
    /// repairs the IP index when the address moved. Returns the
    /// post-upsert record.
    pub fn register_device(&self, reg: Registration) -> DeviceRecord {
        let mut inner = self.lock();
        let now = now_millis();
        let id = reg.unique_id.as_str().to_string();
        let history_cap = self.history_cap;

        let record = match inner.devices.get_mut(&id) {
            Some(record) => {
                if record.ip != reg.ip {
                    tracing::info!(
                        "Device {} moved from {} to {}",
                        id,
                        record.ip,
                        reg.ip
                    );
                    record.binding_history.push(BindingEntry {
                        ip: reg.ip.clone(),
                        timestamp: now,
                    });
                    if record.binding_history.len() > history_cap {
                        let excess = record.binding_history.len() - history_cap;
                        record.binding_history.drain(..excess);
                    }
                    record.last_ip_change = Some(now);
                }

                record.ip = reg.ip;
                record.port = reg.port;
                if !reg.hostname.is_empty() {
                    record.hostname = reg.hostname;
                }
                if !reg.capabilities.is_empty() {
                    record.capabilities = reg.capabilities;
                }
                if reg.cpu_model.is_some() {
                    record.cpu_model = reg.cpu_model;
                }
                if let Some(name) = reg.display_name {
                    record.display_name = name;
                }
                if reg.ssh_public_key.is_some() {
                    record.ssh_public_key = reg.ssh_public_key;
                }
                if reg.ssh_fingerprint.is_some() {
                    record.ssh_fingerprint = reg.ssh_fingerprint;
                }

                record.is_online = true;
                record.last_seen = now;
                record.session_id += 1;
                record.clone()
            }
            None => {
                let display_name = reg
                    .display_name
                    .clone()
                    .unwrap_or_else(|| reg.hostname.clone());
                let record = DeviceRecord {
                    unique_id: reg.unique_id.clone(),
                    ip: reg.ip,
                    port: reg.port,
                    hostname: reg.hostname,
                    cpu_model: reg.cpu_model,
                    display_name,
                    capabilities: reg.capabilities,
                    is_online: true,
                    last_seen: now,
                    is_paired: false,
                    paired_by: None,
                    paired_at: None,
                    session_id: 1,
                    last_ip_change: None,
                    binding_history: Vec::new(),
                    ssh_public_key: reg.ssh_public_key,
                    ssh_fingerprint: reg.ssh_fingerprint,
                    master_key_installed: false,
                    master_key_installed_at: None,
                };
                inner.devices.insert(id.clone(), record.clone());
                record
            }
        };

        // Index repair is part of the same critical section as the record
        // update: drop the reverse mapping for any IP that used to point at
        // this device, then claim the current one.
        let current_ip = record.ip.clone();
        inner
            .ip_index
            .retain(|ip, owner| *owner != id || *ip == current_ip);
        inner.ip_index.insert(current_ip, id);

        record
    }

    /// Refresh `last_seen` from a heartbeat. No other state changes.
    pub fn mark_seen(&self, id: &SutId) -> bool {
        let mut inner = self.lock();
        match inner.devices.get_mut(id.as_str()) {
            Some(record) => {
                record.last_seen = now_millis();
                true
            }
            None => false,
        }
    }

    /// Mark a device offline. Never deletes and never touches pairing.
    pub fn mark_device_offline(&self, id: &SutId) -> bool {
        let mut inner = self.lock();
        match inner.devices.get_mut(id.as_str()) {
            Some(record) => {
                record.is_online = false;
                record.last_seen = now_millis();
                true
            }
            None => false,
        }
    }

    /// Promote a device to paired. Idempotent; persists the paired set.
    pub fn pair_device(&self, id: &SutId, paired_by: &str) -> bool {
        let mut inner = self.lock();
        let Some(record) = inner.devices.get_mut(id.as_str()) else {
            return false;
        };

        record.is_paired = true;
        record.paired_by = Some(paired_by.to_string());
        record.paired_at = Some(now_millis());

        self.persist_paired(&inner);
        true
    }

    /// Demote a device from paired. Persists the updated set.
    pub fn unpair_device(&self, id: &SutId) -> bool {
        let mut inner = self.lock();
        let Some(record) = inner.devices.get_mut(id.as_str()) else {
            return false;
        };

        record.is_paired = false;
        record.paired_by = None;
        record.paired_at = None;

        self.persist_paired(&inner);
        true
    }

    /// Override the user-facing name.
    pub fn set_display_name(&self, id: &SutId, name: &str) -> bool {
        let mut inner = self.lock();
        match inner.devices.get_mut(id.as_str()) {
            Some(record) => {
                record.display_name = name.to_string();
                true
            }
            None => false,
        }
    }

    /// The only writer of `master_key_installed`.
    ///
    /// `installed = true` records the acknowledgment timestamp; `false`
    /// resets the flag for a forced re-exchange.
    pub fn update_master_key_status(&self, id: &SutId, installed: bool) -> bool {
        let mut inner = self.lock();
        match inner.devices.get_mut(id.as_str()) {
            Some(record) => {
                record.master_key_installed = installed;
                record.master_key_installed_at = installed.then(now_millis);
                true
            }
            None => false,
        }
    }

    /// Snapshot of every record.
    pub fn get_all_devices(&self) -> Vec<DeviceRecord> {
        self.lock().devices.values().cloned().collect()
    }

    /// Look up one device by identity.
    pub fn get_device_by_id(&self, id: &SutId) -> Option<DeviceRecord> {
        self.lock().devices.get(id.as_str()).cloned()
    }

    /// Look up one device through the IP index.
    pub fn get_device_by_ip(&self, ip: &str) -> Option<DeviceRecord> {
        let inner = self.lock();
        let id = inner.ip_index.get(ip)?;
        inner.devices.get(id).cloned()
    }

    /// Aggregate counters, computed over the live map so they can never
    /// drift from the records.
    pub fn get_device_stats(&self) -> DeviceStats {
        let inner = self.lock();
        let total = inner.devices.len();
        let online = inner.devices.values().filter(|d| d.is_online).count();
        let paired = inner.devices.values().filter(|d| d.is_paired).count();
        DeviceStats {
            total,
            online,
            offline: total - online,
            paired,
        }
    }

    /// Current stale timeout (0 = automatic cleanup disabled).
    pub fn stale_timeout(&self) -> Duration {
        self.lock().stale_timeout
    }

    /// Update the stale timeout.
    pub fn set_stale_timeout(&self, timeout: Duration) {
        self.lock().stale_timeout = timeout;
    }

    /// Remove devices that are unpaired, offline, and unseen for longer
    /// than the timeout. Paired devices are never candidates regardless of
    /// staleness.
    pub fn remove_stale_devices(&self, timeout_override: Option<Duration>) -> SweepReport {
        let mut inner = self.lock();
        let timeout = timeout_override.unwrap_or(inner.stale_timeout);

        if timeout.is_zero() {
            return SweepReport {
                removed_count: 0,
                removed_devices: Vec::new(),
                timeout_used: 0,
            };
        }

        let now = now_millis();
        let cutoff_millis = timeout.as_millis() as u64;
        let stale: Vec<String> = inner
            .devices
            .values()
            .filter(|d| {
                !d.is_paired && !d.is_online && now.saturating_sub(d.last_seen) > cutoff_millis
            })
            .map(|d| d.unique_id.as_str().to_string())
            .collect();

        for id in &stale {
            if let Some(record) = inner.devices.remove(id) {
                if inner.ip_index.get(&record.ip) == Some(id) {
                    inner.ip_index.remove(&record.ip);
                }
                tracing::info!(
                    "Removed stale device {} (last seen {}s ago)",
                    id,
                    now.saturating_sub(record.last_seen) / 1000
                );
            }
        }

        SweepReport {
            removed_count: stale.len(),
            removed_devices: stale,
            timeout_used: timeout.as_secs(),
        }
    }

    /// Delete one device. Paired devices are refused unless `force`.
    pub fn delete_device(&self, id: &SutId, force: bool) -> Result<DeletedDevice, FleetError> {
        let mut inner = self.lock();
        let Some(record) = inner.devices.get(id.as_str()) else {
            return Err(FleetError::NotFound(format!("SUT {} not found", id)));
        };

        let was_paired = record.is_paired;
        if was_paired && !force {
            return Err(FleetError::Conflict(format!(
                "SUT {} is paired; use force to delete paired devices",
                id
            )));
        }

        let record = inner.devices.remove(id.as_str()).expect("checked above");
        if inner.ip_index.get(&record.ip).map(String::as_str) == Some(id.as_str()) {
            inner.ip_index.remove(&record.ip);
        }

        if was_paired {
            self.persist_paired(&inner);
        }

        Ok(DeletedDevice {
            unique_id: id.as_str().to_string(),
            was_paired,
        })
    }

    /// Rewrite the durable paired-device list wholesale.
    ///
    /// Called with the registry lock held, which serializes concurrent
    /// writers. A write failure is logged, not propagated: the in-memory
    /// state is already correct and the next pairing change retries.
    fn persist_paired(&self, inner: &Inner) {
        let entries: Vec<PairedEntry> = inner
            .devices
            .values()
            .filter(|d| d.is_paired)
            .map(|d| PairedEntry {
                unique_id: d.unique_id.as_str().to_string(),
                ip: d.ip.clone(),
                port: d.port,
                hostname: d.hostname.clone(),
                display_name: d.display_name.clone(),
                capabilities: d.capabilities.clone(),
                paired_by: d.paired_by.clone(),
                paired_at: d.paired_at,
            })
            .collect();

        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = self.paired_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let content = serde_json::to_string_pretty(&entries)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            std::fs::write(&self.paired_path, content)
        })();

        if let Err(e) = result {
            tracing::error!(
                "Failed to persist paired devices to {:?}: {}",
                self.paired_path,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(id: &str, ip: &str) -> Registration {
        Registration {
            unique_id: SutId::new(id),
            ip: ip.to_string(),
            port: 8080,
            hostname: format!("{}-host", id),
            capabilities: vec!["trace".to_string()],
            cpu_model: None,
            display_name: None,
            ssh_public_key: None,
            ssh_fingerprint: None,
        }
    }

    fn test_registry(dir: &tempfile::TempDir) -> DeviceRegistry {
        DeviceRegistry::open(
            dir.path().join("paired_devices.json"),
            5,
            Duration::from_secs(3600),
        )
        .unwrap()
    }

    #[test]
    fn test_register_creates_record() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);

        let record = registry.register_device(registration("dev-1", "10.0.0.5"));
        assert!(record.is_online);
        assert_eq!(record.session_id, 1);
        assert_eq!(record.display_name, "dev-1-host");
        assert!(record.binding_history.is_empty());

        let stats = registry.get_device_stats();
        assert_eq!(
            (stats.total, stats.online, stats.offline, stats.paired),
            (1, 1, 0, 0)
        );
    }

    #[test]
    fn test_session_id_increases_per_admission() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);

        let first = registry.register_device(registration("dev-1", "10.0.0.5"));
        let second = registry.register_device(registration("dev-1", "10.0.0.5"));
        assert!(second.session_id > first.session_id);
    }

    #[test]
    fn test_ip_churn_keeps_single_index_entry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);

        registry.register_device(registration("dev-1", "10.0.0.5"));
        registry.register_device(registration("dev-1", "10.0.0.6"));
        registry.register_device(registration("dev-1", "10.0.0.7"));

        // Old addresses no longer resolve, the latest does
        assert!(registry.get_device_by_ip("10.0.0.5").is_none());
        assert!(registry.get_device_by_ip("10.0.0.6").is_none());
        let found = registry.get_device_by_ip("10.0.0.7").unwrap();
        assert_eq!(found.unique_id.as_str(), "dev-1");

        // Two transitions, two history entries
        assert_eq!(found.binding_history.len(), 2);
        assert!(found.last_ip_change.is_some());
    }

    #[test]
    fn test_binding_history_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);

        for i in 0..10 {
            registry.register_device(registration("dev-1", &format!("10.0.0.{}", i)));
        }

        let record = registry
            .get_device_by_id(&SutId::new("dev-1"))
            .unwrap();
        assert_eq!(record.binding_history.len(), 5);
        // Oldest entries were evicted; the newest transition survives
        assert_eq!(record.binding_history.last().unwrap().ip, "10.0.0.9");
    }

    #[test]
    fn test_ip_reassignment_to_other_device_repoints_index() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);

        registry.register_device(registration("dev-1", "10.0.0.5"));
        registry.register_device(registration("dev-2", "10.0.0.5"));

        // No silent merge: both records exist, the index has one owner
        assert_eq!(registry.get_device_stats().total, 2);
        let owner = registry.get_device_by_ip("10.0.0.5").unwrap();
        assert_eq!(owner.unique_id.as_str(), "dev-2");
    }

    #[test]
    fn test_pair_unpair_pair_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        let id = SutId::new("dev-1");

        registry.register_device(registration("dev-1", "10.0.0.5"));

        assert!(registry.pair_device(&id, "alice"));
        assert!(registry.pair_device(&id, "bob"));
        assert!(registry.unpair_device(&id));
        assert!(registry.pair_device(&id, "operator"));

        let record = registry.get_device_by_id(&id).unwrap();
        assert!(record.is_paired);
        assert_eq!(record.paired_by.as_deref(), Some("operator"));
    }

    #[test]
    fn test_pair_unknown_device_fails() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        assert!(!registry.pair_device(&SutId::new("ghost"), "user"));
    }

    #[test]
    fn test_paired_devices_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paired_devices.json");

        {
            let registry =
                DeviceRegistry::open(path.clone(), 5, Duration::from_secs(3600)).unwrap();
            registry.register_device(registration("dev-1", "10.0.0.5"));
            registry.register_device(registration("dev-2", "10.0.0.6"));
            registry.pair_device(&SutId::new("dev-1"), "operator");
        }

        let registry = DeviceRegistry::open(path, 5, Duration::from_secs(3600)).unwrap();
        let record = registry.get_device_by_id(&SutId::new("dev-1")).unwrap();
        assert!(record.is_paired);
        assert!(!record.is_online);
        assert_eq!(record.paired_by.as_deref(), Some("operator"));
        // Unpaired devices are not persisted
        assert!(registry.get_device_by_id(&SutId::new("dev-2")).is_none());
    }

    #[test]
    fn test_stale_sweep_spares_paired_devices() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);

        registry.register_device(registration("stale", "10.0.0.5"));
        registry.register_device(registration("kept", "10.0.0.6"));
        registry.pair_device(&SutId::new("kept"), "operator");
        registry.mark_device_offline(&SutId::new("stale"));
        registry.mark_device_offline(&SutId::new("kept"));

        // Zero-duration elapsed: nothing is past a 1h timeout yet
        let report = registry.remove_stale_devices(None);
        assert_eq!(report.removed_count, 0);

        // Shrink the window to something both devices exceed
        std::thread::sleep(Duration::from_millis(5));
        let report = registry.remove_stale_devices(Some(Duration::from_millis(1)));
        assert_eq!(report.removed_devices, vec!["stale".to_string()]);
        assert!(registry.get_device_by_id(&SutId::new("kept")).is_some());
        assert!(registry.get_device_by_ip("10.0.0.5").is_none());
    }

    #[test]
    fn test_stale_sweep_disabled_with_zero_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        registry.set_stale_timeout(Duration::ZERO);

        registry.register_device(registration("dev-1", "10.0.0.5"));
        registry.mark_device_offline(&SutId::new("dev-1"));

        let report = registry.remove_stale_devices(None);
        assert_eq!(report.removed_count, 0);
        assert_eq!(report.timeout_used, 0);
        assert!(registry.get_device_by_id(&SutId::new("dev-1")).is_some());
    }

    #[test]
    fn test_online_devices_are_not_stale() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);

        registry.register_device(registration("dev-1", "10.0.0.5"));
        std::thread::sleep(Duration::from_millis(5));

        let report = registry.remove_stale_devices(Some(Duration::from_millis(1)));
        assert_eq!(report.removed_count, 0);
    }

    #[test]
    fn test_delete_paired_requires_force() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        let id = SutId::new("dev-1");

        registry.register_device(registration("dev-1", "10.0.0.5"));
        registry.pair_device(&id, "operator");

        let err = registry.delete_device(&id, false).unwrap_err();
        assert!(matches!(err, FleetError::Conflict(_)));
        assert!(registry.get_device_by_id(&id).is_some());

        let deleted = registry.delete_device(&id, true).unwrap();
        assert!(deleted.was_paired);
        assert!(registry.get_device_by_id(&id).is_none());
        assert!(registry.get_device_by_ip("10.0.0.5").is_none());
    }

    #[test]
    fn test_delete_unknown_device() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        let err = registry
            .delete_device(&SutId::new("ghost"), false)
            .unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));
    }

    #[test]
    fn test_mark_offline_preserves_pairing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        let id = SutId::new("dev-1");

        registry.register_device(registration("dev-1", "10.0.0.5"));
        registry.pair_device(&id, "operator");
        registry.mark_device_offline(&id);

        let record = registry.get_device_by_id(&id).unwrap();
        assert!(!record.is_online);
        assert!(record.is_paired);

        let stats = registry.get_device_stats();
        assert_eq!((stats.online, stats.offline, stats.paired), (0, 1, 1));
    }

    #[test]
    fn test_master_key_status_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        let id = SutId::new("dev-1");

        registry.register_device(registration("dev-1", "10.0.0.5"));
        let record = registry.get_device_by_id(&id).unwrap();
        assert!(!record.master_key_installed);

        registry.update_master_key_status(&id, true);
        let record = registry.get_device_by_id(&id).unwrap();
        assert!(record.master_key_installed);
        assert!(record.master_key_installed_at.is_some());

        registry.update_master_key_status(&id, false);
        let record = registry.get_device_by_id(&id).unwrap();
        assert!(!record.master_key_installed);
        assert!(record.master_key_installed_at.is_none());
    }

    #[test]
    fn test_display_name_override_survives_reregistration() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        let id = SutId::new("dev-1");

        registry.register_device(registration("dev-1", "10.0.0.5"));
        registry.set_display_name(&id, "rack 3 slot 1");
        registry.register_device(registration("dev-1", "10.0.0.5"));

        let record = registry.get_device_by_id(&id).unwrap();
        assert_eq!(record.display_name, "rack 3 slot 1");
    }

    #[test]
    fn test_heartbeat_refreshes_last_seen_only() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        let id = SutId::new("dev-1");

        let record = registry.register_device(registration("dev-1", "10.0.0.5"));
        let session_before = record.session_id;

        std::thread::sleep(Duration::from_millis(5));
        assert!(registry.mark_seen(&id));

        let after = registry.get_device_by_id(&id).unwrap();
        assert!(after.last_seen >= record.last_seen);
        assert_eq!(after.session_id, session_before);
    }
}

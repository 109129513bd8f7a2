//! Administrative operations surface
//!
//! The thin routing layer in front of the Master consumes exactly these
//! operations; they return serializable receipts describing what changed
//! rather than bare booleans, so callers can render results without a
//! second lookup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleet_core::{DeviceFilter, FleetError, SutId};
use fleet_protocol::MasterMessage;

use crate::notify::Observer;
use crate::registry::{BindingEntry, DeviceRecord, SweepReport};
use crate::ssh::MasterKeyInfo;
use crate::state::MasterState;

/// Device listing with aggregate counters
#[derive(Debug, Clone, Serialize)]
pub struct DeviceListing {
    pub suts: Vec<DeviceRecord>,
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub paired: usize,
}

/// Receipt for a mutating device operation
#[derive(Debug, Clone, Serialize)]
pub struct MutationReceipt {
    pub message: String,
    pub device: DeviceRecord,
}

/// Receipt for a device deletion
#[derive(Debug, Clone, Serialize)]
pub struct DeleteReceipt {
    pub message: String,
    pub was_paired: bool,
}

/// Receipt for a stale-timeout change
#[derive(Debug, Clone, Serialize)]
pub struct TimeoutReceipt {
    pub old_timeout_seconds: u64,
    pub new_timeout_seconds: u64,
}

/// Fleet-wide update announcement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateNotice {
    pub master_ip: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub components: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Per-device outcome of a broadcast
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastReport {
    pub notified: usize,
    pub total_connected: usize,
    pub results: HashMap<String, bool>,
}

/// Receipt for a key-exchange trigger
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeReceipt {
    pub message: String,
    pub master_fingerprint: Option<String>,
    pub already_installed: bool,
    pub force: bool,
}

/// Device → Master half of the trust state
#[derive(Debug, Clone, Serialize)]
pub struct SutToMaster {
    pub ssh_fingerprint: Option<String>,
    pub registered_on_master: bool,
}

/// Master → device half of the trust state
#[derive(Debug, Clone, Serialize)]
pub struct MasterToSut {
    pub master_key_installed: bool,
    pub installed_at: Option<u64>,
}

/// Session/IP binding summary
#[derive(Debug, Clone, Serialize)]
pub struct BindingStatus {
    pub session_id: u64,
    pub last_ip_change: Option<u64>,
    pub ip_change_count: usize,
    /// Most recent transitions (up to 5)
    pub recent_history: Vec<BindingEntry>,
}

/// Full bidirectional SSH status for one device
#[derive(Debug, Clone, Serialize)]
pub struct SshStatusReport {
    pub unique_id: String,
    pub ip: String,
    pub hostname: String,
    pub is_online: bool,
    pub sut_to_master: SutToMaster,
    pub master_to_sut: MasterToSut,
    pub master_key: MasterKeyInfo,
    pub binding: BindingStatus,
}

/// Subset of a record shown in connectivity diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct DeviceProbeInfo {
    pub unique_id: String,
    pub hostname: String,
    pub is_online: bool,
    pub master_key_installed: bool,
}

/// Outcome of an SSH connectivity probe
#[derive(Debug, Clone, Serialize)]
pub struct SshProbe {
    pub tested: bool,
    pub connected: bool,
    pub message: Option<String>,
    pub error: Option<String>,
    pub master_fingerprint: Option<String>,
}

/// Connectivity diagnosis for an IP
#[derive(Debug, Clone, Serialize)]
pub struct DiagnoseReport {
    pub ip: String,
    pub device_found: bool,
    pub device: Option<DeviceProbeInfo>,
    pub ssh: SshProbe,
}

/// Administrative API over the shared state
pub struct AdminApi {
    state: Arc<MasterState>,
}

impl AdminApi {
    /// Create the facade
    pub fn new(state: Arc<MasterState>) -> Self {
        Self { state }
    }

    /// List devices, optionally filtered, with aggregate counters.
    pub fn list_devices(&self, filter: Option<DeviceFilter>) -> DeviceListing {
        let mut devices = self.state.registry.get_all_devices();
        match filter {
            Some(DeviceFilter::Online) => devices.retain(|d| d.is_online),
            Some(DeviceFilter::Offline) => devices.retain(|d| !d.is_online),
            Some(DeviceFilter::Paired) => devices.retain(|d| d.is_paired),
            None => {}
        }
        devices.sort_by(|a, b| a.unique_id.as_str().cmp(b.unique_id.as_str()));

        let stats = self.state.registry.get_device_stats();
        DeviceListing {
            suts: devices,
            total: stats.total,
            online: stats.online,
            offline: stats.offline,
            paired: stats.paired,
        }
    }

    /// Fetch one device.
    pub fn get_device(&self, id: &SutId) -> Result<DeviceRecord, FleetError> {
        self.state
            .registry
            .get_device_by_id(id)
            .ok_or_else(|| FleetError::NotFound(format!("SUT {} not found", id)))
    }

    /// Pair a device, exempting it from the stale sweep.
    pub fn pair_device(&self, id: &SutId, paired_by: &str) -> Result<MutationReceipt, FleetError> {
        if !self.state.registry.pair_device(id, paired_by) {
            return Err(FleetError::NotFound(format!("SUT {} not found", id)));
        }
        let device = self.get_device(id)?;
        Ok(MutationReceipt {
            message: format!("SUT {} paired successfully", id),
            device,
        })
    }

    /// Unpair a device.
    pub fn unpair_device(&self, id: &SutId) -> Result<MutationReceipt, FleetError> {
        if !self.state.registry.unpair_device(id) {
            return Err(FleetError::NotFound(format!("SUT {} not found", id)));
        }
        let device = self.get_device(id)?;
        Ok(MutationReceipt {
            message: format!("SUT {} unpaired successfully", id),
            device,
        })
    }

    /// Override a device's display name.
    pub fn set_display_name(&self, id: &SutId, name: &str) -> Result<MutationReceipt, FleetError> {
        if !self.state.registry.set_display_name(id, name) {
            return Err(FleetError::NotFound(format!("SUT {} not found", id)));
        }
        let device = self.get_device(id)?;
        Ok(MutationReceipt {
            message: format!("Display name for {} set to {}", id, name),
            device,
        })
    }

    /// Delete a device; paired devices require `force`.
    pub fn delete_device(&self, id: &SutId, force: bool) -> Result<DeleteReceipt, FleetError> {
        let deleted = self.state.registry.delete_device(id, force)?;
        Ok(DeleteReceipt {
            message: format!("SUT {} deleted successfully", id),
            was_paired: deleted.was_paired,
        })
    }

    /// Current stale timeout in seconds (0 = disabled).
    pub fn stale_timeout(&self) -> u64 {
        self.state.registry.stale_timeout().as_secs()
    }

    /// Update the stale timeout.
    pub fn set_stale_timeout(&self, timeout_seconds: u64) -> TimeoutReceipt {
        let old = self.stale_timeout();
        self.state
            .registry
            .set_stale_timeout(Duration::from_secs(timeout_seconds));
        TimeoutReceipt {
            old_timeout_seconds: old,
            new_timeout_seconds: timeout_seconds,
        }
    }

    /// Trigger an immediate stale sweep, optionally overriding the timeout.
    pub fn cleanup_stale(&self, timeout_override_seconds: Option<u64>) -> SweepReport {
        self.state
            .registry
            .remove_stale_devices(timeout_override_seconds.map(Duration::from_secs))
    }

    /// Announce update availability to every connected device.
    pub fn broadcast_update(&self, notice: UpdateNotice) -> BroadcastReport {
        let message = MasterMessage::UpdateAvailable {
            master_ip: notice.master_ip,
            version: notice.version,
            updated_at: notice.updated_at,
            components: notice.components,
        };

        let results = self.state.connections.broadcast(&message);
        let notified = results.values().filter(|ok| **ok).count();

        tracing::info!(
            "Broadcast update notification to {}/{} SUTs",
            notified,
            results.len()
        );

        BroadcastReport {
            notified,
            total_connected: results.len(),
            results,
        }
    }

    /// Push the Master's key to one device for installation.
    ///
    /// Only permitted while the device is online; `master_key_installed`
    /// stays untouched until the device acknowledges.
    pub fn trigger_key_exchange(
        &self,
        id: &SutId,
        force: bool,
    ) -> Result<ExchangeReceipt, FleetError> {
        let device = self.get_device(id)?;

        if !device.is_online {
            return Err(FleetError::Conflict(format!("SUT {} is offline", id)));
        }

        if device.master_key_installed && !force {
            return Ok(ExchangeReceipt {
                message: "Master key already installed".to_string(),
                master_fingerprint: self.state.master_keys.get_fingerprint().ok(),
                already_installed: true,
                force,
            });
        }

        let master_public_key = self.state.master_keys.get_public_key()?;
        let master_fingerprint = self.state.master_keys.get_fingerprint().ok();

        let sent = self.state.connections.send(
            id,
            MasterMessage::InstallMasterKey {
                master_public_key,
                master_fingerprint: master_fingerprint.clone(),
                force,
            },
        );

        if !sent {
            return Err(FleetError::TransientIo(format!(
                "could not deliver key exchange request to {}",
                id
            )));
        }

        Ok(ExchangeReceipt {
            message: "Key exchange request sent".to_string(),
            master_fingerprint,
            already_installed: false,
            force,
        })
    }

    /// Bidirectional SSH status for one device.
    pub fn ssh_status(&self, id: &SutId) -> Result<SshStatusReport, FleetError> {
        let device = self.get_device(id)?;

        let registered_on_master = device
            .ssh_fingerprint
            .as_deref()
            .map(|fp| self.state.key_store.is_key_registered(fp))
            .unwrap_or(false);

        let history_len = device.binding_history.len();
        let recent_history = device.binding_history[history_len.saturating_sub(5)..].to_vec();

        Ok(SshStatusReport {
            unique_id: device.unique_id.as_str().to_string(),
            ip: device.ip,
            hostname: device.hostname,
            is_online: device.is_online,
            sut_to_master: SutToMaster {
                ssh_fingerprint: device.ssh_fingerprint,
                registered_on_master,
            },
            master_to_sut: MasterToSut {
                master_key_installed: device.master_key_installed,
                installed_at: device.master_key_installed_at,
            },
            master_key: self.state.master_keys.key_info(),
            binding: BindingStatus {
                session_id: device.session_id,
                last_ip_change: device.last_ip_change,
                ip_change_count: history_len,
                recent_history,
            },
        })
    }

    /// Probe SSH connectivity to an IP, correlating with the registry.
    pub async fn diagnose_ssh(&self, ip: &str) -> DiagnoseReport {
        let device = self.state.registry.get_device_by_ip(ip);
        let device_info = device.as_ref().map(|d| DeviceProbeInfo {
            unique_id: d.unique_id.as_str().to_string(),
            hostname: d.hostname.clone(),
            is_online: d.is_online,
            master_key_installed: d.master_key_installed,
        });

        let ssh = match self.state.remote.test_connection(ip, None, None).await {
            Ok(message) => SshProbe {
                tested: true,
                connected: true,
                message: Some(message),
                error: None,
                master_fingerprint: self.state.master_keys.get_fingerprint().ok(),
            },
            Err(FleetError::KeyMaterialUnavailable(e)) => SshProbe {
                tested: false,
                connected: false,
                message: None,
                error: Some(format!("Master key not available: {}", e)),
                master_fingerprint: None,
            },
            Err(e) => SshProbe {
                tested: true,
                connected: false,
                message: None,
                error: Some(e.to_string()),
                master_fingerprint: self.state.master_keys.get_fingerprint().ok(),
            },
        };

        DiagnoseReport {
            ip: ip.to_string(),
            device_found: device.is_some(),
            device: device_info,
            ssh,
        }
    }

    /// Summary of the Master's own key material.
    pub fn master_key_info(&self) -> MasterKeyInfo {
        self.state.master_keys.key_info()
    }

    /// Subscribe to the streaming notification feed.
    pub fn subscribe_notifications(&self) -> Observer {
        self.state.notifications.subscribe()
    }
}

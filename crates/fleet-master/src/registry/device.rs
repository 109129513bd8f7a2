//! Device record schema
//!
//! The registry keys everything off `unique_id`, which the device assigns
//! once and never changes. Everything network-related (IP, port, hostname)
//! is merely the latest observation and may churn across reconnects.

use serde::{Deserialize, Serialize};

use fleet_core::SutId;

/// One IP reassignment, kept for diagnostics (not authoritative state)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingEntry {
    /// The IP the device moved to
    pub ip: String,
    /// When the transition was observed (Unix millis)
    pub timestamp: u64,
}

/// Inventory entry for one physical SUT
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    /// Immutable device-assigned identity
    pub unique_id: SutId,
    /// Last reported address
    pub ip: String,
    /// Last reported agent port
    pub port: u16,
    /// Last reported hostname
    pub hostname: String,
    /// CPU model string, when the device reports one
    pub cpu_model: Option<String>,
    /// User-facing name; defaults to the hostname until overridden
    pub display_name: String,
    /// Capability tags
    pub capabilities: Vec<String>,

    /// Derived: true iff the connection manager holds a live session
    pub is_online: bool,
    /// Updated by every registration and heartbeat (Unix millis)
    pub last_seen: u64,

    /// Durable operator promotion; exempts the device from the stale sweep
    pub is_paired: bool,
    pub paired_by: Option<String>,
    pub paired_at: Option<u64>,

    /// Session epoch; bumped on every new transport admission
    pub session_id: u64,
    /// When the IP last changed (Unix millis)
    pub last_ip_change: Option<u64>,
    /// Most recent IP transitions, oldest first, capped
    pub binding_history: Vec<BindingEntry>,

    /// The device's own SSH public key as registered with the Master
    pub ssh_public_key: Option<String>,
    pub ssh_fingerprint: Option<String>,
    /// True only after the device acknowledged installing the Master's key
    pub master_key_installed: bool,
    pub master_key_installed_at: Option<u64>,
}

/// Input to a registry upsert, assembled from a registration payload
#[derive(Debug, Clone)]
pub struct Registration {
    pub unique_id: SutId,
    pub ip: String,
    pub port: u16,
    pub hostname: String,
    pub capabilities: Vec<String>,
    pub cpu_model: Option<String>,
    pub display_name: Option<String>,
    pub ssh_public_key: Option<String>,
    pub ssh_fingerprint: Option<String>,
}

/// Aggregate counters computed over the live map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub paired: usize,
}

/// Outcome of a stale-device sweep
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub removed_count: usize,
    pub removed_devices: Vec<String>,
    /// The timeout the sweep evaluated against, in seconds (0 = disabled)
    pub timeout_used: u64,
}

//! Message types for the fleet-master control plane
//!
//! Devices and the Master exchange single-line JSON objects over a
//! persistent TCP connection. The very first line a device sends is the
//! registration payload (an untyped object); every message after that
//! carries a `type` tag in both directions.
//!
//! # Message Flow
//!
//! 1. Device connects and sends its registration payload
//! 2. Master responds with `register_ack` (including the Master's public
//!    key for bidirectional shell trust, and the fresh session id)
//! 3. Device sends `heartbeat` periodically, Master responds with
//!    `heartbeat_ack`
//! 4. Master may send `install_master_key` at any time; the device reports
//!    the outcome with `master_key_installed`, which the Master acks
//! 5. `update_available` is broadcast to every connected device when the
//!    fleet should pull updates

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Default control-plane port a device reports when it omits one.
pub const DEFAULT_DEVICE_PORT: u16 = 8080;

fn default_device_port() -> u16 {
    DEFAULT_DEVICE_PORT
}

/// The first message on a new device connection.
///
/// Unlike every later message this object carries no `type` tag; the
/// position in the stream identifies it. `ip` and `unique_id` are
/// mandatory — a payload without them is a protocol violation and the
/// transport is refused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    /// Address the device believes it is reachable at
    pub ip: String,
    /// Port of the device-side agent
    #[serde(default = "default_device_port")]
    pub port: u16,
    /// Immutable device-assigned identity
    pub unique_id: String,
    /// Capability tags (test features this device supports)
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Hostname as reported by the device
    #[serde(default)]
    pub hostname: String,
    /// CPU model string, if the device knows it
    #[serde(default)]
    pub cpu_model: Option<String>,
    /// Preferred display name (falls back to hostname)
    #[serde(default)]
    pub display_name: Option<String>,
    /// The device's own SSH public key, offered for registration
    #[serde(default)]
    pub ssh_public_key: Option<String>,
    /// Fingerprint the device computed for its key
    #[serde(default)]
    pub ssh_key_fingerprint: Option<String>,
}

impl RegisterPayload {
    /// Parse and validate a registration line.
    ///
    /// Serde already rejects payloads missing `ip` or `unique_id`; this
    /// additionally refuses empty strings so a device cannot register
    /// under a blank identity.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let payload: Self = serde_json::from_str(line)?;
        if payload.unique_id.trim().is_empty() {
            return Err(ProtocolError::MissingField("unique_id"));
        }
        if payload.ip.trim().is_empty() {
            return Err(ProtocolError::MissingField("ip"));
        }
        Ok(payload)
    }
}

/// Messages a device sends after registration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    /// Liveness refresh; any payload beyond the type tag is ignored
    Heartbeat,

    /// Outcome of installing the Master's public key on the device
    MasterKeyInstalled {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl DeviceMessage {
    /// Parse a steady-state device line.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(line)?)
    }
}

/// Messages the Master sends to a device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterMessage {
    /// Registration acknowledgment, closing the handshake
    RegisterAck {
        message: String,
        sut_id: String,
        /// Whether the offered device key was accepted into the trust store
        ssh_registered: bool,
        /// Master's public key for the device to install (None when key
        /// material is unavailable; exchange is retried later on request)
        master_public_key: Option<String>,
        master_fingerprint: Option<String>,
        /// True iff the Master's key is not yet confirmed installed
        re_exchange: bool,
        /// Fresh session epoch for this transport
        session_id: u64,
    },

    /// Reply to a device heartbeat
    HeartbeatAck,

    /// Instruct the device to add the Master's key to its authorized set
    InstallMasterKey {
        master_public_key: String,
        master_fingerprint: Option<String>,
        force: bool,
    },

    /// Acknowledge a `master_key_installed` report
    MasterKeyInstalledAck {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Fleet-wide notice that updates can be pulled from the Master
    UpdateAvailable {
        master_ip: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_at: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        components: Option<serde_json::Map<String, serde_json::Value>>,
    },
}

/// Serialize any wire value to a single JSON line (no trailing newline).
pub fn encode_line<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(value)?)
}

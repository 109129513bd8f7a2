//! Core error types for fleet-master

use fleet_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the fleet-master ecosystem
#[derive(Error, Debug)]
pub enum FleetError {
    /// Malformed or incomplete registration; the transport is refused and
    /// no state is mutated
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Operation referenced an unknown device, IP, or fingerprint
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation refused in the current state (e.g. deleting a paired
    /// device without force, key exchange while offline)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Outbound shell test/exec failure or timeout; always retryable
    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    /// Key generation or read failure; trust responses degrade to
    /// "unavailable" instead of failing registration
    #[error("Key material unavailable: {0}")]
    KeyMaterialUnavailable(String),

    /// Wire protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a managed device (System Under Test)
///
/// Assigned by the device itself on first contact and never reassigned;
/// the registry keys everything off this value so a device keeps its
/// identity across reconnects and IP changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SutId(pub String);

impl SutId {
    /// Create a new SUT ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SutId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SutId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Liveness/pairing filter for device listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceFilter {
    /// Devices with a live connection
    Online,
    /// Devices without a live connection
    Offline,
    /// Devices promoted by an operator
    Paired,
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFilter::Online => write!(f, "online"),
            DeviceFilter::Offline => write!(f, "offline"),
            DeviceFilter::Paired => write!(f, "paired"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sut_id_display() {
        let id = SutId::new("dev-1");
        assert_eq!(format!("{}", id), "dev-1");
        assert_eq!(id.as_str(), "dev-1");
    }

    #[test]
    fn test_sut_id_serializes_transparent() {
        let id = SutId::new("dev-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"dev-1\"");
    }

    #[test]
    fn test_device_filter_display() {
        assert_eq!(format!("{}", DeviceFilter::Online), "online");
        assert_eq!(format!("{}", DeviceFilter::Paired), "paired");
    }
}

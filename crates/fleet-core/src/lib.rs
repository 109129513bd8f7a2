//! fleet-core: shared foundations for the fleet-master ecosystem
//!
//! Error taxonomy, device identity types, time helpers, and daemon
//! configuration used by the Master and its protocol crate.

pub mod config;
pub mod error;
pub mod time;
pub mod types;

pub use config::MasterConfig;
pub use error::{ConfigError, FleetError};
pub use types::{DeviceFilter, SutId};

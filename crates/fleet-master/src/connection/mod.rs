//! Live transport session management

mod manager;

pub use manager::{ConnectionManager, DeviceSession};

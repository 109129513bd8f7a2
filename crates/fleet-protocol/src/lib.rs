//! fleet-protocol: wire protocol for the fleet-master control plane
//!
//! Defines the JSON line messages devices and the Master exchange over a
//! persistent TCP connection, and the codec that frames them.

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{WireCodec, MAX_LINE_BYTES};
pub use error::ProtocolError;
pub use message::{
    encode_line, DeviceMessage, MasterMessage, RegisterPayload, DEFAULT_DEVICE_PORT,
};

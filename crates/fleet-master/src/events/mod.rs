//! In-process event bus

mod bus;

pub use bus::{Event, EventBus, EventKind};

//! Best-effort notification fan-out for external observers

mod fanout;

pub use fanout::{Notification, NotificationHub, Observer};

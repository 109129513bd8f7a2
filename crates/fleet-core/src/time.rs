//! Time utilities shared across crates
//!
//! Timestamps throughout the registry are Unix milliseconds.

use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current Unix timestamp in milliseconds.
///
/// # Panics
/// Panics if the system clock is set before the Unix epoch, which would
/// indicate a severely misconfigured system.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX epoch")
        .as_millis() as u64
}

/// Milliseconds elapsed since a given timestamp (0 for future timestamps).
pub fn elapsed_millis(since: u64) -> u64 {
    now_millis().saturating_sub(since)
}

/// Seconds elapsed since a given millisecond timestamp.
pub fn elapsed_secs(since_millis: u64) -> u64 {
    elapsed_millis(since_millis) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_millis_is_positive() {
        assert!(now_millis() > 0);
    }

    #[test]
    fn test_elapsed_millis_future_time() {
        let future = now_millis() + 1_000_000;
        assert_eq!(elapsed_millis(future), 0);
    }

    #[test]
    fn test_elapsed_secs() {
        let past = now_millis() - 5_000;
        assert!(elapsed_secs(past) >= 5);
    }
}

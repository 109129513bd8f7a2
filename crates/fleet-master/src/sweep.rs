//! Stale-device sweep task
//!
//! Periodically removes devices that are unpaired, offline, and unseen
//! past the configured timeout. Paired devices are never touched — the
//! predicate lives in the registry; this task only provides the cadence
//! and the cancellable lifetime.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::registry::DeviceRegistry;

/// Run the sweep loop until cancelled.
pub async fn run_stale_sweep(
    registry: Arc<DeviceRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);

    tracing::info!(
        "Starting stale-device sweep (interval: {:?}, timeout: {:?})",
        interval,
        registry.stale_timeout()
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = registry.remove_stale_devices(None);
                if report.removed_count > 0 {
                    tracing::info!(
                        "Stale sweep removed {} device(s): {:?}",
                        report.removed_count,
                        report.removed_devices
                    );
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Stale-device sweep shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registration;
    use fleet_core::SutId;

    #[tokio::test]
    async fn test_sweep_loop_removes_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(
            DeviceRegistry::open(
                dir.path().join("paired.json"),
                5,
                Duration::from_millis(1),
            )
            .unwrap(),
        );

        registry.register_device(Registration {
            unique_id: SutId::new("dev-1"),
            ip: "10.0.0.5".to_string(),
            port: 8080,
            hostname: "host".to_string(),
            capabilities: Vec::new(),
            cpu_model: None,
            display_name: None,
            ssh_public_key: None,
            ssh_fingerprint: None,
        });
        registry.mark_device_offline(&SutId::new("dev-1"));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_stale_sweep(
            Arc::clone(&registry),
            Duration::from_millis(10),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();

        assert!(registry.get_device_by_id(&SutId::new("dev-1")).is_none());
    }
}

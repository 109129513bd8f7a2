//! Device control-plane listener
//!
//! Accepts incoming device connections and spawns a driver task per
//! transport. Sessions get a child cancellation token so shutting the
//! listener down also tears down every in-flight connection.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::server::session::run_device_session;
use crate::state::MasterState;

/// TCP server for device registrations
pub struct DeviceServer {
    state: Arc<MasterState>,
    cancel: CancellationToken,
}

impl DeviceServer {
    /// Create a server over the shared state
    pub fn new(state: Arc<MasterState>, cancel: CancellationToken) -> Self {
        Self { state, cancel }
    }

    /// Run the accept loop until cancelled.
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;

        let local_addr = listener.local_addr()?;
        tracing::info!("Device server listening on {}", local_addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Device server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => {
                            tracing::debug!("New connection from {}", peer_addr);

                            let state = Arc::clone(&self.state);
                            let cancel = self.cancel.child_token();

                            tokio::spawn(async move {
                                if let Err(e) =
                                    run_device_session(state, socket, peer_addr, cancel).await
                                {
                                    tracing::warn!("Connection from {} ended: {:#}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

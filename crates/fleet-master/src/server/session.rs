//! Per-transport registration and message loop
//!
//! Drives one device connection through its lifecycle: the first line
//! must be a valid registration payload or the transport is refused with
//! no state committed; once admitted, the loop serves heartbeats and key
//! installation reports until the transport closes or the session is
//! superseded by a reconnect.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use fleet_core::SutId;
use fleet_protocol::{
    encode_line, DeviceMessage, MasterMessage, RegisterPayload, WireCodec,
};

use crate::connection::DeviceSession;
use crate::registry::Registration;
use crate::state::MasterState;

/// How long a fresh transport may take to present its registration
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Drive one device transport to completion.
pub async fn run_device_session(
    state: Arc<MasterState>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    let mut framed = Framed::new(stream, WireCodec::new());

    // Registration is the price of admission: no valid payload, no record.
    let first_line = tokio::time::timeout(REGISTRATION_TIMEOUT, framed.next())
        .await
        .map_err(|_| anyhow::anyhow!("registration timed out for {}", peer_addr))?
        .ok_or_else(|| anyhow::anyhow!("{} closed before registering", peer_addr))?
        .context("failed to read registration line")?;

    let payload = RegisterPayload::parse(&first_line)
        .with_context(|| format!("refusing transport from {}: invalid registration", peer_addr))?;
    let sut_id = SutId::new(&payload.unique_id);

    tracing::info!(
        "SUT {} registering from {} (reported ip {})",
        sut_id,
        peer_addr,
        payload.ip
    );

    // Offered device key goes to the trust store first; a store failure is
    // not fatal to admission, it just reports unregistered.
    let ssh_registered = match &payload.ssh_public_key {
        Some(key) => match state.key_store.add_key(key, &sut_id) {
            Ok(outcome) => {
                tracing::info!(
                    "SSH key registered for {} ({})",
                    sut_id,
                    outcome.fingerprint()
                );
                true
            }
            Err(e) => {
                tracing::warn!("SSH key registration failed for {}: {}", sut_id, e);
                false
            }
        },
        None => false,
    };

    // Single atomic upsert: either the device is fully registered or
    // nothing happened.
    let record = state.registry.register_device(Registration {
        unique_id: sut_id.clone(),
        ip: payload.ip.clone(),
        port: payload.port,
        hostname: payload.hostname.clone(),
        capabilities: payload.capabilities.clone(),
        cpu_model: payload.cpu_model.clone(),
        display_name: payload.display_name.clone(),
        ssh_public_key: payload.ssh_public_key.clone(),
        ssh_fingerprint: payload.ssh_key_fingerprint.clone(),
    });

    // Master key material for the bidirectional exchange; unavailability
    // degrades the ack fields instead of failing registration.
    let (master_public_key, master_fingerprint) = match (
        state.master_keys.get_public_key(),
        state.master_keys.get_fingerprint(),
    ) {
        (Ok(key), Ok(fingerprint)) => (Some(key), Some(fingerprint)),
        (key, fingerprint) => {
            if let Err(e) = key.and(fingerprint) {
                tracing::warn!("Master key unavailable during registration: {}", e);
            }
            (None, None)
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel(state.config.outbound_queue_capacity);
    let session = state.connections.connect(DeviceSession::new(
        sut_id.clone(),
        record.session_id,
        payload.ip.clone(),
        outbound_tx,
        cancel.child_token(),
    ))?;

    let ack = MasterMessage::RegisterAck {
        message: format!("SUT {} registered successfully", sut_id),
        sut_id: sut_id.as_str().to_string(),
        ssh_registered,
        master_public_key,
        master_fingerprint,
        re_exchange: !record.master_key_installed,
        session_id: record.session_id,
    };
    framed.send(encode_line(&ack)?).await?;

    let result = serve(&state, &session, &mut framed, &mut outbound_rx).await;

    // Epoch-guarded teardown: if a reconnect superseded this session, its
    // replacement owns the entry and this is a no-op.
    if state.connections.disconnect(&sut_id, session.session_id) {
        state.registry.mark_device_offline(&sut_id);
        tracing::info!("SUT {} disconnected", sut_id);
    }

    result
}

/// Steady-state loop: forward queued outbound messages, answer device
/// messages, stop on close or supersession.
async fn serve(
    state: &Arc<MasterState>,
    session: &Arc<DeviceSession>,
    framed: &mut Framed<TcpStream, WireCodec>,
    outbound_rx: &mut mpsc::Receiver<MasterMessage>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = session.closed() => {
                tracing::debug!("Session {} for {} cancelled", session.session_id, session.sut_id);
                return Ok(());
            }

            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(message) => framed.send(encode_line(&message)?).await?,
                    None => return Ok(()),
                }
            }

            frame = framed.next() => {
                match frame {
                    Some(Ok(line)) => {
                        if let Some(reply) = handle_device_line(state, session, &line) {
                            framed.send(encode_line(&reply)?).await?;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Protocol error from {}: {}", session.sut_id, e);
                        return Ok(());
                    }
                    None => return Ok(()),
                }
            }
        }
    }
}

/// Dispatch one steady-state device message, producing the reply to send.
fn handle_device_line(
    state: &Arc<MasterState>,
    session: &Arc<DeviceSession>,
    line: &str,
) -> Option<MasterMessage> {
    let message = match DeviceMessage::parse(line) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("Ignoring unknown message from {}: {}", session.sut_id, e);
            return None;
        }
    };

    match message {
        DeviceMessage::Heartbeat => {
            state.registry.mark_seen(&session.sut_id);
            Some(MasterMessage::HeartbeatAck)
        }

        DeviceMessage::MasterKeyInstalled { success, error } => {
            if success {
                state
                    .registry
                    .update_master_key_status(&session.sut_id, true);
                tracing::info!("Master key installed on {}", session.sut_id);
                Some(MasterMessage::MasterKeyInstalledAck {
                    success: true,
                    error: None,
                })
            } else {
                let error = error.unwrap_or_else(|| "unknown error".to_string());
                tracing::warn!(
                    "Master key installation failed on {}: {}",
                    session.sut_id,
                    error
                );
                Some(MasterMessage::MasterKeyInstalledAck {
                    success: false,
                    error: Some(error),
                })
            }
        }
    }
}

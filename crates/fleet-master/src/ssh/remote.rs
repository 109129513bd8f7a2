//! Outbound shell access to devices using the Master's key
//!
//! Used for connectivity diagnostics and one-off administrative commands,
//! never for bulk transfer. Every operation carries an explicit timeout
//! and reports failure as a retryable `TransientIo` instead of raising.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};

use fleet_core::FleetError;

use super::master_key::MasterKeyManager;

/// Result of a remote command
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// True iff the command exited 0
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Outbound SSH client bound to the Master's identity
pub struct RemoteShell {
    keys: Arc<MasterKeyManager>,
    default_username: Option<String>,
    connect_timeout: Duration,
    exec_timeout: Duration,
}

impl RemoteShell {
    /// Create a client using the given key manager and timeouts
    pub fn new(
        keys: Arc<MasterKeyManager>,
        default_username: Option<String>,
        connect_timeout: Duration,
        exec_timeout: Duration,
    ) -> Self {
        Self {
            keys,
            default_username,
            connect_timeout,
            exec_timeout,
        }
    }

    fn resolve_username(&self, username: Option<&str>) -> String {
        username
            .map(str::to_string)
            .or_else(|| self.default_username.clone())
            .unwrap_or_else(whoami::username)
    }

    /// Probe shell access to a device: connect with the Master's key, run
    /// a trivial echo, and require the expected output within the timeout.
    pub async fn test_connection(
        &self,
        device_ip: &str,
        username: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<String, FleetError> {
        let output = self
            .execute_on_device(device_ip, "echo SSH_OK", username, timeout)
            .await?;

        if output.success && output.stdout.contains("SSH_OK") {
            tracing::info!("SSH connection to {} successful", device_ip);
            Ok("Connection successful".to_string())
        } else {
            let detail = if output.stderr.trim().is_empty() {
                "connection failed".to_string()
            } else {
                output.stderr.trim().to_string()
            };
            tracing::warn!("SSH connection to {} failed: {}", device_ip, detail);
            Err(FleetError::TransientIo(detail))
        }
    }

    /// Execute a command on a device over SSH.
    ///
    /// Key material problems surface as `KeyMaterialUnavailable`; every
    /// network or auth failure (including timeout) is `TransientIo`.
    pub async fn execute_on_device(
        &self,
        device_ip: &str,
        command: &str,
        username: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, FleetError> {
        let key = Arc::new(self.keys.load_keypair()?);
        let username = self.resolve_username(username);
        let timeout = timeout.unwrap_or(self.exec_timeout);

        match tokio::time::timeout(timeout, self.run(device_ip, command, &username, key)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(FleetError::TransientIo(e.to_string())),
            Err(_) => Err(FleetError::TransientIo(format!(
                "command on {} timed out after {:?}",
                device_ip, timeout
            ))),
        }
    }

    async fn run(
        &self,
        device_ip: &str,
        command: &str,
        username: &str,
        key: Arc<KeyPair>,
    ) -> Result<ExecOutput> {
        let config = Arc::new(client::Config::default());
        let address = format!("{}:22", device_ip);

        tracing::debug!("Connecting to {} as {}", address, username);
        let mut session = tokio::time::timeout(
            self.connect_timeout,
            client::connect(config, address.as_str(), AcceptingHandler),
        )
        .await
        .map_err(|_| anyhow::anyhow!("connection to {} timed out", address))??;

        let authenticated = session.authenticate_publickey(username, key).await?;
        if !authenticated {
            anyhow::bail!("authentication rejected by {}", device_ip);
        }

        let mut channel = session.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }

        let _ = session
            .disconnect(Disconnect::ByApplication, "done", "en")
            .await;

        Ok(ExecOutput {
            success: exit_status == Some(0),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

/// Host keys are accepted without verification: first contact happens
/// before any trust exists, and shell access itself is what the trust
/// exchange validates afterwards.
struct AcceptingHandler;

#[async_trait]
impl client::Handler for AcceptingHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Device host key: {}", server_public_key.fingerprint());
        Ok(true)
    }
}

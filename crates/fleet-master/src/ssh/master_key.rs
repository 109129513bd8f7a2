//! Master key manager (Master → device direction)
//!
//! Owns the Master's single SSH identity: a dedicated Ed25519 pair
//! (separate from any user key), generated without a passphrase on first
//! use, persisted under the configured SSH directory, and never
//! regenerated once present. The public half travels to devices in the
//! registration ack and in `install_master_key` pushes.

use std::path::{Path, PathBuf};

use russh_keys::key::KeyPair;
use russh_keys::PublicKeyBase64;
use serde::Serialize;

use fleet_core::FleetError;

/// File stem of the Master's dedicated key pair
pub const MASTER_KEY_NAME: &str = "master_ed25519";

/// Key material summary for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct MasterKeyInfo {
    pub exists: bool,
    pub fingerprint: Option<String>,
    pub public_key_path: String,
    pub private_key_path: String,
}

/// Manages the Master's own SSH key pair
pub struct MasterKeyManager {
    ssh_dir: PathBuf,
    key_path: PathBuf,
    pub_key_path: PathBuf,
}

impl MasterKeyManager {
    /// Create a manager rooted at the given SSH directory
    pub fn new(ssh_dir: PathBuf) -> Self {
        let key_path = ssh_dir.join(MASTER_KEY_NAME);
        let pub_key_path = ssh_dir.join(format!("{}.pub", MASTER_KEY_NAME));
        Self {
            ssh_dir,
            key_path,
            pub_key_path,
        }
    }

    /// Path of the private key
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Path of the public key
    pub fn public_key_path(&self) -> &Path {
        &self.pub_key_path
    }

    /// Ensure the key pair exists, generating it on first call.
    ///
    /// Subsequent calls are no-ops; an existing key is never regenerated.
    pub fn ensure_key_exists(&self) -> Result<(), FleetError> {
        if self.key_path.exists() && self.pub_key_path.exists() {
            tracing::debug!("Master SSH key already exists: {:?}", self.key_path);
            return Ok(());
        }

        std::fs::create_dir_all(&self.ssh_dir).map_err(|e| {
            FleetError::KeyMaterialUnavailable(format!(
                "failed to create SSH directory {:?}: {}",
                self.ssh_dir, e
            ))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&self.ssh_dir, std::fs::Permissions::from_mode(0o700));
        }

        let pair = KeyPair::generate_ed25519().ok_or_else(|| {
            FleetError::KeyMaterialUnavailable("Ed25519 key generation failed".to_string())
        })?;

        // Private half, PEM-encoded, no passphrase
        let mut pem = Vec::new();
        russh_keys::encode_pkcs8_pem(&pair, &mut pem).map_err(|e| {
            FleetError::KeyMaterialUnavailable(format!("failed to encode private key: {}", e))
        })?;
        std::fs::write(&self.key_path, &pem).map_err(|e| {
            FleetError::KeyMaterialUnavailable(format!("failed to write private key: {}", e))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ =
                std::fs::set_permissions(&self.key_path, std::fs::Permissions::from_mode(0o600));
        }

        // Public half in OpenSSH line format
        let public = pair.clone_public_key().map_err(|e| {
            FleetError::KeyMaterialUnavailable(format!("failed to derive public key: {}", e))
        })?;
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        let line = format!(
            "{} {} master@{}\n",
            public.name(),
            public.public_key_base64(),
            hostname
        );
        std::fs::write(&self.pub_key_path, line).map_err(|e| {
            FleetError::KeyMaterialUnavailable(format!("failed to write public key: {}", e))
        })?;

        tracing::info!("Generated Master SSH key pair: {:?}", self.key_path);
        Ok(())
    }

    /// Read the public key line, generating the pair first if needed.
    pub fn get_public_key(&self) -> Result<String, FleetError> {
        self.ensure_key_exists()?;
        let content = std::fs::read_to_string(&self.pub_key_path).map_err(|e| {
            FleetError::KeyMaterialUnavailable(format!("failed to read public key: {}", e))
        })?;
        Ok(content.trim().to_string())
    }

    /// SHA256 fingerprint of the Master's key, generating first if needed.
    pub fn get_fingerprint(&self) -> Result<String, FleetError> {
        let line = self.get_public_key()?;
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            return Err(FleetError::KeyMaterialUnavailable(
                "malformed public key file".to_string(),
            ));
        }
        let key = russh_keys::parse_public_key_base64(parts[1]).map_err(|e| {
            FleetError::KeyMaterialUnavailable(format!("failed to parse public key: {}", e))
        })?;
        Ok(format!("SHA256:{}", key.fingerprint()))
    }

    /// Load the private key for outbound connections.
    pub fn load_keypair(&self) -> Result<KeyPair, FleetError> {
        self.ensure_key_exists()?;
        russh_keys::load_secret_key(&self.key_path, None).map_err(|e| {
            FleetError::KeyMaterialUnavailable(format!(
                "failed to load private key {:?}: {}",
                self.key_path, e
            ))
        })
    }

    /// Key summary without forcing generation.
    pub fn key_info(&self) -> MasterKeyInfo {
        let exists = self.key_path.exists() && self.pub_key_path.exists();
        MasterKeyInfo {
            exists,
            fingerprint: if exists { self.get_fingerprint().ok() } else { None },
            public_key_path: self.pub_key_path.display().to_string(),
            private_key_path: self.key_path.display().to_string(),
        }
    }
}

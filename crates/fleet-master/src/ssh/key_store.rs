//! Trusted device-key store (device → Master direction)
//!
//! A durable authorized-keys style file: one OpenSSH public key line per
//! trusted device, comment field carrying the owning device id. Adds
//! append to the file; removals rewrite it wholesale. The whole store
//! lives behind one mutex, which also serializes the file writes.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::Serialize;

use fleet_core::time::now_millis;
use fleet_core::{FleetError, SutId};

/// One trusted device key
#[derive(Debug, Clone, Serialize)]
pub struct TrustedKey {
    /// Full key line as stored (`type base64 comment`)
    pub public_key: String,
    /// The base64 data portion, used for idempotence checks
    pub key_data: String,
    /// OpenSSH-style fingerprint (`SHA256:...`)
    pub fingerprint: String,
    /// Device the key belongs to
    pub owner: String,
    /// When the key was registered (Unix millis)
    pub registered_at: u64,
}

/// Outcome of a key registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRegistration {
    /// The key was appended to the store
    Added { fingerprint: String },
    /// Identical key material was already present; nothing changed
    AlreadyRegistered { fingerprint: String },
}

impl KeyRegistration {
    /// Fingerprint of the registered key either way
    pub fn fingerprint(&self) -> &str {
        match self {
            KeyRegistration::Added { fingerprint }
            | KeyRegistration::AlreadyRegistered { fingerprint } => fingerprint,
        }
    }
}

/// Durable store of device public keys the Master trusts
pub struct KeyStore {
    path: PathBuf,
    entries: Mutex<Vec<TrustedKey>>,
}

impl KeyStore {
    /// Open the store, loading any existing key file. Unparseable lines
    /// are skipped with a warning rather than failing startup.
    pub fn open(path: PathBuf) -> Result<Self, FleetError> {
        let mut entries = Vec::new();

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            for (line_num, line) in content.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                match parse_key_line(line) {
                    Some(entry) => entries.push(entry),
                    None => {
                        tracing::warn!(
                            "Skipping unparseable key on line {} of {:?}",
                            line_num + 1,
                            path
                        );
                    }
                }
            }
            tracing::info!("Loaded {} trusted device keys from {:?}", entries.len(), path);
        }

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TrustedKey>> {
        self.entries.lock().expect("key store lock poisoned")
    }

    /// Register a device's public key.
    ///
    /// Idempotent: identical key material (the base64 data portion) under
    /// any existing entry reports `AlreadyRegistered` without touching the
    /// file. Empty or unrecognizable input is refused.
    pub fn add_key(
        &self,
        public_key: &str,
        owner: &SutId,
    ) -> Result<KeyRegistration, FleetError> {
        let public_key = public_key.trim();
        if public_key.is_empty() {
            return Err(FleetError::ProtocolViolation("empty public key".to_string()));
        }
        if !(public_key.starts_with("ssh-") || public_key.starts_with("ecdsa-")) {
            return Err(FleetError::ProtocolViolation(
                "unrecognized public key type".to_string(),
            ));
        }

        let parts: Vec<&str> = public_key.split_whitespace().collect();
        if parts.len() < 2 {
            return Err(FleetError::ProtocolViolation(
                "malformed public key line".to_string(),
            ));
        }
        let key_data = parts[1];
        let parsed = russh_keys::parse_public_key_base64(key_data).map_err(|e| {
            FleetError::ProtocolViolation(format!("unparseable public key: {}", e))
        })?;
        let fingerprint = format!("SHA256:{}", parsed.fingerprint());

        let mut entries = self.lock();
        if let Some(existing) = entries.iter().find(|e| e.key_data == key_data) {
            tracing::debug!(
                "Key {} already registered (owner {})",
                fingerprint,
                existing.owner
            );
            return Ok(KeyRegistration::AlreadyRegistered {
                fingerprint: existing.fingerprint.clone(),
            });
        }

        let stored_line = format!("{} {} {}", parts[0], key_data, owner);
        self.append_line(&stored_line)?;

        entries.push(TrustedKey {
            public_key: stored_line,
            key_data: key_data.to_string(),
            fingerprint: fingerprint.clone(),
            owner: owner.as_str().to_string(),
            registered_at: now_millis(),
        });

        tracing::info!("Registered device key {} for {}", fingerprint, owner);
        Ok(KeyRegistration::Added { fingerprint })
    }

    /// Whether a key with the given fingerprint is in the store
    pub fn is_key_registered(&self, fingerprint: &str) -> bool {
        self.lock().iter().any(|e| e.fingerprint == fingerprint)
    }

    /// Remove the key with the given fingerprint, rewriting the store file.
    pub fn remove_key(&self, fingerprint: &str) -> Result<(), FleetError> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.fingerprint != fingerprint);

        if entries.len() == before {
            return Err(FleetError::NotFound(format!(
                "no trusted key with fingerprint {}",
                fingerprint
            )));
        }

        self.rewrite(&entries)?;
        tracing::info!("Removed trusted key {}", fingerprint);
        Ok(())
    }

    /// Number of trusted keys
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store holds no keys
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn ensure_dir(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
            }
        }
        Ok(())
    }

    fn append_line(&self, line: &str) -> Result<(), FleetError> {
        self.ensure_dir()?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    fn rewrite(&self, entries: &[TrustedKey]) -> Result<(), FleetError> {
        self.ensure_dir()?;

        let mut content = String::new();
        for entry in entries {
            content.push_str(&entry.public_key);
            content.push('\n');
        }
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

/// Parse a stored `type base64 comment` line back into an entry
fn parse_key_line(line: &str) -> Option<TrustedKey> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 2 {
        return None;
    }

    let key = russh_keys::parse_public_key_base64(parts[1]).ok()?;
    Some(TrustedKey {
        public_key: line.to_string(),
        key_data: parts[1].to_string(),
        fingerprint: format!("SHA256:{}", key.fingerprint()),
        owner: parts.get(2).unwrap_or(&"").to_string(),
        registered_at: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_keys::key::KeyPair;
    use russh_keys::PublicKeyBase64;

    fn generate_key_line(comment: &str) -> String {
        let pair = KeyPair::generate_ed25519().unwrap();
        format!(
            "ssh-ed25519 {} {}",
            pair.clone_public_key().unwrap().public_key_base64(),
            comment
        )
    }

    fn store(dir: &tempfile::TempDir) -> KeyStore {
        KeyStore::open(dir.path().join("keys").join("authorized_keys")).unwrap()
    }

    #[test]
    fn test_add_key_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let key = generate_key_line("sut@lab");
        let owner = SutId::new("dev-1");

        let first = store.add_key(&key, &owner).unwrap();
        assert!(matches!(first, KeyRegistration::Added { .. }));

        let second = store.add_key(&key, &owner).unwrap();
        assert!(matches!(second, KeyRegistration::AlreadyRegistered { .. }));
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_add_key_rejects_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let err = store.add_key("   ", &SutId::new("dev-1")).unwrap_err();
        assert!(matches!(err, FleetError::ProtocolViolation(_)));
    }

    #[test]
    fn test_add_key_rejects_unknown_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let err = store
            .add_key("gpg-rsa AAAAB3NzaC1yc2E dev", &SutId::new("dev-1"))
            .unwrap_err();
        assert!(matches!(err, FleetError::ProtocolViolation(_)));
    }

    #[test]
    fn test_add_key_rejects_garbage_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let err = store
            .add_key("ssh-ed25519 not-base64!!! dev", &SutId::new("dev-1"))
            .unwrap_err();
        assert!(matches!(err, FleetError::ProtocolViolation(_)));
    }

    #[test]
    fn test_is_key_registered() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let key = generate_key_line("sut@lab");

        let added = store.add_key(&key, &SutId::new("dev-1")).unwrap();
        assert!(store.is_key_registered(added.fingerprint()));
        assert!(!store.is_key_registered("SHA256:missing"));
    }

    #[test]
    fn test_remove_key_rewrites_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        let store = KeyStore::open(path.clone()).unwrap();

        let keep = generate_key_line("keep");
        let drop = generate_key_line("drop");
        store.add_key(&keep, &SutId::new("dev-keep")).unwrap();
        let dropped = store.add_key(&drop, &SutId::new("dev-drop")).unwrap();

        store.remove_key(dropped.fingerprint()).unwrap();
        assert_eq!(store.len(), 1);
        assert!(!store.is_key_registered(dropped.fingerprint()));

        // The rewritten file no longer contains the removed key
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("dev-drop"));
        assert!(content.contains("dev-keep"));
    }

    #[test]
    fn test_remove_missing_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let err = store.remove_key("SHA256:missing").unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));
    }

    #[test]
    fn test_store_reloads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        let key = generate_key_line("sut@lab");

        let fingerprint = {
            let store = KeyStore::open(path.clone()).unwrap();
            store
                .add_key(&key, &SutId::new("dev-1"))
                .unwrap()
                .fingerprint()
                .to_string()
        };

        let reloaded = KeyStore::open(path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.is_key_registered(&fingerprint));
    }
}

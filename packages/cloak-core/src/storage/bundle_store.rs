//! # Bundle Store
//!
//! Keeps a user's [`PasswordKeyBundle`] between reloads so the password is
//! asked for once per login, not once per page load.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         BUNDLE STORE                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  save(user, bundle)                                                    │
//! │     entry = { user_id, expires_at, payload }                           │
//! │     payload = base64(nonce || AES-GCM(device_key, bundle JSON,         │
//! │                                   aad = "cloak.bundle.<user>"))        │
//! │             | bundle JWK JSON            (memory store, no device key) │
//! │                                                                         │
//! │  load(user)                                                            │
//! │     missing            → None                                          │
//! │     expired            → entry deleted, None                           │
//! │     unreadable/forged  → InvalidKeyMaterial                            │
//! │                                                                         │
//! │  Backends: in-memory map, or one JSON file per user in a directory.    │
//! │  The directory backend always has a device key.                       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::config::CoreConfig;
use crate::crypto::{
    decrypt, deserialize_bundle, encrypt, serialize_bundle, EncryptionKey, Nonce,
    PasswordKeyBundle, NONCE_SIZE,
};
use crate::error::{Error, Result};
use crate::protocol::UserId;

/// Persisted entry
#[derive(Serialize, Deserialize)]
struct StoredBundle {
    user_id: UserId,
    /// Unix millis after which the entry is dead
    expires_at: i64,
    wrapped: bool,
    payload: String,
}

enum Backend {
    Memory(RwLock<HashMap<UserId, String>>),
    Directory(PathBuf),
}

/// Expiring store for key bundles
pub struct BundleStore {
    backend: Backend,
    wrapping_key: Option<EncryptionKey>,
    ttl: Duration,
}

impl BundleStore {
    /// Store that lives only as long as the process
    pub fn in_memory(ttl: Duration) -> Self {
        Self {
            backend: Backend::Memory(RwLock::new(HashMap::new())),
            wrapping_key: None,
            ttl,
        }
    }

    /// Store that keeps one file per user under `dir`, wrapped with
    /// `device_key`
    ///
    /// The directory is created if missing.
    pub fn in_directory(
        dir: impl Into<PathBuf>,
        ttl: Duration,
        device_key: [u8; 32],
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            Error::StorageWriteError(format!("Cannot create {}: {}", dir.display(), e))
        })?;

        Ok(Self {
            backend: Backend::Directory(dir),
            wrapping_key: Some(EncryptionKey::from_bytes(device_key)),
            ttl,
        })
    }

    /// Build from configuration
    ///
    /// ## Errors
    ///
    /// `InvalidConfig` if `bundle_dir` is set without a usable `bundle_key`.
    pub fn from_config(config: &CoreConfig) -> Result<Self> {
        let key = config.bundle_key()?;
        match (&config.bundle_dir, key) {
            (Some(dir), Some(key)) => Self::in_directory(dir, config.bundle_ttl(), key),
            (Some(dir), None) => Err(Error::InvalidConfig(format!(
                "bundle_dir {} needs a bundle_key",
                dir.display()
            ))),
            (None, Some(key)) => Ok(Self::in_memory(config.bundle_ttl()).with_wrapping_key(key)),
            (None, None) => Ok(Self::in_memory(config.bundle_ttl())),
        }
    }

    /// Encrypt entries at rest with a device key
    pub fn with_wrapping_key(mut self, key: [u8; 32]) -> Self {
        self.wrapping_key = Some(EncryptionKey::from_bytes(key));
        self
    }

    /// Persist `bundle` for `user`, replacing any previous entry
    pub fn save(&self, user: UserId, bundle: &PasswordKeyBundle) -> Result<()> {
        let json = Zeroizing::new(serialize_bundle(bundle)?);

        let (wrapped, payload) = match &self.wrapping_key {
            Some(key) => {
                let (nonce, ciphertext) = encrypt(key, json.as_bytes(), &aad(user))?;
                let mut blob = nonce.as_bytes().to_vec();
                blob.extend_from_slice(&ciphertext);
                (true, STANDARD.encode(blob))
            }
            None => (false, json.to_string()),
        };

        let expires_at = crate::time::now_timestamp_millis()
            .saturating_add(i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX));

        let entry = serde_json::to_string(&StoredBundle {
            user_id: user,
            expires_at,
            wrapped,
            payload,
        })?;

        self.write_raw(user, entry)?;
        tracing::debug!("Saved key bundle for user {}", user);
        Ok(())
    }

    /// Load the bundle for `user`
    ///
    /// ## Errors
    ///
    /// `InvalidKeyMaterial` if the entry exists but cannot be turned back
    /// into a bundle (corrupt, wrong device key, wrong user).
    pub fn load(&self, user: UserId) -> Result<Option<PasswordKeyBundle>> {
        let Some(raw) = self.read_raw(user)? else {
            return Ok(None);
        };

        let entry: StoredBundle = serde_json::from_str(&raw)
            .map_err(|e| Error::InvalidKeyMaterial(format!("Unreadable bundle entry: {}", e)))?;

        if entry.user_id != user {
            return Err(Error::InvalidKeyMaterial(format!(
                "Entry belongs to user {}",
                entry.user_id
            )));
        }

        if crate::time::now_timestamp_millis() >= entry.expires_at {
            tracing::info!("Key bundle for user {} expired", user);
            self.clear(user)?;
            return Ok(None);
        }

        let json = match (&self.wrapping_key, entry.wrapped) {
            (Some(key), true) => Zeroizing::new(unwrap_payload(key, user, &entry.payload)?),
            (None, false) => Zeroizing::new(entry.payload.clone()),
            (None, true) => {
                return Err(Error::InvalidKeyMaterial(
                    "Entry is wrapped but no device key is set".into(),
                ))
            }
            (Some(_), false) => {
                return Err(Error::InvalidKeyMaterial(
                    "Refusing unwrapped entry in a keyed store".into(),
                ))
            }
        };

        deserialize_bundle(&json).map(Some)
    }

    /// Remove the entry for `user`
    ///
    /// Returns whether anything was removed.
    pub fn clear(&self, user: UserId) -> Result<bool> {
        match &self.backend {
            Backend::Memory(map) => Ok(map.write().remove(&user).is_some()),
            Backend::Directory(dir) => {
                let path = entry_path(dir, user);
                match fs::remove_file(&path) {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(Error::StorageWriteError(format!(
                        "Cannot remove {}: {}",
                        path.display(),
                        e
                    ))),
                }
            }
        }
    }

    fn write_raw(&self, user: UserId, entry: String) -> Result<()> {
        match &self.backend {
            Backend::Memory(map) => {
                map.write().insert(user, entry);
                Ok(())
            }
            Backend::Directory(dir) => {
                let path = entry_path(dir, user);
                fs::write(&path, entry).map_err(|e| {
                    Error::StorageWriteError(format!("Cannot write {}: {}", path.display(), e))
                })
            }
        }
    }

    fn read_raw(&self, user: UserId) -> Result<Option<String>> {
        match &self.backend {
            Backend::Memory(map) => Ok(map.read().get(&user).cloned()),
            Backend::Directory(dir) => {
                let path = entry_path(dir, user);
                match fs::read_to_string(&path) {
                    Ok(raw) => Ok(Some(raw)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(Error::StorageReadError(format!(
                        "Cannot read {}: {}",
                        path.display(),
                        e
                    ))),
                }
            }
        }
    }
}

impl std::fmt::Debug for BundleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match &self.backend {
            Backend::Memory(_) => "memory".to_string(),
            Backend::Directory(dir) => dir.display().to_string(),
        };
        f.debug_struct("BundleStore")
            .field("backend", &backend)
            .field("wrapped", &self.wrapping_key.is_some())
            .field("ttl", &self.ttl)
            .finish()
    }
}

fn entry_path(dir: &Path, user: UserId) -> PathBuf {
    dir.join(format!("{}.bundle.json", user))
}

fn aad(user: UserId) -> Vec<u8> {
    format!("cloak.bundle.{}", user).into_bytes()
}

fn unwrap_payload(key: &EncryptionKey, user: UserId, payload: &str) -> Result<String> {
    let blob = STANDARD
        .decode(payload)
        .map_err(|e| Error::InvalidKeyMaterial(format!("Invalid wrapped payload: {}", e)))?;

    if blob.len() < NONCE_SIZE {
        return Err(Error::InvalidKeyMaterial("Wrapped payload too short".into()));
    }

    let nonce = Nonce::from_slice(&blob[..NONCE_SIZE])?;
    let plaintext = Zeroizing::new(
        decrypt(key, &nonce, &blob[NONCE_SIZE..], &aad(user))
            .map_err(|_| Error::InvalidKeyMaterial("Device key does not open bundle".into()))?,
    );

    String::from_utf8(plaintext.to_vec())
        .map_err(|_| Error::InvalidKeyMaterial("Bundle is not UTF-8".into()))
}

// ============================================================================
// TESTS
// ============================================================================

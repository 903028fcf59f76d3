//! # Archive Cipher
//!
//! Seals message text for the server-side archive under the user's
//! password-derived bundle, and opens archived records again.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         ARCHIVE RECORD                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  seal(plaintext, bundle)                                               │
//! │     iv         = 12 random bytes                                       │
//! │     ciphertext = AES-256-GCM(bundle.encryption_key, iv, plaintext)     │
//! │     auth_tag   = HMAC-SHA256(bundle.authentication_key, ciphertext)    │
//! │                                                                         │
//! │  open(record, bundle)                                                  │
//! │     1. verify auth_tag over ciphertext      → IntegrityCheckFailed     │
//! │     2. AES-GCM decrypt (checks GCM tag too) → DecryptionFailed         │
//! │                                                                         │
//! │  The HMAC is checked first; GCM is never asked to decrypt a record     │
//! │  whose outer tag is wrong.                                             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Stored form: `{ "iv": b64, "ciphertext": b64, "authTag": b64 }`

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::encryption::{self, Nonce, NONCE_SIZE};
use super::kdf::PasswordKeyBundle;
use super::mac::{hmac_sha256, verify_hmac_sha256};

/// Size of the archive IV in bytes
pub const ARCHIVE_IV_SIZE: usize = NONCE_SIZE;

/// One archived message, sealed under a [`PasswordKeyBundle`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEncryptedRecord {
    /// AES-GCM nonce, fresh per record
    pub iv: Nonce,
    /// AES-GCM ciphertext including the GCM tag
    pub ciphertext: Vec<u8>,
    /// HMAC-SHA256 over `ciphertext`
    pub auth_tag: Vec<u8>,
}

impl ArchiveEncryptedRecord {
    /// Encode for storage
    pub fn to_stored(&self) -> StoredRecord {
        StoredRecord {
            iv: STANDARD.encode(self.iv.as_bytes()),
            ciphertext: STANDARD.encode(&self.ciphertext),
            auth_tag: STANDARD.encode(&self.auth_tag),
        }
    }

    /// Decode from storage
    ///
    /// ## Errors
    ///
    /// `MalformedRecord` if any field is not base64 or the IV has the
    /// wrong length.
    pub fn from_stored(stored: &StoredRecord) -> Result<Self> {
        Ok(Self {
            iv: Nonce::from_slice(&STANDARD.decode(&stored.iv)?)?,
            ciphertext: STANDARD.decode(&stored.ciphertext)?,
            auth_tag: STANDARD.decode(&stored.auth_tag)?,
        })
    }
}

/// Archive record as persisted (all fields base64)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    /// Base64 IV
    pub iv: String,
    /// Base64 ciphertext
    pub ciphertext: String,
    /// Base64 HMAC tag
    pub auth_tag: String,
}

/// Seal plaintext for the archive
pub fn seal(plaintext: &[u8], bundle: &PasswordKeyBundle) -> Result<ArchiveEncryptedRecord> {
    let (iv, ciphertext) = encryption::encrypt(&bundle.encryption_key(), plaintext, &[])?;
    let auth_tag = hmac_sha256(bundle.authentication_key(), &ciphertext)?;

    Ok(ArchiveEncryptedRecord {
        iv,
        ciphertext,
        auth_tag: auth_tag.to_vec(),
    })
}

/// Open an archived record
///
/// ## Errors
///
/// - `IntegrityCheckFailed` if the HMAC does not match (checked first)
/// - `DecryptionFailed` if AES-GCM rejects the ciphertext
pub fn open(record: &ArchiveEncryptedRecord, bundle: &PasswordKeyBundle) -> Result<Vec<u8>> {
    verify_hmac_sha256(bundle.authentication_key(), &record.ciphertext, &record.auth_tag)?;

    encryption::decrypt(&bundle.encryption_key(), &record.iv, &record.ciphertext, &[]).map_err(
        |e| match e {
            Error::DecryptionFailed(_) => Error::DecryptionFailed("archive record".into()),
            other => other,
        },
    )
}

// ============================================================================
// TESTS
// ============================================================================

//! # Password Key Derivation
//!
//! Derives the archive key bundle from the user's password and per-user
//! salt. The same inputs always yield the same bundle, so history sealed
//! on one login can be opened on the next.
//!
//! ## Derivation
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    PASSWORD → KEY BUNDLE                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  key material = password bytes || salt bytes                           │
//! │                          │                                              │
//! │            ┌─────────────┴─────────────┐                               │
//! │            ▼                           ▼                               │
//! │  ┌───────────────────────┐   ┌───────────────────────┐                │
//! │  │  ENCRYPTION KEY       │   │  AUTHENTICATION KEY   │                │
//! │  │                       │   │                       │                │
//! │  │  PBKDF2-HMAC-SHA256(  │   │  PBKDF2-HMAC-SHA256(  │                │
//! │  │    material,          │   │    material,          │                │
//! │  │    salt = 01..10,     │   │    salt = 11..20,     │                │
//! │  │    100 000 rounds)    │   │    100 000 rounds)    │                │
//! │  │                       │   │                       │                │
//! │  │  → 32-byte AES key    │   │  → 32-byte HMAC key   │                │
//! │  └───────────────────────┘   └───────────────────────┘                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The two fixed salts only separate the two derivations from each other.
//! The per-user salt is what separates users.
//!
//! ## Portable Form
//!
//! A bundle serializes to two `oct` JWKs so it can be persisted between
//! reloads without re-prompting for the password:
//!
//! ```text
//! { "encryptionKey": { "kty": "oct", "k": "...", "alg": "A256GCM" },
//!   "hmacKey":       { "kty": "oct", "k": "...", "alg": "HS256"   } }
//! ```

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, engine::general_purpose::STANDARD, Engine as _};
use hmac::Hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Error, Result};

use super::encryption::{EncryptionKey, KEY_SIZE};

/// PBKDF2 iteration count for both bundle keys
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Length of salts produced by [`generate_salt`]
pub const SALT_SIZE: usize = 32;

/// Fixed derivation salts
///
/// These keep the encryption key and the authentication key independent
/// even though both come from the same password material.
pub mod domain {
    /// Salt for the archive encryption key
    pub const ENCRYPTION_KEY: [u8; 16] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];

    /// Salt for the archive authentication key
    pub const AUTHENTICATION_KEY: [u8; 16] =
        [17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31, 32];
}

/// Symmetric keys protecting the user's message archive
///
/// ## Security
///
/// Both keys are zeroized on drop. `Debug` is redacted and equality is
/// constant-time.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PasswordKeyBundle {
    encryption_key: [u8; KEY_SIZE],
    authentication_key: [u8; KEY_SIZE],
}

impl PasswordKeyBundle {
    /// Derive the bundle from a password and a per-user salt
    ///
    /// Runs two PBKDF2 derivations of 100 000 rounds each; call it off the
    /// async executor.
    pub fn derive(password: &str, salt: &[u8]) -> Result<Self> {
        let mut material = Zeroizing::new(Vec::with_capacity(password.len() + salt.len()));
        material.extend_from_slice(password.as_bytes());
        material.extend_from_slice(salt);

        let mut bundle = Self {
            encryption_key: [0u8; KEY_SIZE],
            authentication_key: [0u8; KEY_SIZE],
        };

        pbkdf2::pbkdf2::<Hmac<Sha256>>(
            &material,
            &domain::ENCRYPTION_KEY,
            PBKDF2_ITERATIONS,
            &mut bundle.encryption_key,
        )
        .map_err(|e| Error::KeyDerivationFailed(format!("encryption key: {}", e)))?;

        pbkdf2::pbkdf2::<Hmac<Sha256>>(
            &material,
            &domain::AUTHENTICATION_KEY,
            PBKDF2_ITERATIONS,
            &mut bundle.authentication_key,
        )
        .map_err(|e| Error::KeyDerivationFailed(format!("authentication key: {}", e)))?;

        Ok(bundle)
    }

    /// Build a bundle from raw key bytes
    pub fn from_keys(encryption_key: [u8; KEY_SIZE], authentication_key: [u8; KEY_SIZE]) -> Self {
        Self {
            encryption_key,
            authentication_key,
        }
    }

    /// The AES-256-GCM key
    pub(crate) fn encryption_key(&self) -> EncryptionKey {
        EncryptionKey::from_bytes(self.encryption_key)
    }

    /// The HMAC-SHA256 key
    pub(crate) fn authentication_key(&self) -> &[u8; KEY_SIZE] {
        &self.authentication_key
    }

    /// Serialize to the portable JWK pair
    pub fn to_portable(&self) -> PortableBundle {
        PortableBundle {
            encryption_key: SymmetricJwk::new(&self.encryption_key, ENCRYPTION_ALG),
            hmac_key: SymmetricJwk::new(&self.authentication_key, AUTHENTICATION_ALG),
        }
    }

    /// Rebuild from the portable JWK pair
    ///
    /// ## Errors
    ///
    /// `InvalidKeyMaterial` if either key has the wrong type, algorithm,
    /// encoding or length.
    pub fn from_portable(portable: &PortableBundle) -> Result<Self> {
        Ok(Self {
            encryption_key: portable.encryption_key.key_bytes(ENCRYPTION_ALG)?,
            authentication_key: portable.hmac_key.key_bytes(AUTHENTICATION_ALG)?,
        })
    }
}

impl PartialEq for PasswordKeyBundle {
    fn eq(&self, other: &Self) -> bool {
        let enc = self.encryption_key[..].ct_eq(&other.encryption_key[..]);
        let auth = self.authentication_key[..].ct_eq(&other.authentication_key[..]);
        (enc & auth).into()
    }
}

impl Eq for PasswordKeyBundle {}

impl std::fmt::Debug for PasswordKeyBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PasswordKeyBundle([REDACTED])")
    }
}

const SYMMETRIC_KEY_TYPE: &str = "oct";
const ENCRYPTION_ALG: &str = "A256GCM";
const AUTHENTICATION_ALG: &str = "HS256";

/// Serialized bundle
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortableBundle {
    /// Archive encryption key
    pub encryption_key: SymmetricJwk,
    /// Archive authentication key
    pub hmac_key: SymmetricJwk,
}

/// A symmetric key as an `oct` JWK
#[derive(Clone, Serialize, Deserialize)]
pub struct SymmetricJwk {
    /// Always `oct`
    pub kty: String,
    /// Key bytes, base64url without padding
    pub k: String,
    /// `A256GCM` or `HS256`
    pub alg: String,
    /// Extractable flag
    #[serde(default)]
    pub ext: bool,
}

impl SymmetricJwk {
    fn new(key: &[u8; KEY_SIZE], alg: &str) -> Self {
        Self {
            kty: SYMMETRIC_KEY_TYPE.to_string(),
            k: URL_SAFE_NO_PAD.encode(key),
            alg: alg.to_string(),
            ext: true,
        }
    }

    fn key_bytes(&self, expected_alg: &str) -> Result<[u8; KEY_SIZE]> {
        if self.kty != SYMMETRIC_KEY_TYPE {
            return Err(Error::InvalidKeyMaterial(format!(
                "Unsupported key type: {}",
                self.kty
            )));
        }
        if self.alg != expected_alg {
            return Err(Error::InvalidKeyMaterial(format!(
                "Expected {} key, got {}",
                expected_alg, self.alg
            )));
        }

        let bytes = Zeroizing::new(
            URL_SAFE_NO_PAD
                .decode(&self.k)
                .map_err(|e| Error::InvalidKeyMaterial(format!("Invalid key encoding: {}", e)))?,
        );

        bytes.as_slice().try_into().map_err(|_| {
            Error::InvalidKeyMaterial(format!(
                "Key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            ))
        })
    }
}

impl std::fmt::Debug for SymmetricJwk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricJwk")
            .field("kty", &self.kty)
            .field("alg", &self.alg)
            .finish_non_exhaustive()
    }
}

/// Derive the archive key bundle
pub fn derive_bundle(password: &str, salt: &[u8]) -> Result<PasswordKeyBundle> {
    PasswordKeyBundle::derive(password, salt)
}

/// Serialize a bundle to JSON
pub fn serialize_bundle(bundle: &PasswordKeyBundle) -> Result<String> {
    Ok(serde_json::to_string(&bundle.to_portable())?)
}

/// Parse a bundle from JSON
///
/// Anything that does not parse into two valid keys is `InvalidKeyMaterial`.
pub fn deserialize_bundle(json: &str) -> Result<PasswordKeyBundle> {
    let portable: PortableBundle = serde_json::from_str(json)
        .map_err(|e| Error::InvalidKeyMaterial(format!("Unreadable bundle: {}", e)))?;
    PasswordKeyBundle::from_portable(&portable)
}

/// Generate a fresh per-user salt, base64 encoded
///
/// Salts are assigned once at registration and stored alongside the
/// account; they are not secret.
pub fn generate_salt() -> String {
    let mut bytes = [0u8; SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let a = derive_bundle("correct horse", b"salt-1").unwrap();
        let b = derive_bundle("correct horse", b"salt-1").unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn test_different_inputs_give_different_bundles() {
        let base = derive_bundle("correct horse", b"salt-1").unwrap();
        let other_password = derive_bundle("battery staple", b"salt-1").unwrap();
        let other_salt = derive_bundle("correct horse", b"salt-2").unwrap();

        assert_ne!(base, other_password);
        assert_ne!(base, other_salt);
    }

    #[test]
    fn test_keys_are_independent() {
        let bundle = derive_bundle("pw", b"salt").unwrap();
        assert_ne!(
            bundle.encryption_key().as_bytes(),
            bundle.authentication_key()
        );
    }

    #[test]
    fn test_matches_reference_pbkdf2() {
        let bundle = derive_bundle("pw", b"salt").unwrap();

        let mut expected = [0u8; KEY_SIZE];
        pbkdf2::pbkdf2::<Hmac<Sha256>>(b"pwsalt", &domain::ENCRYPTION_KEY, 100_000, &mut expected)
            .unwrap();

        assert_eq!(bundle.encryption_key().as_bytes(), &expected);
    }

    #[test]
    fn test_serialize_round_trip() {
        let bundle = PasswordKeyBundle::from_keys([7u8; 32], [9u8; 32]);
        let json = serialize_bundle(&bundle).unwrap();

        assert!(json.contains("encryptionKey"));
        assert!(json.contains("hmacKey"));
        assert_eq!(deserialize_bundle(&json).unwrap(), bundle);
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        assert!(matches!(
            deserialize_bundle("{not json"),
            Err(Error::InvalidKeyMaterial(_))
        ));
    }

    #[test]
    fn test_deserialize_rejects_short_key() {
        let bundle = PasswordKeyBundle::from_keys([7u8; 32], [9u8; 32]);
        let mut portable = bundle.to_portable();
        portable.hmac_key.k = URL_SAFE_NO_PAD.encode([1u8; 16]);

        assert!(matches!(
            PasswordKeyBundle::from_portable(&portable),
            Err(Error::InvalidKeyMaterial(_))
        ));
    }

    #[test]
    fn test_deserialize_rejects_swapped_keys() {
        let bundle = PasswordKeyBundle::from_keys([7u8; 32], [9u8; 32]);
        let mut portable = bundle.to_portable();
        std::mem::swap(&mut portable.encryption_key, &mut portable.hmac_key);

        assert!(PasswordKeyBundle::from_portable(&portable).is_err());
    }

    #[test]
    fn test_debug_is_redacted() {
        let bundle = PasswordKeyBundle::from_keys([7u8; 32], [9u8; 32]);
        assert_eq!(format!("{:?}", bundle), "PasswordKeyBundle([REDACTED])");
    }

    #[test]
    fn test_generated_salts_differ() {
        assert_ne!(generate_salt(), generate_salt());
    }
}

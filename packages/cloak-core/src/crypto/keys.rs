//! # Key Management
//!
//! Per-session asymmetric keys used for the live key exchange.
//!
//! ## Key Types
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          KEY TYPES                                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  AsymmetricKeyPair (RSA-2048, OAEP + SHA-256)                   │   │
//! │  │  ─────────────────────────────────────────────                   │   │
//! │  │                                                                  │   │
//! │  │  Purpose:                                                       │   │
//! │  │  • Receiving live messages (peers encrypt to our public key)   │   │
//! │  │  • Receiving the one-time authentication key of each message   │   │
//! │  │                                                                  │   │
//! │  │  Lifetime:                                                      │   │
//! │  │  • Generated once per login, never persisted                   │   │
//! │  │  • Private half never leaves the process, never exported       │   │
//! │  │                                                                  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  PortableKey (JWK)                                              │   │
//! │  │  ──────────────────                                              │   │
//! │  │                                                                  │   │
//! │  │  { "kty": "RSA", "alg": "RSA-OAEP-256",                         │   │
//! │  │    "n": base64url(modulus), "e": base64url(exponent),           │   │
//! │  │    "ext": true, "key_ops": ["encrypt"] }                        │   │
//! │  │                                                                  │   │
//! │  │  Carried in REQUEST_TO_SEND_PUBLIC_KEY and                      │   │
//! │  │  ACCEPTED_REQUEST_FOR_PUBLIC_KEY frames.                        │   │
//! │  │                                                                  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::rngs::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Modulus size of every key this crate generates or accepts
pub const RSA_MODULUS_BITS: usize = 2048;

/// JWK `kty` for RSA keys
pub const JWK_KEY_TYPE: &str = "RSA";

/// JWK `alg` for RSA-OAEP with SHA-256
pub const JWK_ALGORITHM: &str = "RSA-OAEP-256";

/// Per-session RSA key pair
///
/// ## Security
///
/// - The private key is zeroized on drop (handled by `rsa`)
/// - There is no method that serializes the private key
/// - `Debug` prints only the public fingerprint
pub struct AsymmetricKeyPair {
    private: RsaPrivateKey,
    public: PeerPublicKey,
}

impl AsymmetricKeyPair {
    /// Generate a new random key pair
    ///
    /// Uses the operating system's secure random number generator.
    /// Failure here is fatal for the session.
    pub fn generate() -> Result<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, RSA_MODULUS_BITS)
            .map_err(|e| Error::KeyGenerationFailure(e.to_string()))?;
        let public = PeerPublicKey(private.to_public_key());

        tracing::debug!("Generated session key pair {}", public.fingerprint());

        Ok(Self { private, public })
    }

    /// Get the public half
    pub fn public_key(&self) -> &PeerPublicKey {
        &self.public
    }

    /// Export the public half in portable form
    pub fn export_public_key(&self) -> PortableKey {
        self.public.export()
    }

    /// Get reference to the private key
    pub(crate) fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }
}

impl std::fmt::Debug for AsymmetricKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsymmetricKeyPair")
            .field("public", &self.public.fingerprint())
            .finish_non_exhaustive()
    }
}

/// A peer's RSA public key, validated for the OAEP-256 scheme
#[derive(Clone, PartialEq, Eq)]
pub struct PeerPublicKey(RsaPublicKey);

impl PeerPublicKey {
    /// Serialize to a JWK (public component only)
    pub fn export(&self) -> PortableKey {
        PortableKey {
            kty: JWK_KEY_TYPE.to_string(),
            n: URL_SAFE_NO_PAD.encode(self.0.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(self.0.e().to_bytes_be()),
            alg: Some(JWK_ALGORITHM.to_string()),
            ext: Some(true),
            key_ops: Some(vec!["encrypt".to_string()]),
        }
    }

    /// Parse and validate a JWK
    ///
    /// ## Errors
    ///
    /// Returns `MalformedKey` if:
    /// - `kty` is not `RSA`
    /// - `alg` is present and is not `RSA-OAEP-256`
    /// - `key_ops` is present and does not allow `encrypt`
    /// - `n` or `e` is not valid base64url
    /// - the modulus is not 2048 bits or the exponent is rejected
    pub fn import(portable: &PortableKey) -> Result<Self> {
        if portable.kty != JWK_KEY_TYPE {
            return Err(Error::MalformedKey(format!(
                "Unsupported key type: {}",
                portable.kty
            )));
        }

        if let Some(alg) = &portable.alg {
            if alg != JWK_ALGORITHM {
                return Err(Error::MalformedKey(format!(
                    "Unsupported algorithm: {} (expected {})",
                    alg, JWK_ALGORITHM
                )));
            }
        }

        if let Some(ops) = &portable.key_ops {
            if !ops.iter().any(|op| op == "encrypt") {
                return Err(Error::MalformedKey("Key is not usable for encryption".into()));
            }
        }

        let n = URL_SAFE_NO_PAD
            .decode(&portable.n)
            .map_err(|e| Error::MalformedKey(format!("Invalid modulus encoding: {}", e)))?;
        let e = URL_SAFE_NO_PAD
            .decode(&portable.e)
            .map_err(|e| Error::MalformedKey(format!("Invalid exponent encoding: {}", e)))?;

        let n = BigUint::from_bytes_be(&n);
        if n.bits() != RSA_MODULUS_BITS {
            return Err(Error::MalformedKey(format!(
                "Modulus must be {} bits, got {}",
                RSA_MODULUS_BITS,
                n.bits()
            )));
        }

        let key = RsaPublicKey::new(n, BigUint::from_bytes_be(&e))
            .map_err(|e| Error::MalformedKey(format!("Invalid RSA parameters: {}", e)))?;

        Ok(Self(key))
    }

    /// Short fingerprint for logs: first 8 bytes of SHA-256(n || e), hex
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.n().to_bytes_be());
        hasher.update(self.0.e().to_bytes_be());
        hex::encode(&hasher.finalize()[..8])
    }

    /// Get reference to the RSA key
    pub(crate) fn as_rsa(&self) -> &RsaPublicKey {
        &self.0
    }
}

impl std::fmt::Debug for PeerPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerPublicKey({})", self.fingerprint())
    }
}

/// Portable (JWK) encoding of a public key
///
/// This contains only public information and can be serialized,
/// transmitted, and stored without security concerns. Unknown JWK members
/// are ignored on import.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortableKey {
    /// Key type, always `RSA`
    pub kty: String,
    /// Modulus, base64url without padding
    pub n: String,
    /// Public exponent, base64url without padding
    pub e: String,
    /// Algorithm, `RSA-OAEP-256`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    /// Extractable flag (WebCrypto compatibility)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<bool>,
    /// Permitted operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_ops: Option<Vec<String>>,
}

/// Generate the per-session key pair
pub fn generate_key_pair() -> Result<AsymmetricKeyPair> {
    AsymmetricKeyPair::generate()
}

/// Export a public key to its portable form
pub fn export_public_key(key: &PeerPublicKey) -> PortableKey {
    key.export()
}

/// Import a peer's public key from its portable form
pub fn import_public_key(portable: &PortableKey) -> Result<PeerPublicKey> {
    PeerPublicKey::import(portable)
}

// ============================================================================
// TESTS
// ============================================================================

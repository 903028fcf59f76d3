//! # Cryptography Module
//!
//! All cryptographic primitives used by Cloak Core.
//!
//! ## Security Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    CRYPTOGRAPHIC ARCHITECTURE                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  LIVE PATH (peer ↔ peer, per session)                          │   │
//! │  ├─────────────────────────────────────────────────────────────────┤   │
//! │  │                                                                 │   │
//! │  │  AsymmetricKeyPair  RSA-2048, generated at login, never stored │   │
//! │  │          │                                                      │   │
//! │  │          ▼  public half exchanged in the key handshake         │   │
//! │  │  encrypt_for_peer   RSA-OAEP-SHA256 + one-time HMAC-SHA256 key │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  ARCHIVE PATH (user ↔ own history, across sessions)            │   │
//! │  ├─────────────────────────────────────────────────────────────────┤   │
//! │  │                                                                 │   │
//! │  │  password + salt                                               │   │
//! │  │          │  PBKDF2-HMAC-SHA256, 100 000 rounds, two domains    │   │
//! │  │          ▼                                                      │   │
//! │  │  PasswordKeyBundle  (AES-256-GCM key, HMAC-SHA256 key)         │   │
//! │  │          │                                                      │   │
//! │  │          ▼                                                      │   │
//! │  │  seal / open        AES-256-GCM then HMAC over the ciphertext  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Algorithm Choices
//!
//! | Algorithm | Purpose | Notes |
//! |-----------|---------|-------|
//! | RSA-OAEP-SHA256 (2048) | Live messages, auth key transport | 190-byte payload limit |
//! | HMAC-SHA256 | Live and archive integrity | Constant-time verify |
//! | AES-256-GCM | Archive confidentiality | 96-bit random nonce |
//! | PBKDF2-HMAC-SHA256 | Password → bundle | 100 000 rounds |
//!
//! ## Security Considerations
//!
//! 1. **Key Zeroization**: private keys, bundles and one-time keys are
//!    zeroized when dropped
//! 2. **Secure Random**: `rand::rngs::OsRng` everywhere
//! 3. **No silent failure**: every decrypt/verify failure is an error,
//!    never empty plaintext

mod archive;
mod encryption;
mod kdf;
mod keys;
mod live;
mod mac;

pub use archive::{open, seal, ArchiveEncryptedRecord, StoredRecord, ARCHIVE_IV_SIZE};
pub use encryption::{decrypt, encrypt, EncryptionKey, Nonce, KEY_SIZE, NONCE_SIZE};
pub use kdf::{
    derive_bundle, deserialize_bundle, generate_salt, serialize_bundle, PasswordKeyBundle,
    PortableBundle, SymmetricJwk, PBKDF2_ITERATIONS,
};
pub use keys::{
    export_public_key, generate_key_pair, import_public_key, AsymmetricKeyPair, PeerPublicKey,
    PortableKey, RSA_MODULUS_BITS,
};
pub use live::{decrypt_from_peer, encrypt_for_peer, LiveEncryptedEnvelope, MAX_LIVE_PAYLOAD};
pub use mac::{hmac_sha256, verify_hmac_sha256};

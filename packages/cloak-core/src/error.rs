//! # Error Handling
//!
//! This module provides the error types for Cloak Core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Session Errors (100)                                              │
//! │  │   ├── SessionClosed         - Session actor has stopped             │
//! │  │   └── InvalidConfig         - Configuration could not be parsed     │
//! │  │                                                                      │
//! │  ├── Key Errors (200)                                                  │
//! │  │   ├── KeyGenerationFailure  - RNG / provider failure (FATAL)        │
//! │  │   ├── MalformedKey          - Peer public key unusable              │
//! │  │   ├── InvalidKeyMaterial    - Stored bundle unusable                │
//! │  │   └── KeyDerivationFailed   - Password KDF failed                   │
//! │  │                                                                      │
//! │  ├── Crypto Errors (300)                                               │
//! │  │   ├── EncryptionFailed      - Encryption operation failed           │
//! │  │   ├── DecryptionFailed      - Key/ciphertext mismatch, GCM failure  │
//! │  │   ├── IntegrityCheckFailed  - HMAC tag mismatch                     │
//! │  │   └── PayloadTooLarge       - Does not fit one RSA-OAEP block       │
//! │  │                                                                      │
//! │  ├── Storage Errors (400)                                              │
//! │  │   ├── StorageReadError / StorageWriteError                          │
//! │  │   └── MalformedRecord       - Archived record cannot be decoded     │
//! │  │                                                                      │
//! │  ├── Channel Errors (500)                                              │
//! │  │   ├── NotConnected          - Channel is gone                       │
//! │  │   └── ProtocolError         - Frame of a known type is malformed    │
//! │  │                                                                      │
//! │  ├── Handshake Errors (600)                                            │
//! │  │   ├── NotSecured            - Send attempted before Established     │
//! │  │   └── NoActiveConversation  - Nothing open to act on                │
//! │  │                                                                      │
//! │  └── Message Errors (700)                                              │
//! │      ├── StaleResult           - Peer trust changed mid-operation      │
//! │      └── InvalidMessageContent - Verified bytes are not text           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Propagation Policy
//!
//! Cryptographic failures are never turned into empty or default plaintext.
//! Per-message failures (`DecryptionFailed`, `IntegrityCheckFailed`) are
//! recoverable: the message is dropped and the session carries on.
//! `KeyGenerationFailure` is the only fatal error; without a key pair no
//! session can exist.

use thiserror::Error;

/// Result type alias for Cloak Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Cloak Core
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Session Errors (100-199)
    // ========================================================================

    /// The session actor is no longer running
    #[error("Session is closed.")]
    SessionClosed,

    /// Configuration could not be parsed
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ========================================================================
    // Key Errors (200-299)
    // ========================================================================

    /// Key pair generation failed (RNG or crypto provider failure)
    #[error("Failed to generate key pair: {0}")]
    KeyGenerationFailure(String),

    /// A peer public key is badly encoded or has the wrong parameters
    #[error("Malformed public key: {0}")]
    MalformedKey(String),

    /// Stored symmetric key material is unusable
    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// Password key derivation failed
    #[error("Failed to derive keys: {0}")]
    KeyDerivationFailed(String),

    // ========================================================================
    // Crypto Errors (300-399)
    // ========================================================================

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Authentication tag did not match
    #[error("Integrity check failed: message may have been tampered with")]
    IntegrityCheckFailed,

    /// Payload exceeds what a single RSA-OAEP block can carry
    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge {
        /// Size of the rejected payload
        len: usize,
        /// Largest payload accepted
        max: usize,
    },

    // ========================================================================
    // Storage Errors (400-499)
    // ========================================================================

    /// Failed to read from storage
    #[error("Failed to read from storage: {0}")]
    StorageReadError(String),

    /// Failed to write to storage
    #[error("Failed to write to storage: {0}")]
    StorageWriteError(String),

    /// An archived record could not be decoded
    #[error("Malformed archive record: {0}")]
    MalformedRecord(String),

    // ========================================================================
    // Channel Errors (500-599)
    // ========================================================================

    /// The real-time channel is not available
    #[error("Not connected to the channel.")]
    NotConnected,

    /// A frame of a known type could not be decoded
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    // ========================================================================
    // Handshake Errors (600-699)
    // ========================================================================

    /// The conversation with this peer is not yet secured
    #[error("Conversation with user {0} is not yet secured.")]
    NotSecured(u64),

    /// No conversation is open
    #[error("No conversation is open.")]
    NoActiveConversation,

    // ========================================================================
    // Message Errors (700-799)
    // ========================================================================

    /// Trust for the peer changed while an operation was in flight
    #[error("Result discarded: trust state for user {0} changed")]
    StaleResult(u64),

    /// Verified plaintext is not valid message content
    #[error("Invalid message content: {0}")]
    InvalidMessageContent(String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl Error {
    /// Get the numeric error code
    ///
    /// Error codes are organized by category:
    /// - 100-199: Session
    /// - 200-299: Keys
    /// - 300-399: Crypto
    /// - 400-499: Storage
    /// - 500-599: Channel
    /// - 600-699: Handshake
    /// - 700-799: Messages
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            // Session (100-199)
            Error::SessionClosed => 100,
            Error::InvalidConfig(_) => 101,

            // Keys (200-299)
            Error::KeyGenerationFailure(_) => 200,
            Error::MalformedKey(_) => 201,
            Error::InvalidKeyMaterial(_) => 202,
            Error::KeyDerivationFailed(_) => 203,

            // Crypto (300-399)
            Error::EncryptionFailed(_) => 300,
            Error::DecryptionFailed(_) => 301,
            Error::IntegrityCheckFailed => 302,
            Error::PayloadTooLarge { .. } => 303,

            // Storage (400-499)
            Error::StorageReadError(_) => 400,
            Error::StorageWriteError(_) => 401,
            Error::MalformedRecord(_) => 402,

            // Channel (500-599)
            Error::NotConnected => 500,
            Error::ProtocolError(_) => 501,

            // Handshake (600-699)
            Error::NotSecured(_) => 600,
            Error::NoActiveConversation => 601,

            // Messages (700-799)
            Error::StaleResult(_) => 700,
            Error::InvalidMessageContent(_) => 701,

            // Internal (900-999)
            Error::Internal(_) => 900,
            Error::SerializationError(_) => 901,
        }
    }

    /// Check if this error ends the session
    ///
    /// Only key generation failure is fatal: without a key pair there is
    /// nothing to exchange.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::KeyGenerationFailure(_))
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors affect a single message, a single peer or a
    /// single stored item. The session keeps running; the caller decides
    /// whether to tell the user. None of them are retried automatically.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MalformedKey(_)
                | Error::InvalidKeyMaterial(_)
                | Error::DecryptionFailed(_)
                | Error::IntegrityCheckFailed
                | Error::NotSecured(_)
                | Error::StaleResult(_)
                | Error::MalformedRecord(_)
                | Error::ProtocolError(_)
                | Error::PayloadTooLarge { .. }
        )
    }

    /// Check if this error means a message failed verification
    ///
    /// Such messages must never be displayed as if they were verified.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Error::DecryptionFailed(_) | Error::IntegrityCheckFailed
        )
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Error::MalformedRecord(format!("Invalid base64: {}", err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::StorageReadError(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::SessionClosed.code(), 100);
        assert_eq!(Error::KeyGenerationFailure("rng".into()).code(), 200);
        assert_eq!(Error::IntegrityCheckFailed.code(), 302);
        assert_eq!(Error::MalformedRecord("x".into()).code(), 402);
        assert_eq!(Error::NotConnected.code(), 500);
        assert_eq!(Error::NotSecured(7).code(), 600);
        assert_eq!(Error::StaleResult(7).code(), 700);
        assert_eq!(Error::Internal("test".into()).code(), 900);
    }

    #[test]
    fn test_fatal_and_recoverable() {
        let keygen = Error::KeyGenerationFailure("no entropy".into());
        assert!(keygen.is_fatal());
        assert!(!keygen.is_recoverable());

        assert!(Error::IntegrityCheckFailed.is_recoverable());
        assert!(Error::DecryptionFailed("bad".into()).is_recoverable());
        assert!(Error::MalformedKey("bad".into()).is_recoverable());
        assert!(!Error::IntegrityCheckFailed.is_fatal());
    }

    #[test]
    fn test_integrity_classification() {
        assert!(Error::IntegrityCheckFailed.is_integrity_failure());
        assert!(Error::DecryptionFailed("x".into()).is_integrity_failure());
        assert!(!Error::NotSecured(1).is_integrity_failure());
    }

    #[test]
    fn test_not_secured_message() {
        let err = Error::NotSecured(42);
        assert!(err.to_string().contains("not yet secured"));
        assert!(err.to_string().contains("42"));
    }
}

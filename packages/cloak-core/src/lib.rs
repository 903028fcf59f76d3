//! # Cloak Core
//!
//! End-to-end protection for one-to-one chat running over a relay channel.
//! Keys are exchanged per conversation, live messages are encrypted for
//! the peer, and each participant keeps a password-protected copy of the
//! conversation.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         CLOAK CORE MODULES                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐                  │
//! │  │   Session    │  │  Handshake   │  │   Protocol   │                  │
//! │  │              │  │              │  │              │                  │
//! │  │ - Login      │  │ - Key req.   │  │ - Frames     │                  │
//! │  │ - Key pair   │  │ - Accept     │  │ - JSON wire  │                  │
//! │  │ - Bundle     │  │ - Revoke     │  │   format     │                  │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘                  │
//! │         └─────────────────┼─────────────────┘                          │
//! │                           ▼                                             │
//! │                  ┌─────────────────┐                                    │
//! │                  │     Client      │  SessionHandle + event loop        │
//! │                  └────────┬────────┘                                    │
//! │         ┌─────────────────┼─────────────────┐                          │
//! │         ▼                 ▼                 ▼                           │
//! │  ┌─────────────┐  ┌──────────────┐  ┌──────────────┐                   │
//! │  │   Crypto    │  │   Storage    │  │   Channel    │                   │
//! │  │             │  │              │  │              │                   │
//! │  │ - RSA-OAEP  │  │ - Archive    │  │ - Text frame │                   │
//! │  │ - AES-GCM   │  │ - Bundle     │  │   queues     │                   │
//! │  │ - HMAC      │  │   store      │  │ - Relay      │                   │
//! │  │ - PBKDF2    │  │              │  │              │                   │
//! │  └─────────────┘  └──────────────┘  └──────────────┘                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`crypto`] - Key exchange, live and archive encryption, KDF
//! - [`protocol`] - Channel frame format
//! - [`handshake`] - Per-peer key exchange state machine
//! - [`session`] - Logged-in user's keys and trust table
//! - [`storage`] - Message archive and bundle store
//! - [`channel`] - Real-time channel abstraction and in-memory relay
//! - [`client`] - Session actor and its handle
//! - [`config`] - Runtime configuration
//!
//! ## Security Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SECURITY LAYERS                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Layer 1: Per-Session Key Exchange (RSA-2048)                          │
//! │  ─────────────────────────────────────────────                          │
//! │  A fresh key pair is generated at every login. Public keys travel      │
//! │  over the channel and are only trusted while both sides have the       │
//! │  conversation open. The private key never leaves memory.               │
//! │                                                                         │
//! │  Layer 2: Live Message Encryption (RSA-OAEP-256 + HMAC-SHA256)         │
//! │  ──────────────────────────────────────────────────────────            │
//! │  Each message is encrypted for the peer, and tagged with a one-time    │
//! │  HMAC key that is itself encrypted for the peer.                       │
//! │                                                                         │
//! │  Layer 3: Archive Encryption (AES-256-GCM + HMAC-SHA256)               │
//! │  ────────────────────────────────────────────────────                   │
//! │  Each side keeps its own copy, sealed under keys derived from the      │
//! │  user's password with PBKDF2. Tampered records are reported, never     │
//! │  displayed.                                                            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod channel;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod session;
pub mod storage;
/// Clock helpers.
pub mod time;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use channel::{ChannelEndpoint, MemoryRelay};
pub use client::{HistoryEntry, ReceivedMessage, SentMessage, SessionEvent, SessionHandle};
pub use config::CoreConfig;
pub use crypto::{AsymmetricKeyPair, PasswordKeyBundle, PeerPublicKey, PortableKey};
pub use error::{Error, Result};
pub use handshake::HandshakeState;
pub use protocol::{ChannelMessage, UserId};
pub use session::Session;
pub use storage::{BundleStore, MemoryArchive, MessageArchive};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of Cloak Core
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Returns build information for debugging
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: env!("CARGO_PKG_VERSION"),
        profile: if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        },
    }
}

/// Build information for debugging
#[derive(Debug, Clone)]
pub struct BuildInfo {
    /// Crate version
    pub version: &'static str,
    /// Build profile (debug/release)
    pub profile: &'static str,
}

// ============================================================================
// TESTS
// ============================================================================

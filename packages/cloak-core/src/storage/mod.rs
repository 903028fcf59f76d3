//! # Storage Module
//!
//! Where sealed messages and key bundles live between sessions.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         STORAGE SYSTEM                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  MessageArchive (server side)                                   │   │
//! │  │  ────────────────────────────                                    │   │
//! │  │                                                                 │   │
//! │  │  store(storer, sender, receiver, record) → { id, sent_at }     │   │
//! │  │  retrieve(user, friend) → records stored by `user`             │   │
//! │  │                                                                 │   │
//! │  │  Only ever sees ArchiveEncryptedRecords in base64 form. Each   │   │
//! │  │  participant stores their own copy under their own bundle.     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  BundleStore (client side)                                      │   │
//! │  │  ─────────────────────────                                       │   │
//! │  │                                                                 │   │
//! │  │  Keeps the password-derived bundle across reloads, with an     │   │
//! │  │  expiry, optionally wrapped with a device key.                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod bundle_store;
mod memory;

pub use bundle_store::BundleStore;
pub use memory::MemoryArchive;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::StoredRecord;
use crate::error::Result;
use crate::protocol::UserId;

/// What the archive hands back after a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredReceipt {
    /// Assigned message id
    pub id: u64,
    /// Assigned timestamp
    pub sent_at: DateTime<Utc>,
}

/// One row of a user's archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedMessage {
    /// Message id
    pub id: u64,
    /// Who wrote the message
    pub sender_id: UserId,
    /// Who it was written to
    pub receiver_id: UserId,
    /// When it was stored
    pub sent_at: DateTime<Utc>,
    /// Sealed content
    pub record: StoredRecord,
}

/// Server-side message archive
///
/// Implementations never see plaintext or keys.
#[async_trait]
pub trait MessageArchive: Send + Sync {
    /// Store a sealed record in `storer`'s archive
    async fn store(
        &self,
        storer: UserId,
        sender: UserId,
        receiver: UserId,
        record: StoredRecord,
    ) -> Result<StoredReceipt>;

    /// All records `user` stored for their conversation with `friend`,
    /// oldest first
    async fn retrieve(&self, user: UserId, friend: UserId) -> Result<Vec<ArchivedMessage>>;
}

//! In-memory [`MessageArchive`] for tests and the demo.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{ArchivedMessage, MessageArchive, StoredReceipt};
use crate::crypto::StoredRecord;
use crate::error::Result;
use crate::protocol::UserId;

/// Archive that keeps every user's records in a map
///
/// Ids are assigned from one counter shared by all users, starting at 1.
#[derive(Debug, Default)]
pub struct MemoryArchive {
    rows: RwLock<HashMap<UserId, Vec<ArchivedMessage>>>,
    next_id: AtomicU64,
}

impl MemoryArchive {
    /// Create an empty archive
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records `user` has stored
    pub fn len_for(&self, user: UserId) -> usize {
        self.rows.read().get(&user).map(Vec::len).unwrap_or(0)
    }

    /// Replace a stored record in place
    ///
    /// Lets tests simulate corruption at rest. Returns `false` if no such
    /// record exists.
    pub fn overwrite(&self, user: UserId, id: u64, record: StoredRecord) -> bool {
        let mut rows = self.rows.write();
        match rows
            .get_mut(&user)
            .and_then(|r| r.iter_mut().find(|m| m.id == id))
        {
            Some(row) => {
                row.record = record;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl MessageArchive for MemoryArchive {
    async fn store(
        &self,
        storer: UserId,
        sender: UserId,
        receiver: UserId,
        record: StoredRecord,
    ) -> Result<StoredReceipt> {
        let receipt = StoredReceipt {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            sent_at: crate::time::now(),
        };

        self.rows
            .write()
            .entry(storer)
            .or_default()
            .push(ArchivedMessage {
                id: receipt.id,
                sender_id: sender,
                receiver_id: receiver,
                sent_at: receipt.sent_at,
                record,
            });

        tracing::trace!("Archived message {} for user {}", receipt.id, storer);
        Ok(receipt)
    }

    async fn retrieve(&self, user: UserId, friend: UserId) -> Result<Vec<ArchivedMessage>> {
        let rows = self.rows.read();
        Ok(rows
            .get(&user)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| {
                        (m.sender_id == user && m.receiver_id == friend)
                            || (m.sender_id == friend && m.receiver_id == user)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

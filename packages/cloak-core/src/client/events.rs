//! # Session Events
//!
//! Notifications the session actor broadcasts to the UI, plus the result
//! types its commands return.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::UserId;

/// A message that arrived and passed verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceivedMessage {
    /// Sender's archive id for the message
    pub id: u64,
    /// Who sent it
    pub sender: UserId,
    /// Who it was for (us)
    pub receiver: UserId,
    /// Sender's timestamp
    pub sent_at: DateTime<Utc>,
    /// Verified text
    pub text: String,
}

/// Outcome of a successful send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SentMessage {
    /// Archive id of our copy
    pub id: u64,
    /// Archive timestamp of our copy
    pub sent_at: DateTime<Utc>,
}

/// One row of conversation history
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HistoryEntry {
    /// Record opened and verified
    Verified {
        /// Archive id
        id: u64,
        /// Author
        sender: UserId,
        /// Addressee
        receiver: UserId,
        /// Archive timestamp
        sent_at: DateTime<Utc>,
        /// Verified text
        text: String,
    },
    /// Record could not be opened; its content is never shown
    Unreadable {
        /// Archive id
        id: u64,
        /// Author
        sender: UserId,
        /// Archive timestamp
        sent_at: DateTime<Utc>,
        /// Error code of the failure
        code: i32,
        /// Error description
        reason: String,
    },
}

impl HistoryEntry {
    /// The verified text, if any
    pub fn text(&self) -> Option<&str> {
        match self {
            HistoryEntry::Verified { text, .. } => Some(text),
            HistoryEntry::Unreadable { .. } => None,
        }
    }

    /// Archive id
    pub fn id(&self) -> u64 {
        match self {
            HistoryEntry::Verified { id, .. } | HistoryEntry::Unreadable { id, .. } => *id,
        }
    }
}

/// Events emitted by the session actor
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Sending to `peer` is now allowed
    PeerEstablished {
        /// The trusted peer
        peer: UserId,
    },

    /// `peer` answered our request without having our conversation open
    PeerDeclined {
        /// The declining peer
        peer: UserId,
    },

    /// Trust in `peer` was withdrawn (by them, by us, or by teardown)
    PeerRevoked {
        /// The peer no longer trusted
        peer: UserId,
    },

    /// A verified message arrived
    MessageReceived(ReceivedMessage),

    /// An inbound message was dropped
    MessageRejected {
        /// Claimed sender
        sender: UserId,
        /// Sender's message id, when the frame carried one
        message_id: Option<u64>,
        /// Error code
        code: i32,
        /// Error description
        reason: String,
    },

    /// The channel closed; all trust has been cleared
    ChannelClosed,
}

impl SessionEvent {
    /// Peer this event concerns, if any
    pub fn peer(&self) -> Option<UserId> {
        match self {
            Self::PeerEstablished { peer }
            | Self::PeerDeclined { peer }
            | Self::PeerRevoked { peer } => Some(*peer),
            Self::MessageReceived(m) => Some(m.sender),
            Self::MessageRejected { sender, .. } => Some(*sender),
            Self::ChannelClosed => None,
        }
    }

    /// Whether this is a trust change
    pub fn is_trust_event(&self) -> bool {
        matches!(
            self,
            Self::PeerEstablished { .. } | Self::PeerDeclined { .. } | Self::PeerRevoked { .. }
        )
    }
}

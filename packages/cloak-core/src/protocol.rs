//! # Channel Protocol
//!
//! JSON frames exchanged over the real-time channel.
//!
//! Every frame is `{ "type": "...", "data": { ... } }`. The core owns five
//! frame types; anything else on the channel belongs to other features and
//! is passed over.
//!
//! ```text
//! ┌──────────────────────────────────┬──────────────────────────────────────┐
//! │ type                             │ data                                 │
//! ├──────────────────────────────────┼──────────────────────────────────────┤
//! │ REQUEST_TO_SEND_PUBLIC_KEY       │ senderID, receiverID,                │
//! │                                  │ publicKeyExport                      │
//! │ ACCEPTED_REQUEST_FOR_PUBLIC_KEY  │ senderID, receiverID,                │
//! │                                  │ publicKeyExport, inChatRoom          │
//! │ REQUEST_TO_DELETE_PUBLIC_KEY     │ senderID, receiverID                 │
//! │ MESSAGE_TRANSFER                 │ id, ciphertext, encryptedAuthKey,    │
//! │                                  │ authTag, sender, receiver, sentAt    │
//! │ PACKET_DISCONNECT                │ senderID, receiverID?, friends?      │
//! └──────────────────────────────────┴──────────────────────────────────────┘
//! ```
//!
//! Binary fields of `MESSAGE_TRANSFER` are standard base64.
//!
//! `PACKET_DISCONNECT` is sent by a client as its channel goes away and
//! fanned out by the server to the sender's friends; `receiverID` is only
//! present once the server has addressed it.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{LiveEncryptedEnvelope, PortableKey};
use crate::error::{Error, Result};

/// Numeric account identifier assigned by the server
pub type UserId = u64;

/// Frame types on the shared channel that belong to other features
pub const FOREIGN_FRAME_TYPES: &[&str] = &[
    "CHECK_ONLINE",
    "GROUP_MESSAGE_TRANSFER",
    "COMMENT_TRANSFER",
    "MUTED",
    "UNMUTED",
];

const OWNED_FRAME_TYPES: &[&str] = &[
    "REQUEST_TO_SEND_PUBLIC_KEY",
    "ACCEPTED_REQUEST_FOR_PUBLIC_KEY",
    "REQUEST_TO_DELETE_PUBLIC_KEY",
    "MESSAGE_TRANSFER",
    "PACKET_DISCONNECT",
];

/// A frame owned by the core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelMessage {
    /// Initiator sends its public key and asks for the peer's
    RequestToSendPublicKey(KeyRequest),

    /// Responder sends its public key back
    AcceptedRequestForPublicKey(KeyAcceptance),

    /// Sender has discarded the conversation; the peer should discard
    /// the sender's key
    RequestToDeletePublicKey(KeyDeletion),

    /// A live encrypted message
    MessageTransfer(MessageTransfer),

    /// Sender's channel went away; its key must not be used any more
    PacketDisconnect(PeerDisconnect),
}

/// `REQUEST_TO_SEND_PUBLIC_KEY` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRequest {
    /// Who sent the frame
    #[serde(rename = "senderID")]
    pub sender_id: UserId,
    /// Who the frame is for
    #[serde(rename = "receiverID")]
    pub receiver_id: UserId,
    /// Sender's session public key
    #[serde(rename = "publicKeyExport")]
    pub public_key_export: PortableKey,
}

/// `ACCEPTED_REQUEST_FOR_PUBLIC_KEY` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyAcceptance {
    /// Who sent the frame
    #[serde(rename = "senderID")]
    pub sender_id: UserId,
    /// Who the frame is for
    #[serde(rename = "receiverID")]
    pub receiver_id: UserId,
    /// Sender's session public key
    #[serde(rename = "publicKeyExport")]
    pub public_key_export: PortableKey,
    /// Whether the responder has the requester's conversation open
    #[serde(rename = "inChatRoom")]
    pub in_chat_room: bool,
}

/// `REQUEST_TO_DELETE_PUBLIC_KEY` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyDeletion {
    /// Who sent the frame
    #[serde(rename = "senderID")]
    pub sender_id: UserId,
    /// Who the frame is for
    #[serde(rename = "receiverID")]
    pub receiver_id: UserId,
}

/// `PACKET_DISCONNECT` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerDisconnect {
    /// The user who disconnected
    #[serde(rename = "senderID")]
    pub sender_id: UserId,
    /// Who the server delivered the frame to, when addressed
    #[serde(rename = "receiverID", default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    /// Sender's friend list, used by the server for fan-out
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub friends: Vec<serde_json::Value>,
}

/// `MESSAGE_TRANSFER` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageTransfer {
    /// Archive id assigned when the sender stored its copy
    pub id: u64,
    /// Base64 RSA-OAEP ciphertext
    pub ciphertext: String,
    /// Base64 RSA-OAEP ciphertext of the one-time HMAC key
    #[serde(rename = "encryptedAuthKey")]
    pub encrypted_auth_key: String,
    /// Base64 HMAC-SHA256 tag
    #[serde(rename = "authTag")]
    pub auth_tag: String,
    /// Sending user
    pub sender: UserId,
    /// Receiving user
    pub receiver: UserId,
    /// Archive timestamp of the sender's copy
    #[serde(rename = "sentAt")]
    pub sent_at: DateTime<Utc>,
}

impl MessageTransfer {
    /// Wrap an envelope for the wire
    pub fn new(
        id: u64,
        sender: UserId,
        receiver: UserId,
        sent_at: DateTime<Utc>,
        envelope: &LiveEncryptedEnvelope,
    ) -> Self {
        Self {
            id,
            ciphertext: STANDARD.encode(&envelope.ciphertext),
            encrypted_auth_key: STANDARD.encode(&envelope.encrypted_auth_key),
            auth_tag: STANDARD.encode(&envelope.auth_tag),
            sender,
            receiver,
            sent_at,
        }
    }

    /// Decode the binary fields
    ///
    /// ## Errors
    ///
    /// `ProtocolError` if any field is not valid base64.
    pub fn envelope(&self) -> Result<LiveEncryptedEnvelope> {
        let field = |name: &str, value: &str| {
            STANDARD
                .decode(value)
                .map_err(|e| Error::ProtocolError(format!("{} is not base64: {}", name, e)))
        };

        Ok(LiveEncryptedEnvelope {
            ciphertext: field("ciphertext", &self.ciphertext)?,
            encrypted_auth_key: field("encryptedAuthKey", &self.encrypted_auth_key)?,
            auth_tag: field("authTag", &self.auth_tag)?,
        })
    }
}

/// Just enough of a frame to route or classify it
#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl ChannelMessage {
    /// Parse a frame from the channel
    ///
    /// Returns `Ok(None)` for well-formed frames of a type the core does not
    /// own.
    ///
    /// ## Errors
    ///
    /// `ProtocolError` if the text is not a frame at all, or if a frame of
    /// an owned type is missing fields or has the wrong field types.
    pub fn decode(text: &str) -> Result<Option<Self>> {
        let raw: RawFrame = serde_json::from_str(text)
            .map_err(|e| Error::ProtocolError(format!("Not a channel frame: {}", e)))?;

        if !OWNED_FRAME_TYPES.contains(&raw.kind.as_str()) {
            if FOREIGN_FRAME_TYPES.contains(&raw.kind.as_str()) {
                tracing::trace!("Passing over {} frame", raw.kind);
            } else {
                tracing::debug!("Ignoring unknown frame type {}", raw.kind);
            }
            return Ok(None);
        }

        serde_json::from_str(text)
            .map(Some)
            .map_err(|e| Error::ProtocolError(format!("Malformed {} frame: {}", raw.kind, e)))
    }

    /// Serialize for the channel
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The user this frame is addressed to
    ///
    /// `None` for an unaddressed `PACKET_DISCONNECT` fan-out.
    pub fn receiver(&self) -> Option<UserId> {
        match self {
            Self::RequestToSendPublicKey(m) => Some(m.receiver_id),
            Self::AcceptedRequestForPublicKey(m) => Some(m.receiver_id),
            Self::RequestToDeletePublicKey(m) => Some(m.receiver_id),
            Self::MessageTransfer(m) => Some(m.receiver),
            Self::PacketDisconnect(m) => m.receiver_id,
        }
    }

    /// Whether `user` should act on this frame
    pub fn is_addressed_to(&self, user: UserId) -> bool {
        self.receiver().map_or(true, |to| to == user)
    }

    /// The user this frame claims to come from
    pub fn sender(&self) -> UserId {
        match self {
            Self::RequestToSendPublicKey(m) => m.sender_id,
            Self::AcceptedRequestForPublicKey(m) => m.sender_id,
            Self::RequestToDeletePublicKey(m) => m.sender_id,
            Self::MessageTransfer(m) => m.sender,
            Self::PacketDisconnect(m) => m.sender_id,
        }
    }

    /// Frame type name as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestToSendPublicKey(_) => "REQUEST_TO_SEND_PUBLIC_KEY",
            Self::AcceptedRequestForPublicKey(_) => "ACCEPTED_REQUEST_FOR_PUBLIC_KEY",
            Self::RequestToDeletePublicKey(_) => "REQUEST_TO_DELETE_PUBLIC_KEY",
            Self::MessageTransfer(_) => "MESSAGE_TRANSFER",
            Self::PacketDisconnect(_) => "PACKET_DISCONNECT",
        }
    }
}

/// Read the addressee of any frame without fully decoding it
///
/// Looks at `data.receiverID`, then `data.receiver`. Used by relays, which
/// route frames they do not own too.
pub fn peek_receiver(text: &str) -> Option<UserId> {
    let raw: RawFrame = serde_json::from_str(text).ok()?;
    raw.data
        .get("receiverID")
        .or_else(|| raw.data.get("receiver"))
        .and_then(serde_json::Value::as_u64)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_key() -> PortableKey {
        PortableKey {
            kty: "RSA".into(),
            n: "AQAB".into(),
            e: "AQAB".into(),
            alg: Some("RSA-OAEP-256".into()),
            ext: Some(true),
            key_ops: Some(vec!["encrypt".into()]),
        }
    }

    #[test]
    fn test_request_wire_shape() {
        let msg = ChannelMessage::RequestToSendPublicKey(KeyRequest {
            sender_id: 1,
            receiver_id: 2,
            public_key_export: sample_key(),
        });

        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "REQUEST_TO_SEND_PUBLIC_KEY");
        assert_eq!(value["data"]["senderID"], 1);
        assert_eq!(value["data"]["receiverID"], 2);
        assert_eq!(value["data"]["publicKeyExport"]["kty"], "RSA");
    }

    #[test]
    fn test_decode_accept() {
        let text = json!({
            "type": "ACCEPTED_REQUEST_FOR_PUBLIC_KEY",
            "data": {
                "senderID": 2,
                "receiverID": 1,
                "publicKeyExport": sample_key(),
                "inChatRoom": true
            }
        })
        .to_string();

        match ChannelMessage::decode(&text).unwrap() {
            Some(ChannelMessage::AcceptedRequestForPublicKey(accept)) => {
                assert_eq!(accept.sender_id, 2);
                assert!(accept.in_chat_room);
            }
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn test_decode_delete() {
        let text = r#"{"type":"REQUEST_TO_DELETE_PUBLIC_KEY","data":{"senderID":5,"receiverID":6}}"#;
        let msg = ChannelMessage::decode(text).unwrap().unwrap();

        assert_eq!(msg.sender(), 5);
        assert_eq!(msg.receiver(), Some(6));
        assert!(msg.is_addressed_to(6));
        assert!(!msg.is_addressed_to(5));
        assert_eq!(msg.kind(), "REQUEST_TO_DELETE_PUBLIC_KEY");
    }

    #[test]
    fn test_decode_packet_disconnect() {
        let addressed = json!({
            "type": "PACKET_DISCONNECT",
            "data": { "senderID": 2, "receiverID": 1, "friends": [] }
        })
        .to_string();

        match ChannelMessage::decode(&addressed).unwrap() {
            Some(ChannelMessage::PacketDisconnect(d)) => {
                assert_eq!(d.sender_id, 2);
                assert_eq!(d.receiver_id, Some(1));
            }
            other => panic!("unexpected decode result: {:?}", other),
        }

        // client-side form, before the server fans it out
        let fan_out = json!({
            "type": "PACKET_DISCONNECT",
            "data": { "senderID": 2, "friends": [{ "id": 1, "username": "alice" }] }
        })
        .to_string();

        let msg = ChannelMessage::decode(&fan_out).unwrap().unwrap();
        assert_eq!(msg.sender(), 2);
        assert_eq!(msg.receiver(), None);
        assert!(msg.is_addressed_to(1));
        assert!(msg.is_addressed_to(7));
    }

    #[test]
    fn test_message_transfer_envelope() {
        let envelope = LiveEncryptedEnvelope {
            ciphertext: vec![1, 2, 3],
            encrypted_auth_key: vec![4, 5],
            auth_tag: vec![6],
        };
        let transfer = MessageTransfer::new(9, 1, 2, Utc::now(), &envelope);
        let msg = ChannelMessage::MessageTransfer(transfer);

        let text = msg.encode().unwrap();
        assert!(text.contains("\"encryptedAuthKey\""));
        assert!(text.contains("\"sentAt\""));

        match ChannelMessage::decode(&text).unwrap() {
            Some(ChannelMessage::MessageTransfer(t)) => {
                assert_eq!(t.id, 9);
                assert_eq!(t.envelope().unwrap(), envelope);
            }
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn test_bad_base64_is_protocol_error() {
        let mut transfer = MessageTransfer::new(
            1,
            1,
            2,
            Utc::now(),
            &LiveEncryptedEnvelope {
                ciphertext: vec![1],
                encrypted_auth_key: vec![2],
                auth_tag: vec![3],
            },
        );
        transfer.auth_tag = "***".into();

        assert!(matches!(transfer.envelope(), Err(Error::ProtocolError(_))));
    }

    #[test]
    fn test_foreign_frames_pass_through() {
        for kind in FOREIGN_FRAME_TYPES {
            let text = json!({ "type": kind, "data": { "receiverID": 3 } }).to_string();
            assert!(ChannelMessage::decode(&text).unwrap().is_none());
        }

        let unknown = r#"{"type":"SOMETHING_NEW"}"#;
        assert!(ChannelMessage::decode(unknown).unwrap().is_none());
    }

    #[test]
    fn test_malformed_owned_frame() {
        let text = r#"{"type":"REQUEST_TO_SEND_PUBLIC_KEY","data":{"senderID":"one"}}"#;
        assert!(matches!(
            ChannelMessage::decode(text),
            Err(Error::ProtocolError(_))
        ));
    }

    #[test]
    fn test_not_json() {
        assert!(matches!(
            ChannelMessage::decode("hello"),
            Err(Error::ProtocolError(_))
        ));
    }

    #[test]
    fn test_peek_receiver() {
        let handshake = r#"{"type":"REQUEST_TO_DELETE_PUBLIC_KEY","data":{"senderID":5,"receiverID":6}}"#;
        let transfer = r#"{"type":"MESSAGE_TRANSFER","data":{"receiver":8}}"#;
        let foreign = r#"{"type":"CHECK_ONLINE","data":{"receiverID":4}}"#;

        assert_eq!(peek_receiver(handshake), Some(6));
        assert_eq!(peek_receiver(transfer), Some(8));
        assert_eq!(peek_receiver(foreign), Some(4));
        assert_eq!(peek_receiver(r#"{"type":"PING"}"#), None);
        assert_eq!(peek_receiver("garbage"), None);
    }
}

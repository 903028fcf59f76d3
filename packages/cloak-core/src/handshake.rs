//! # Key Handshake
//!
//! Per-peer trust state for the live key exchange.
//!
//! The state machine does no I/O. Every transition returns the frames to
//! put on the channel and the trust changes to report; the session actor
//! does the sending.
//!
//! ## States
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       HANDSHAKE STATE MACHINE                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │                  open_conversation(P)                                  │
//! │   ┌───────────┐  sends REQUEST_TO_SEND_PUBLIC_KEY  ┌─────────────────┐  │
//! │   │ NoSession │ ─────────────────────────────────► │ AwaitingPeerKey │  │
//! │   └───────────┘                                    └────────┬────────┘  │
//! │     ▲      │                                                │           │
//! │     │      │ REQUEST_TO_SEND_PUBLIC_KEY from P              │ ACCEPTED  │
//! │     │      │ (store key, reply ACCEPTED)                    │ inChatRoom│
//! │     │      ▼                                                ▼  = true   │
//! │     │   ┌─────────────┐ ◄───────────────────────────────────┘           │
//! │     │   │ Established │                                                 │
//! │     │   └──────┬──────┘                                                 │
//! │     │          │                                                        │
//! │     │          ├── REQUEST_TO_DELETE_PUBLIC_KEY from P ──► NoSession    │
//! │     │          ├── PACKET_DISCONNECT from P ────────────► NoSession    │
//! │     │          └── close_conversation() ──────────────► Closed          │
//! │     │                (sends REQUEST_TO_DELETE_PUBLIC_KEY)               │
//! │     │                                                                   │
//! │     └── channel_teardown() clears every peer                           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Rules
//!
//! - Sending is allowed only in `Established`.
//! - A new request from a peer overwrites that peer's stored key.
//! - `ACCEPTED` is honoured only while `AwaitingPeerKey`; late or
//!   unsolicited acceptances are ignored.
//! - `inChatRoom` in the reply is true exactly when the responder's active
//!   conversation is the requester.
//! - A peer that disconnects loses its stored key exactly as if it had
//!   sent a delete request. A disconnect without a receiver is a server
//!   fan-out and counts as addressed to us.
//! - Every (re)creation or removal of trust bumps the peer's epoch. Work
//!   started under an old epoch must not be committed.

use std::collections::HashMap;

use crate::crypto::{import_public_key, PeerPublicKey, PortableKey};
use crate::error::{Error, Result};
use crate::protocol::{ChannelMessage, KeyAcceptance, KeyDeletion, KeyRequest, UserId};

/// Handshake state of one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// No key exchanged
    NoSession,
    /// Our request is out, no usable reply yet
    AwaitingPeerKey,
    /// Peer key stored, sending allowed
    Established,
    /// We closed the conversation
    Closed,
}

impl HandshakeState {
    /// Whether messages may be sent
    pub fn is_established(&self) -> bool {
        matches!(self, HandshakeState::Established)
    }

    /// Whether a conversation instance exists
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            HandshakeState::AwaitingPeerKey | HandshakeState::Established
        )
    }
}

/// Trust record for one peer
#[derive(Debug, Clone)]
pub struct PeerTrustState {
    peer_id: UserId,
    peer_public_key: Option<PeerPublicKey>,
    state: HandshakeState,
    epoch: u64,
}

impl PeerTrustState {
    /// The peer this record is about
    pub fn peer_id(&self) -> UserId {
        self.peer_id
    }

    /// The peer's key, present only when `Established`
    pub fn public_key(&self) -> Option<&PeerPublicKey> {
        self.peer_public_key.as_ref()
    }

    /// Current state
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Conversation instance counter
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Something the caller must do after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeEffect {
    /// Put this frame on the channel
    Send(ChannelMessage),
    /// The peer's key is stored; sending is now allowed
    Established {
        /// The now-trusted peer
        peer: UserId,
    },
    /// The peer answered but does not have our conversation open
    Declined {
        /// The peer that declined
        peer: UserId,
    },
    /// Trust in the peer was withdrawn
    Revoked {
        /// The peer that is no longer trusted
        peer: UserId,
    },
}

/// The handshake state machine for one logged-in user
#[derive(Debug)]
pub struct Handshake {
    my_id: UserId,
    my_public_key: PortableKey,
    active: Option<UserId>,
    peers: HashMap<UserId, PeerTrustState>,
    next_epoch: u64,
}

impl Handshake {
    /// Create a handshake for `my_id`, advertising `my_public_key`
    pub fn new(my_id: UserId, my_public_key: PortableKey) -> Self {
        Self {
            my_id,
            my_public_key,
            active: None,
            peers: HashMap::new(),
            next_epoch: 1,
        }
    }

    /// Our own user id
    pub fn my_id(&self) -> UserId {
        self.my_id
    }

    /// The conversation currently open, if any
    pub fn active_conversation(&self) -> Option<UserId> {
        self.active
    }

    /// State of a peer; `NoSession` if we know nothing about them
    pub fn state_of(&self, peer: UserId) -> HandshakeState {
        self.peers
            .get(&peer)
            .map(|t| t.state)
            .unwrap_or(HandshakeState::NoSession)
    }

    /// Full trust record of a peer
    pub fn trust(&self, peer: UserId) -> Option<&PeerTrustState> {
        self.peers.get(&peer)
    }

    /// Snapshot of every peer's state
    pub fn states(&self) -> HashMap<UserId, HandshakeState> {
        self.peers.iter().map(|(id, t)| (*id, t.state)).collect()
    }

    /// Key and epoch of an established peer
    ///
    /// ## Errors
    ///
    /// `NotSecured` unless the peer is `Established`.
    pub fn require_established(&self, peer: UserId) -> Result<(&PeerPublicKey, u64)> {
        match self.peers.get(&peer) {
            Some(PeerTrustState {
                state: HandshakeState::Established,
                peer_public_key: Some(key),
                epoch,
                ..
            }) => Ok((key, *epoch)),
            _ => Err(Error::NotSecured(peer)),
        }
    }

    /// Epoch of a live conversation with `peer`
    ///
    /// ## Errors
    ///
    /// `NotSecured` if there is no open or established conversation.
    pub fn require_live(&self, peer: UserId) -> Result<u64> {
        match self.peers.get(&peer) {
            Some(t) if t.state.is_live() => Ok(t.epoch),
            _ => Err(Error::NotSecured(peer)),
        }
    }

    /// Whether work started at `epoch` may still be committed
    pub fn is_current(&self, peer: UserId, epoch: u64) -> bool {
        self.peers
            .get(&peer)
            .map(|t| t.epoch == epoch && t.state.is_live())
            .unwrap_or(false)
    }

    /// Open a conversation with `peer` and start the key exchange
    ///
    /// Any other open conversation is closed first. Reopening the same
    /// peer restarts the exchange from scratch.
    pub fn open_conversation(&mut self, peer: UserId) -> Vec<HandshakeEffect> {
        let mut effects = Vec::new();

        if let Some(previous) = self.active {
            if previous != peer {
                effects.extend(self.close_conversation());
            }
        }

        let epoch = self.bump_epoch();
        self.peers.insert(
            peer,
            PeerTrustState {
                peer_id: peer,
                peer_public_key: None,
                state: HandshakeState::AwaitingPeerKey,
                epoch,
            },
        );
        self.active = Some(peer);

        tracing::debug!("Opening conversation with {} (epoch {})", peer, epoch);

        effects.push(HandshakeEffect::Send(ChannelMessage::RequestToSendPublicKey(
            KeyRequest {
                sender_id: self.my_id,
                receiver_id: peer,
                public_key_export: self.my_public_key.clone(),
            },
        )));
        effects
    }

    /// Close the open conversation
    ///
    /// Tells the peer to discard our key and forgets theirs. No-op when
    /// nothing is open.
    pub fn close_conversation(&mut self) -> Vec<HandshakeEffect> {
        let Some(peer) = self.active.take() else {
            return Vec::new();
        };

        let epoch = self.bump_epoch();
        self.peers.insert(
            peer,
            PeerTrustState {
                peer_id: peer,
                peer_public_key: None,
                state: HandshakeState::Closed,
                epoch,
            },
        );

        tracing::debug!("Closed conversation with {}", peer);

        vec![
            HandshakeEffect::Send(ChannelMessage::RequestToDeletePublicKey(KeyDeletion {
                sender_id: self.my_id,
                receiver_id: peer,
            })),
            HandshakeEffect::Revoked { peer },
        ]
    }

    /// Forget every peer after the channel went away
    ///
    /// The delete for the open conversation is still returned; the caller
    /// sends it if the channel allows.
    pub fn channel_teardown(&mut self) -> Vec<HandshakeEffect> {
        let mut effects = self.close_conversation();

        for (peer, trust) in self.peers.drain() {
            if trust.state.is_live() {
                effects.push(HandshakeEffect::Revoked { peer });
            }
        }

        effects
    }

    /// Apply an inbound handshake frame
    ///
    /// `MESSAGE_TRANSFER` frames and frames addressed to someone else are
    /// ignored.
    ///
    /// ## Errors
    ///
    /// `MalformedKey` if the peer's key does not import. Trust is left as
    /// it was.
    pub fn handle(&mut self, message: &ChannelMessage) -> Result<Vec<HandshakeEffect>> {
        if !message.is_addressed_to(self.my_id) {
            tracing::warn!(
                "Dropping {} addressed to {:?} (we are {})",
                message.kind(),
                message.receiver(),
                self.my_id
            );
            return Ok(Vec::new());
        }

        match message {
            ChannelMessage::RequestToSendPublicKey(request) => self.on_request(request),
            ChannelMessage::AcceptedRequestForPublicKey(accept) => self.on_accept(accept),
            ChannelMessage::RequestToDeletePublicKey(delete) => Ok(self.on_delete(delete)),
            ChannelMessage::MessageTransfer(_) => Ok(Vec::new()),
            ChannelMessage::PacketDisconnect(gone) => {
                Ok(self.on_peer_disconnect(gone.sender_id))
            }
        }
    }

    fn on_request(&mut self, request: &KeyRequest) -> Result<Vec<HandshakeEffect>> {
        let peer = request.sender_id;
        let key = import_public_key(&request.public_key_export)?;

        let epoch = self.bump_epoch();
        self.peers.insert(
            peer,
            PeerTrustState {
                peer_id: peer,
                peer_public_key: Some(key),
                state: HandshakeState::Established,
                epoch,
            },
        );

        let in_chat_room = self.active == Some(peer);
        tracing::info!(
            "Stored key for {} (in chat room: {})",
            peer,
            in_chat_room
        );

        Ok(vec![
            HandshakeEffect::Established { peer },
            HandshakeEffect::Send(ChannelMessage::AcceptedRequestForPublicKey(KeyAcceptance {
                sender_id: self.my_id,
                receiver_id: peer,
                public_key_export: self.my_public_key.clone(),
                in_chat_room,
            })),
        ])
    }

    fn on_accept(&mut self, accept: &KeyAcceptance) -> Result<Vec<HandshakeEffect>> {
        let peer = accept.sender_id;

        let Some(trust) = self.peers.get_mut(&peer) else {
            tracing::debug!("Ignoring unsolicited acceptance from {}", peer);
            return Ok(Vec::new());
        };

        if trust.state != HandshakeState::AwaitingPeerKey {
            tracing::debug!(
                "Ignoring acceptance from {} in state {:?}",
                peer,
                trust.state
            );
            return Ok(Vec::new());
        }

        if !accept.in_chat_room {
            tracing::info!("{} does not have our conversation open", peer);
            return Ok(vec![HandshakeEffect::Declined { peer }]);
        }

        let key = import_public_key(&accept.public_key_export)?;
        trust.peer_public_key = Some(key);
        trust.state = HandshakeState::Established;

        tracing::info!("Conversation with {} established", peer);

        Ok(vec![HandshakeEffect::Established { peer }])
    }

    fn on_delete(&mut self, delete: &KeyDeletion) -> Vec<HandshakeEffect> {
        let peer = delete.sender_id;
        if self.peers.contains_key(&peer) {
            tracing::info!("{} withdrew their key", peer);
        }
        self.forget(peer)
    }

    /// The peer's channel dropped, so no delete request will come from them
    ///
    /// The conversation stays open on our side; a reconnecting peer's new
    /// request re-establishes it.
    fn on_peer_disconnect(&mut self, peer: UserId) -> Vec<HandshakeEffect> {
        if self.peers.contains_key(&peer) {
            tracing::info!("{} disconnected, discarding their key", peer);
        }
        self.forget(peer)
    }

    fn forget(&mut self, peer: UserId) -> Vec<HandshakeEffect> {
        match self.peers.remove(&peer) {
            Some(trust) if trust.state.is_live() => vec![HandshakeEffect::Revoked { peer }],
            _ => Vec::new(),
        }
    }

    fn bump_epoch(&mut self) -> u64 {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        epoch
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AsymmetricKeyPair;
    use once_cell::sync::Lazy;

    const ALICE: UserId = 1;
    const BOB: UserId = 2;
    const CAROL: UserId = 3;

    static ALICE_KEYS: Lazy<AsymmetricKeyPair> = Lazy::new(|| AsymmetricKeyPair::generate().unwrap());
    static BOB_KEYS: Lazy<AsymmetricKeyPair> = Lazy::new(|| AsymmetricKeyPair::generate().unwrap());

    fn alice() -> Handshake {
        Handshake::new(ALICE, ALICE_KEYS.export_public_key())
    }

    fn bob() -> Handshake {
        Handshake::new(BOB, BOB_KEYS.export_public_key())
    }

    fn sent(effects: &[HandshakeEffect]) -> Vec<ChannelMessage> {
        effects
            .iter()
            .filter_map(|e| match e {
                HandshakeEffect::Send(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    fn deliver(to: &mut Handshake, effects: &[HandshakeEffect]) -> Vec<HandshakeEffect> {
        sent(effects)
            .iter()
            .flat_map(|m| to.handle(m).unwrap())
            .collect()
    }

    #[test]
    fn test_unknown_peer_has_no_session() {
        let hs = alice();
        assert_eq!(hs.state_of(BOB), HandshakeState::NoSession);
        assert!(matches!(hs.require_established(BOB), Err(Error::NotSecured(2))));
    }

    #[test]
    fn test_both_viewing_establishes() {
        let mut a = alice();
        let mut b = bob();

        b.open_conversation(ALICE);
        let request = a.open_conversation(BOB);
        assert_eq!(a.state_of(BOB), HandshakeState::AwaitingPeerKey);

        let reply = deliver(&mut b, &request);
        assert_eq!(b.state_of(ALICE), HandshakeState::Established);
        match &sent(&reply)[0] {
            ChannelMessage::AcceptedRequestForPublicKey(accept) => assert!(accept.in_chat_room),
            other => panic!("unexpected frame {:?}", other),
        }

        let effects = deliver(&mut a, &reply);
        assert_eq!(effects, vec![HandshakeEffect::Established { peer: BOB }]);
        assert_eq!(a.state_of(BOB), HandshakeState::Established);

        let (key, _) = a.require_established(BOB).unwrap();
        assert_eq!(key, BOB_KEYS.public_key());
    }

    #[test]
    fn test_peer_not_viewing_declines() {
        let mut a = alice();
        let mut b = bob();

        let request = a.open_conversation(BOB);
        let reply = deliver(&mut b, &request);

        match &sent(&reply)[0] {
            ChannelMessage::AcceptedRequestForPublicKey(accept) => assert!(!accept.in_chat_room),
            other => panic!("unexpected frame {:?}", other),
        }
        // B still stores A's key
        assert_eq!(b.state_of(ALICE), HandshakeState::Established);

        let effects = deliver(&mut a, &reply);
        assert_eq!(effects, vec![HandshakeEffect::Declined { peer: BOB }]);
        assert_eq!(a.state_of(BOB), HandshakeState::AwaitingPeerKey);
        assert!(matches!(a.require_established(BOB), Err(Error::NotSecured(_))));
    }

    #[test]
    fn test_late_open_completes_exchange() {
        let mut a = alice();
        let mut b = bob();

        let first = a.open_conversation(BOB);
        let declined = deliver(&mut b, &first);
        deliver(&mut a, &declined);

        let second = b.open_conversation(ALICE);
        let accepted = deliver(&mut a, &second);
        assert_eq!(a.state_of(BOB), HandshakeState::Established);

        deliver(&mut b, &accepted);
        assert_eq!(b.state_of(ALICE), HandshakeState::Established);
    }

    #[test]
    fn test_unsolicited_accept_ignored() {
        let mut a = alice();
        let accept = ChannelMessage::AcceptedRequestForPublicKey(KeyAcceptance {
            sender_id: BOB,
            receiver_id: ALICE,
            public_key_export: BOB_KEYS.export_public_key(),
            in_chat_room: true,
        });

        assert!(a.handle(&accept).unwrap().is_empty());
        assert_eq!(a.state_of(BOB), HandshakeState::NoSession);
    }

    #[test]
    fn test_delete_revokes_trust() {
        let mut a = alice();
        let mut b = bob();

        b.open_conversation(ALICE);
        let request = a.open_conversation(BOB);
        let reply = deliver(&mut b, &request);
        deliver(&mut a, &reply);

        let close = b.close_conversation();
        assert_eq!(b.state_of(ALICE), HandshakeState::Closed);
        assert!(b.active_conversation().is_none());

        let effects = deliver(&mut a, &close);
        assert_eq!(effects, vec![HandshakeEffect::Revoked { peer: BOB }]);
        assert_eq!(a.state_of(BOB), HandshakeState::NoSession);
        assert!(a.require_established(BOB).is_err());
    }

    fn disconnect(from: UserId, to: Option<UserId>) -> ChannelMessage {
        ChannelMessage::PacketDisconnect(crate::protocol::PeerDisconnect {
            sender_id: from,
            receiver_id: to,
            friends: Vec::new(),
        })
    }

    #[test]
    fn test_peer_disconnect_revokes() {
        let mut a = alice();
        let mut b = bob();

        b.open_conversation(ALICE);
        let request = a.open_conversation(BOB);
        let reply = deliver(&mut b, &request);
        deliver(&mut a, &reply);
        let (_, epoch) = a.require_established(BOB).unwrap();

        let effects = a.handle(&disconnect(BOB, Some(ALICE))).unwrap();
        assert_eq!(effects, vec![HandshakeEffect::Revoked { peer: BOB }]);
        assert_eq!(a.state_of(BOB), HandshakeState::NoSession);
        assert!(a.require_established(BOB).is_err());
        assert!(!a.is_current(BOB, epoch));
        assert_eq!(a.active_conversation(), Some(BOB));
    }

    #[test]
    fn test_fanned_out_disconnect_revokes() {
        let mut b = bob();
        b.handle(&ChannelMessage::RequestToSendPublicKey(KeyRequest {
            sender_id: ALICE,
            receiver_id: BOB,
            public_key_export: ALICE_KEYS.export_public_key(),
        }))
        .unwrap();
        assert!(b.require_established(ALICE).is_ok());

        let effects = b.handle(&disconnect(ALICE, None)).unwrap();
        assert_eq!(effects, vec![HandshakeEffect::Revoked { peer: ALICE }]);
        assert_eq!(b.state_of(ALICE), HandshakeState::NoSession);
    }

    #[test]
    fn test_disconnect_for_someone_else_ignored() {
        let mut b = bob();
        b.handle(&ChannelMessage::RequestToSendPublicKey(KeyRequest {
            sender_id: ALICE,
            receiver_id: BOB,
            public_key_export: ALICE_KEYS.export_public_key(),
        }))
        .unwrap();

        assert!(b.handle(&disconnect(ALICE, Some(CAROL))).unwrap().is_empty());
        assert!(b.require_established(ALICE).is_ok());
    }

    #[test]
    fn test_disconnect_of_unknown_peer_is_noop() {
        let mut a = alice();
        assert!(a.handle(&disconnect(CAROL, Some(ALICE))).unwrap().is_empty());
        assert_eq!(a.state_of(CAROL), HandshakeState::NoSession);
    }

    #[test]
    fn test_switching_conversation_closes_previous() {
        let mut a = alice();
        a.open_conversation(BOB);

        let effects = a.open_conversation(CAROL);
        let frames = sent(&effects);

        assert!(matches!(
            &frames[0],
            ChannelMessage::RequestToDeletePublicKey(d) if d.receiver_id == BOB
        ));
        assert!(matches!(
            &frames[1],
            ChannelMessage::RequestToSendPublicKey(r) if r.receiver_id == CAROL
        ));
        assert_eq!(a.state_of(BOB), HandshakeState::Closed);
        assert_eq!(a.active_conversation(), Some(CAROL));
    }

    #[test]
    fn test_reopen_overwrites_state() {
        let mut a = alice();
        let mut b = bob();

        b.open_conversation(ALICE);
        let request = a.open_conversation(BOB);
        let reply = deliver(&mut b, &request);
        deliver(&mut a, &reply);
        let (_, first_epoch) = a.require_established(BOB).unwrap();

        a.open_conversation(BOB);
        assert_eq!(a.state_of(BOB), HandshakeState::AwaitingPeerKey);
        assert!(!a.is_current(BOB, first_epoch));
    }

    #[test]
    fn test_repeated_request_overwrites_key() {
        let mut b = bob();
        let other = AsymmetricKeyPair::generate().unwrap();

        let first = ChannelMessage::RequestToSendPublicKey(KeyRequest {
            sender_id: ALICE,
            receiver_id: BOB,
            public_key_export: ALICE_KEYS.export_public_key(),
        });
        let second = ChannelMessage::RequestToSendPublicKey(KeyRequest {
            sender_id: ALICE,
            receiver_id: BOB,
            public_key_export: other.export_public_key(),
        });

        b.handle(&first).unwrap();
        let (_, epoch) = b.require_established(ALICE).unwrap();
        b.handle(&second).unwrap();

        let (key, new_epoch) = b.require_established(ALICE).unwrap();
        assert_eq!(key, other.public_key());
        assert_ne!(epoch, new_epoch);
    }

    #[test]
    fn test_malformed_key_leaves_state() {
        let mut b = bob();
        let mut bad = ALICE_KEYS.export_public_key();
        bad.kty = "EC".into();

        let request = ChannelMessage::RequestToSendPublicKey(KeyRequest {
            sender_id: ALICE,
            receiver_id: BOB,
            public_key_export: bad,
        });

        assert!(matches!(b.handle(&request), Err(Error::MalformedKey(_))));
        assert_eq!(b.state_of(ALICE), HandshakeState::NoSession);
    }

    #[test]
    fn test_misaddressed_frame_ignored() {
        let mut b = bob();
        let request = ChannelMessage::RequestToSendPublicKey(KeyRequest {
            sender_id: ALICE,
            receiver_id: CAROL,
            public_key_export: ALICE_KEYS.export_public_key(),
        });

        assert!(b.handle(&request).unwrap().is_empty());
        assert_eq!(b.state_of(ALICE), HandshakeState::NoSession);
    }

    #[test]
    fn test_teardown_clears_everything() {
        let mut a = alice();
        let mut b = bob();

        b.open_conversation(ALICE);
        let request = a.open_conversation(BOB);
        let reply = deliver(&mut b, &request);
        deliver(&mut a, &reply);

        let effects = a.channel_teardown();
        assert!(matches!(
            &sent(&effects)[0],
            ChannelMessage::RequestToDeletePublicKey(_)
        ));
        assert!(a.states().is_empty());
        assert!(a.active_conversation().is_none());
        assert_eq!(a.state_of(BOB), HandshakeState::NoSession);
    }

    #[test]
    fn test_close_without_conversation_is_noop() {
        let mut a = alice();
        assert!(a.close_conversation().is_empty());
    }
}

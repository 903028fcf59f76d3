//! # Session Client
//!
//! Runs a [`Session`] on its own task and gives the UI an async handle to
//! it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SESSION CLIENT                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   UI                                                                   │
//! │    │  open_conversation / close_conversation / send_message / history  │
//! │    ▼                                                                    │
//! │  ┌─────────────────┐   SessionCommand (+ oneshot reply)               │
//! │  │  SessionHandle  │ ─────────────────────────────┐                    │
//! │  └────────┬────────┘                              ▼                    │
//! │           │ subscribe()               ┌───────────────────────┐        │
//! │           │                           │   session event loop  │◄─ channel
//! │           ▼                           │   (owns the Session)  │──► channel
//! │  broadcast::Receiver<SessionEvent> ◄──┤                       │        │
//! │                                       └───────────┬───────────┘        │
//! │  is_secured() / trust_state()  ◄── trust snapshot ┘                    │
//! │  (synchronous, no round trip)                                          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let relay = MemoryRelay::new(64);
//! let archive = Arc::new(MemoryArchive::new());
//!
//! let session = Session::login(1, "password", b"salt").await?;
//! let handle = SessionHandle::spawn(session, relay.connect(1), archive, &CoreConfig::default());
//!
//! handle.open_conversation(2).await?;
//! // wait for SessionEvent::PeerEstablished { peer: 2 }
//! handle.send_message(2, "hello").await?;
//! ```

mod event_loop;
mod events;

pub use events::{HistoryEntry, ReceivedMessage, SentMessage, SessionEvent};

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::channel::ChannelEndpoint;
use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::handshake::HandshakeState;
use crate::protocol::UserId;
use crate::session::Session;
use crate::storage::MessageArchive;

use event_loop::{run_session_loop, SessionLoop, TrustSnapshot};

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Commands sent from a [`SessionHandle`] to the event loop
#[derive(Debug)]
pub(crate) enum SessionCommand {
    OpenConversation {
        peer: UserId,
        reply: oneshot::Sender<Result<()>>,
    },
    CloseConversation {
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        peer: UserId,
        text: String,
        reply: oneshot::Sender<Result<SentMessage>>,
    },
    History {
        friend: UserId,
        reply: oneshot::Sender<Result<Vec<HistoryEntry>>>,
    },
    Shutdown,
}

/// Handle to a running session
pub struct SessionHandle {
    user_id: UserId,
    command_tx: mpsc::Sender<SessionCommand>,
    event_tx: broadcast::Sender<SessionEvent>,
    trust: Arc<RwLock<TrustSnapshot>>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Start the event loop for `session` on the current runtime
    pub fn spawn(
        session: Session,
        channel: ChannelEndpoint,
        archive: Arc<dyn MessageArchive>,
        config: &CoreConfig,
    ) -> Self {
        let user_id = session.user_id();
        let (command_tx, command_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let trust = Arc::new(RwLock::new(TrustSnapshot::default()));

        let state = SessionLoop {
            session,
            outbound: channel.outbound,
            archive,
            event_tx: event_tx.clone(),
            trust: Arc::clone(&trust),
            response_delay: config.handshake_response_delay(),
            connected: true,
        };

        let task = tokio::spawn(run_session_loop(state, command_rx, channel.inbound));

        Self {
            user_id,
            command_tx,
            event_tx,
            trust,
            task,
        }
    }

    /// The logged-in user
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Handshake state of `peer`, without a round trip to the loop
    pub fn trust_state(&self, peer: UserId) -> HandshakeState {
        self.trust
            .read()
            .states
            .get(&peer)
            .copied()
            .unwrap_or(HandshakeState::NoSession)
    }

    /// Whether messages to `peer` would be accepted for sending
    ///
    /// UI composers check this before offering to send.
    pub fn is_secured(&self, peer: UserId) -> bool {
        self.trust_state(peer).is_established()
    }

    /// The open conversation, if any
    pub fn active_conversation(&self) -> Option<UserId> {
        self.trust.read().active
    }

    /// Open a conversation with `peer` and start the key exchange
    ///
    /// Returns once the request is on the channel; watch for
    /// [`SessionEvent::PeerEstablished`].
    pub async fn open_conversation(&self, peer: UserId) -> Result<()> {
        self.request(|reply| SessionCommand::OpenConversation { peer, reply })
            .await?
    }

    /// Close the open conversation
    pub async fn close_conversation(&self) -> Result<()> {
        self.request(|reply| SessionCommand::CloseConversation { reply })
            .await?
    }

    /// Encrypt, archive and send a message
    ///
    /// ## Errors
    ///
    /// - `NotSecured` if the conversation is not `Established`
    /// - `PayloadTooLarge` if the text does not fit one RSA block
    /// - `NotConnected` if the channel is gone
    pub async fn send_message(&self, peer: UserId, text: impl Into<String>) -> Result<SentMessage> {
        let text = text.into();
        if !self.is_secured(peer) {
            return Err(Error::NotSecured(peer));
        }
        self.request(|reply| SessionCommand::Send { peer, text, reply })
            .await?
    }

    /// Load and open the archived conversation with `friend`
    pub async fn history(&self, friend: UserId) -> Result<Vec<HistoryEntry>> {
        self.request(|reply| SessionCommand::History { friend, reply })
            .await?
    }

    /// Stop the loop, tell the open peer to discard our key, and log out
    pub async fn shutdown(self) -> Result<()> {
        // the loop also stops once every sender is dropped
        let _ = self.command_tx.send(SessionCommand::Shutdown).await;
        drop(self.command_tx);

        self.task
            .await
            .map_err(|e| Error::Internal(format!("session task failed: {}", e)))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| Error::SessionClosed)?;
        reply_rx.await.map_err(|_| Error::SessionClosed)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("user_id", &self.user_id)
            .field("active", &self.active_conversation())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryRelay;
    use crate::crypto::{AsymmetricKeyPair, PasswordKeyBundle};
    use crate::storage::MemoryArchive;
    use once_cell::sync::Lazy;
    use std::time::Duration;
    use tokio::time::timeout;

    const ALICE: UserId = 1;
    const BOB: UserId = 2;
    const CAROL: UserId = 3;

    static KEYS: Lazy<[Arc<AsymmetricKeyPair>; 3]> = Lazy::new(|| {
        [
            Arc::new(AsymmetricKeyPair::generate().unwrap()),
            Arc::new(AsymmetricKeyPair::generate().unwrap()),
            Arc::new(AsymmetricKeyPair::generate().unwrap()),
        ]
    });

    fn start(relay: &MemoryRelay, archive: &Arc<MemoryArchive>, user: UserId) -> SessionHandle {
        let seed = user as u8;
        let session = Session::from_parts(
            user,
            Arc::clone(&KEYS[(user - 1) as usize]),
            Arc::new(PasswordKeyBundle::from_keys([seed; 32], [seed + 10; 32])),
        );
        let archive: Arc<dyn MessageArchive> = archive.clone();
        SessionHandle::spawn(session, relay.connect(user), archive, &CoreConfig::default())
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        let waited = timeout(Duration::from_secs(10), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {}", what);
    }

    async fn next_matching(
        rx: &mut broadcast::Receiver<SessionEvent>,
        matches: impl Fn(&SessionEvent) -> bool,
    ) -> SessionEvent {
        timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Ok(event) if matches(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Both sides open the conversation, Bob first
    async fn establish(alice: &SessionHandle, bob: &SessionHandle) {
        bob.open_conversation(ALICE).await.unwrap();
        eventually("alice to store bob's key", || alice.is_secured(BOB)).await;

        alice.open_conversation(BOB).await.unwrap();
        eventually("both sides established", || {
            alice.is_secured(BOB) && bob.is_secured(ALICE)
        })
        .await;
    }

    #[tokio::test]
    async fn test_both_viewing_establishes() {
        let relay = MemoryRelay::new(16);
        let archive = Arc::new(MemoryArchive::new());
        let alice = start(&relay, &archive, ALICE);
        let bob = start(&relay, &archive, BOB);
        let mut bob_events = bob.subscribe();

        establish(&alice, &bob).await;

        let event = next_matching(&mut bob_events, |e| {
            matches!(e, SessionEvent::PeerEstablished { .. })
        })
        .await;
        assert_eq!(event.peer(), Some(ALICE));
        assert_eq!(alice.active_conversation(), Some(BOB));
        assert_eq!(bob.trust_state(ALICE), HandshakeState::Established);
    }

    #[tokio::test]
    async fn test_peer_not_viewing_declines() {
        let relay = MemoryRelay::new(16);
        let archive = Arc::new(MemoryArchive::new());
        let alice = start(&relay, &archive, ALICE);
        let bob = start(&relay, &archive, BOB);
        let mut alice_events = alice.subscribe();

        alice.open_conversation(BOB).await.unwrap();

        let event = next_matching(&mut alice_events, SessionEvent::is_trust_event).await;
        assert_eq!(event, SessionEvent::PeerDeclined { peer: BOB });
        assert_eq!(alice.trust_state(BOB), HandshakeState::AwaitingPeerKey);

        let err = alice.send_message(BOB, "anyone there?").await.unwrap_err();
        assert!(matches!(err, Error::NotSecured(BOB)));
        assert_eq!(archive.len_for(ALICE), 0);
    }

    #[tokio::test]
    async fn test_message_delivered_and_archived_both_sides() {
        let relay = MemoryRelay::new(16);
        let archive = Arc::new(MemoryArchive::new());
        let alice = start(&relay, &archive, ALICE);
        let bob = start(&relay, &archive, BOB);
        establish(&alice, &bob).await;

        let mut bob_events = bob.subscribe();
        let sent = alice.send_message(BOB, "hello bob").await.unwrap();

        let event = next_matching(&mut bob_events, |e| {
            matches!(e, SessionEvent::MessageReceived(_))
        })
        .await;
        let SessionEvent::MessageReceived(message) = event else {
            unreachable!()
        };
        assert_eq!(message.id, sent.id);
        assert_eq!(message.sender, ALICE);
        assert_eq!(message.text, "hello bob");

        eventually("bob to archive his copy", || archive.len_for(BOB) == 1).await;

        let bob_history = bob.history(ALICE).await.unwrap();
        assert_eq!(bob_history.len(), 1);
        assert_eq!(bob_history[0].text(), Some("hello bob"));

        let alice_history = alice.history(BOB).await.unwrap();
        assert_eq!(alice_history.len(), 1);
        assert_eq!(alice_history[0].id(), sent.id);
    }

    #[tokio::test]
    async fn test_close_revokes_peer() {
        let relay = MemoryRelay::new(16);
        let archive = Arc::new(MemoryArchive::new());
        let alice = start(&relay, &archive, ALICE);
        let bob = start(&relay, &archive, BOB);
        establish(&alice, &bob).await;

        let mut bob_events = bob.subscribe();
        alice.close_conversation().await.unwrap();

        let event = next_matching(&mut bob_events, SessionEvent::is_trust_event).await;
        assert_eq!(event, SessionEvent::PeerRevoked { peer: ALICE });
        assert!(!bob.is_secured(ALICE));
        assert_eq!(alice.trust_state(BOB), HandshakeState::Closed);
        assert_eq!(alice.active_conversation(), None);

        let err = bob.send_message(ALICE, "still there?").await.unwrap_err();
        assert!(matches!(err, Error::NotSecured(ALICE)));
    }

    #[tokio::test]
    async fn test_close_without_conversation() {
        let relay = MemoryRelay::new(16);
        let archive = Arc::new(MemoryArchive::new());
        let alice = start(&relay, &archive, ALICE);

        let err = alice.close_conversation().await.unwrap_err();
        assert!(matches!(err, Error::NoActiveConversation));
    }

    #[tokio::test]
    async fn test_switching_conversation_revokes_previous() {
        let relay = MemoryRelay::new(16);
        let archive = Arc::new(MemoryArchive::new());
        let alice = start(&relay, &archive, ALICE);
        let bob = start(&relay, &archive, BOB);
        let _carol = start(&relay, &archive, CAROL);
        establish(&alice, &bob).await;

        alice.open_conversation(CAROL).await.unwrap();

        eventually("bob to drop alice", || !bob.is_secured(ALICE)).await;
        assert_eq!(alice.active_conversation(), Some(CAROL));
        assert!(!alice.is_secured(BOB));
    }

    #[tokio::test]
    async fn test_peer_disconnect_revokes() {
        let relay = MemoryRelay::new(16);
        let archive = Arc::new(MemoryArchive::new());
        let alice = start(&relay, &archive, ALICE);
        let bob = start(&relay, &archive, BOB);
        establish(&alice, &bob).await;

        let mut alice_events = alice.subscribe();
        let server = relay.connect(99);
        server
            .outbound
            .send(
                r#"{"type":"PACKET_DISCONNECT","data":{"senderID":2,"receiverID":1,"friends":[]}}"#
                    .to_string(),
            )
            .await
            .unwrap();

        let event = next_matching(&mut alice_events, SessionEvent::is_trust_event).await;
        assert_eq!(event, SessionEvent::PeerRevoked { peer: BOB });
        assert!(!alice.is_secured(BOB));

        let err = alice.send_message(BOB, "are you back?").await.unwrap_err();
        assert!(matches!(err, Error::NotSecured(BOB)));
        assert_eq!(archive.len_for(ALICE), 0);
    }

    #[tokio::test]
    async fn test_channel_loss_clears_trust() {
        let relay = MemoryRelay::new(16);
        let archive = Arc::new(MemoryArchive::new());
        let alice = start(&relay, &archive, ALICE);
        let bob = start(&relay, &archive, BOB);
        establish(&alice, &bob).await;

        let mut alice_events = alice.subscribe();
        relay.disconnect(ALICE);

        next_matching(&mut alice_events, |e| *e == SessionEvent::ChannelClosed).await;
        assert!(!alice.is_secured(BOB));
        assert_eq!(alice.active_conversation(), None);

        let err = alice.open_conversation(BOB).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn test_shutdown_notifies_peer() {
        let relay = MemoryRelay::new(16);
        let archive = Arc::new(MemoryArchive::new());
        let alice = start(&relay, &archive, ALICE);
        let bob = start(&relay, &archive, BOB);
        establish(&alice, &bob).await;

        alice.shutdown().await.unwrap();

        eventually("bob to drop alice", || !bob.is_secured(ALICE)).await;
    }
}

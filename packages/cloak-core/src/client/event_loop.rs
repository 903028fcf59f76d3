//! # Session Event Loop
//!
//! The single task that owns a [`Session`] and serializes everything that
//! touches it.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SESSION EVENT LOOP                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────┐                    ┌─────────────────────────┐    │
//! │  │  Command Rx     │───────────────────►│                         │    │
//! │  │  (from UI)      │                    │   tokio::select! {      │    │
//! │  └─────────────────┘                    │     command_rx.recv()   │    │
//! │                                          │     inbound.recv()      │    │
//! │  ┌─────────────────┐                    │   }                     │    │
//! │  │  Inbound frames │───────────────────►│                         │    │
//! │  │  (from channel) │                    │   one event at a time   │    │
//! │  └─────────────────┘                    └───────────┬─────────────┘    │
//! │                                                      │                  │
//! │                        ┌─────────────────────────────┼──────────┐       │
//! │                        ▼                             ▼          ▼       │
//! │               ┌────────────────┐   ┌────────────────────┐  ┌────────┐  │
//! │               │ outbound frames│   │ SessionEvent bcast │  │ trust  │  │
//! │               └────────────────┘   └────────────────────┘  │snapshot│  │
//! │                                                             └────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! RSA work runs on the blocking pool. The loop awaits it before taking the
//! next event, so handshake transitions and message handling never
//! interleave. Results are still checked against the peer's epoch before
//! they are committed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};

use super::events::{HistoryEntry, ReceivedMessage, SentMessage, SessionEvent};
use super::SessionCommand;
use crate::crypto::{ArchiveEncryptedRecord, PasswordKeyBundle};
use crate::error::{Error, Result};
use crate::handshake::{HandshakeEffect, HandshakeState};
use crate::protocol::{ChannelMessage, MessageTransfer, UserId};
use crate::session::{open_text, Session};
use crate::storage::{ArchivedMessage, MessageArchive};

/// Read-only view of trust state, shared with the handle
#[derive(Debug, Default)]
pub(crate) struct TrustSnapshot {
    pub(crate) states: HashMap<UserId, HandshakeState>,
    pub(crate) active: Option<UserId>,
}

/// Everything the loop owns
pub(crate) struct SessionLoop {
    pub(crate) session: Session,
    pub(crate) outbound: mpsc::Sender<String>,
    pub(crate) archive: Arc<dyn MessageArchive>,
    pub(crate) event_tx: broadcast::Sender<SessionEvent>,
    pub(crate) trust: Arc<RwLock<TrustSnapshot>>,
    pub(crate) response_delay: Duration,
    pub(crate) connected: bool,
}

/// Run the session event loop until shutdown
pub(crate) async fn run_session_loop(
    mut state: SessionLoop,
    mut command_rx: mpsc::Receiver<SessionCommand>,
    mut inbound: mpsc::Receiver<String>,
) {
    tracing::info!("Session loop for user {} starting", state.session.user_id());

    loop {
        tokio::select! {
            command = command_rx.recv() => {
                match command {
                    Some(cmd) => {
                        if !state.handle_command(cmd).await {
                            tracing::info!("Shutdown requested, leaving session loop");
                            break;
                        }
                    }
                    None => {
                        tracing::info!("All session handles dropped, leaving session loop");
                        break;
                    }
                }
            }

            frame = inbound.recv(), if state.connected => {
                match frame {
                    Some(text) => state.handle_frame(&text).await,
                    None => state.on_channel_closed().await,
                }
            }
        }
    }

    state.teardown().await;
    state.session.logout();
}

impl SessionLoop {
    /// Handle a command; returns `false` to stop the loop
    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::OpenConversation { peer, reply } => {
                let result = if self.connected {
                    let effects = self.session.handshake_mut().open_conversation(peer);
                    self.apply_effects(effects).await
                } else {
                    Err(Error::NotConnected)
                };
                let _ = reply.send(result);
            }

            SessionCommand::CloseConversation { reply } => {
                let result = if self.session.handshake().active_conversation().is_some() {
                    let effects = self.session.handshake_mut().close_conversation();
                    self.apply_effects(effects).await
                } else {
                    Err(Error::NoActiveConversation)
                };
                let _ = reply.send(result);
            }

            SessionCommand::Send { peer, text, reply } => {
                let result = self.send_message(peer, text).await;
                if let Err(e) = &result {
                    tracing::warn!("Send to {} failed: {}", peer, e);
                }
                let _ = reply.send(result);
            }

            SessionCommand::History { friend, reply } => {
                let _ = reply.send(self.history(friend).await);
            }

            SessionCommand::Shutdown => return false,
        }

        true
    }

    /// Handle one inbound frame
    async fn handle_frame(&mut self, text: &str) {
        let message = match ChannelMessage::decode(text) {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Dropping frame: {}", e);
                return;
            }
        };

        tracing::debug!("Inbound {} from {}", message.kind(), message.sender());

        match message {
            ChannelMessage::MessageTransfer(transfer) => self.receive_message(transfer).await,
            handshake => match self.session.handshake_mut().handle(&handshake) {
                Ok(effects) => {
                    if let Err(e) = self.apply_effects(effects).await {
                        tracing::warn!("Could not answer {}: {}", handshake.kind(), e);
                    }
                }
                Err(e) => tracing::warn!(
                    "Rejected {} from {}: {}",
                    handshake.kind(),
                    handshake.sender(),
                    e
                ),
            },
        }
    }

    async fn on_channel_closed(&mut self) {
        tracing::warn!(
            "Channel closed for user {}, clearing trust",
            self.session.user_id()
        );
        self.connected = false;
        self.teardown().await;
        let _ = self.event_tx.send(SessionEvent::ChannelClosed);
    }

    async fn teardown(&mut self) {
        let effects = self.session.handshake_mut().channel_teardown();
        if let Err(e) = self.apply_effects(effects).await {
            tracing::debug!("Teardown notice not delivered: {}", e);
        }
    }

    /// Carry out handshake effects in order
    ///
    /// Every effect is applied even if a send fails; the first failure is
    /// returned.
    async fn apply_effects(&mut self, effects: Vec<HandshakeEffect>) -> Result<()> {
        let mut outcome = Ok(());

        for effect in effects {
            match effect {
                HandshakeEffect::Send(message) => {
                    if matches!(message, ChannelMessage::AcceptedRequestForPublicKey(_))
                        && !self.response_delay.is_zero()
                    {
                        tokio::time::sleep(self.response_delay).await;
                    }
                    if let Err(e) = self.transmit(&message).await {
                        if outcome.is_ok() {
                            outcome = Err(e);
                        }
                    }
                }
                HandshakeEffect::Established { peer } => {
                    self.emit(SessionEvent::PeerEstablished { peer });
                }
                HandshakeEffect::Declined { peer } => {
                    self.emit(SessionEvent::PeerDeclined { peer });
                }
                HandshakeEffect::Revoked { peer } => {
                    self.emit(SessionEvent::PeerRevoked { peer });
                }
            }
        }

        self.refresh_trust();
        outcome
    }

    async fn transmit(&self, message: &ChannelMessage) -> Result<()> {
        let text = message.encode()?;
        self.outbound
            .send(text)
            .await
            .map_err(|_| Error::NotConnected)
    }

    async fn send_message(&mut self, peer: UserId, text: String) -> Result<SentMessage> {
        let me = self.session.user_id();
        let permit = self.session.begin_send(peer)?;

        let worker = permit.clone();
        let (envelope, record) = tokio::task::spawn_blocking(move || {
            let envelope = worker.encrypt(&text)?;
            let record = worker.seal(&text)?;
            Ok::<_, Error>((envelope, record))
        })
        .await
        .map_err(|e| Error::Internal(format!("encrypt task failed: {}", e)))??;

        let receipt = self.archive.store(me, me, peer, record.to_stored()).await?;

        self.session.ensure_current(peer, permit.epoch())?;

        let transfer = MessageTransfer::new(receipt.id, me, peer, receipt.sent_at, &envelope);
        self.transmit(&ChannelMessage::MessageTransfer(transfer)).await?;

        tracing::debug!("Sent message {} to {}", receipt.id, peer);
        Ok(SentMessage {
            id: receipt.id,
            sent_at: receipt.sent_at,
        })
    }

    async fn receive_message(&mut self, transfer: MessageTransfer) {
        let me = self.session.user_id();
        if transfer.receiver != me {
            tracing::warn!(
                "Dropping message {} addressed to {}",
                transfer.id,
                transfer.receiver
            );
            return;
        }

        match self.accept_transfer(&transfer).await {
            Ok(message) => {
                tracing::debug!("Received message {} from {}", message.id, message.sender);
                self.emit(SessionEvent::MessageReceived(message));
            }
            Err(e) => {
                tracing::warn!(
                    "Rejected message {} from {}: {}",
                    transfer.id,
                    transfer.sender,
                    e
                );
                self.emit(SessionEvent::MessageRejected {
                    sender: transfer.sender,
                    message_id: Some(transfer.id),
                    code: e.code(),
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn accept_transfer(&mut self, transfer: &MessageTransfer) -> Result<ReceivedMessage> {
        let me = self.session.user_id();
        let permit = self.session.begin_receive(transfer.sender)?;
        let envelope = transfer.envelope()?;

        let worker = permit.clone();
        let text = tokio::task::spawn_blocking(move || worker.decrypt(&envelope))
            .await
            .map_err(|e| Error::Internal(format!("decrypt task failed: {}", e)))??;

        self.session.ensure_current(transfer.sender, permit.epoch())?;

        match permit.seal(&text) {
            Ok(record) => {
                if let Err(e) = self
                    .archive
                    .store(me, transfer.sender, me, record.to_stored())
                    .await
                {
                    tracing::warn!("Could not archive message {}: {}", transfer.id, e);
                }
            }
            Err(e) => tracing::warn!("Could not seal message {}: {}", transfer.id, e),
        }

        Ok(ReceivedMessage {
            id: transfer.id,
            sender: transfer.sender,
            receiver: me,
            sent_at: transfer.sent_at,
            text,
        })
    }

    async fn history(&self, friend: UserId) -> Result<Vec<HistoryEntry>> {
        let me = self.session.user_id();
        let rows = self.archive.retrieve(me, friend).await?;
        let bundle = Arc::clone(self.session.bundle());

        let entries = tokio::task::spawn_blocking(move || {
            rows.iter()
                .map(|row| open_row(row, &bundle))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| Error::Internal(format!("history task failed: {}", e)))?;

        let unreadable = entries
            .iter()
            .filter(|e| matches!(e, HistoryEntry::Unreadable { .. }))
            .count();
        if unreadable > 0 {
            tracing::warn!(
                "{} of {} archived messages with {} failed verification",
                unreadable,
                entries.len(),
                friend
            );
        }

        Ok(entries)
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.event_tx.send(event);
    }

    fn refresh_trust(&self) {
        let handshake = self.session.handshake();
        let mut trust = self.trust.write();
        trust.states = handshake.states();
        trust.active = handshake.active_conversation();
    }
}

fn open_row(row: &ArchivedMessage, bundle: &PasswordKeyBundle) -> HistoryEntry {
    let opened = ArchiveEncryptedRecord::from_stored(&row.record).and_then(|r| open_text(&r, bundle));

    match opened {
        Ok(text) => HistoryEntry::Verified {
            id: row.id,
            sender: row.sender_id,
            receiver: row.receiver_id,
            sent_at: row.sent_at,
            text,
        },
        Err(e) => HistoryEntry::Unreadable {
            id: row.id,
            sender: row.sender_id,
            sent_at: row.sent_at,
            code: e.code(),
            reason: e.to_string(),
        },
    }
}

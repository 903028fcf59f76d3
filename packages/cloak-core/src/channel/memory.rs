//! In-process relay connecting sessions for tests and the demo.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::ChannelEndpoint;
use crate::protocol::{peek_receiver, UserId};

type Routes = Arc<RwLock<HashMap<UserId, mpsc::Sender<String>>>>;

/// Loopback relay
///
/// Routes each frame to the user named by `data.receiverID` or
/// `data.receiver`. Frames for users who are not connected, frames with no
/// addressee, and frames for a user whose inbound queue is full are dropped.
/// The forwarder never waits on a receiver.
#[derive(Debug, Clone)]
pub struct MemoryRelay {
    routes: Routes,
    capacity: usize,
}

impl MemoryRelay {
    /// Create a relay whose queues hold `capacity` frames
    pub fn new(capacity: usize) -> Self {
        Self {
            routes: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Connect `user`, replacing any earlier connection
    ///
    /// Spawns the forwarding task, so it must be called inside a tokio
    /// runtime.
    pub fn connect(&self, user: UserId) -> ChannelEndpoint {
        let (deliver_tx, deliver_rx) = mpsc::channel(self.capacity);
        let (submit_tx, mut submit_rx) = mpsc::channel::<String>(self.capacity);

        self.routes.write().insert(user, deliver_tx);

        let routes = Arc::clone(&self.routes);
        tokio::spawn(async move {
            while let Some(frame) = submit_rx.recv().await {
                route(&routes, user, frame);
            }
            tracing::debug!("Relay forwarder for user {} stopped", user);
        });

        tracing::debug!("User {} connected to relay", user);
        ChannelEndpoint::new(submit_tx, deliver_rx)
    }

    /// Disconnect `user`; their inbound queue closes once drained
    pub fn disconnect(&self, user: UserId) -> bool {
        let removed = self.routes.write().remove(&user).is_some();
        if removed {
            tracing::debug!("User {} disconnected from relay", user);
        }
        removed
    }

    /// Whether `user` is connected
    pub fn is_connected(&self, user: UserId) -> bool {
        self.routes.read().contains_key(&user)
    }
}

fn route(routes: &Routes, from: UserId, frame: String) {
    let Some(to) = peek_receiver(&frame) else {
        tracing::debug!("Dropping frame from {} with no receiver", from);
        return;
    };

    let target = routes.read().get(&to).cloned();
    let Some(tx) = target else {
        tracing::debug!("User {} offline, frame from {} dropped", to, from);
        return;
    };

    match tx.try_send(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            tracing::warn!("Inbound queue of user {} full, frame from {} dropped", to, from)
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!("User {} went away, frame from {} dropped", to, from)
        }
    }
}

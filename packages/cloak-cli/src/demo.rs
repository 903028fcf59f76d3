//! Two sessions talking over the in-memory relay.

use std::sync::Arc;
use std::time::Duration;

use cloak_core::{
    CoreConfig, HistoryEntry, MemoryArchive, MemoryRelay, MessageArchive, Session, SessionEvent,
    SessionHandle, UserId,
};
use color_eyre::eyre::{bail, eyre, Result};
use tokio::sync::broadcast;
use tokio::time::timeout;

const ALICE: UserId = 1;
const BOB: UserId = 2;

/// How long any single step may take
const STEP_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn run(config: &CoreConfig, first: &str, reply: &str) -> Result<()> {
    let relay = MemoryRelay::new(config.channel_capacity);
    let archive = Arc::new(MemoryArchive::new());

    println!("Logging in alice and bob (generating session keys)...");
    let (alice, bob) = tokio::try_join!(
        Session::login(ALICE, "alice-password", b"alice-salt"),
        Session::login(BOB, "bob-password", b"bob-salt"),
    )?;

    let alice = spawn(alice, &relay, &archive, config);
    let bob = spawn(bob, &relay, &archive, config);
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    // bob is already looking at the conversation when alice opens it
    bob.open_conversation(ALICE).await?;
    wait_until("alice to hold bob's key", || alice.is_secured(BOB)).await?;
    alice.open_conversation(BOB).await?;
    wait_until("the handshake", || alice.is_secured(BOB) && bob.is_secured(ALICE)).await?;
    println!("Handshake complete: both sides established");

    let sent = alice.send_message(BOB, first).await?;
    let received = next_message(&mut bob_events).await?;
    println!("bob   <- alice  #{}: {}", sent.id, received);

    let sent = bob.send_message(ALICE, reply).await?;
    let received = next_message(&mut alice_events).await?;
    println!("alice <- bob    #{}: {}", sent.id, received);

    wait_until("both archives", || {
        archive.len_for(ALICE) == 2 && archive.len_for(BOB) == 2
    })
    .await?;

    for (name, handle, friend) in [("alice", &alice, BOB), ("bob", &bob, ALICE)] {
        println!("{}'s archive:", name);
        for entry in handle.history(friend).await? {
            match entry {
                HistoryEntry::Verified { id, sender, text, .. } => {
                    println!("  #{} from {}: {}", id, sender, text)
                }
                HistoryEntry::Unreadable { id, reason, .. } => {
                    println!("  #{} unreadable: {}", id, reason)
                }
            }
        }
    }

    alice.close_conversation().await?;
    wait_until("bob to drop alice's key", || !bob.is_secured(ALICE)).await?;
    println!("Conversation closed: bob no longer trusts alice's key");

    alice.shutdown().await?;
    bob.shutdown().await?;
    Ok(())
}

fn spawn(
    session: Session,
    relay: &MemoryRelay,
    archive: &Arc<MemoryArchive>,
    config: &CoreConfig,
) -> SessionHandle {
    let channel = relay.connect(session.user_id());
    let archive: Arc<dyn MessageArchive> = archive.clone();
    SessionHandle::spawn(session, channel, archive, config)
}

async fn wait_until(what: &str, check: impl Fn() -> bool) -> Result<()> {
    timeout(STEP_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| eyre!("timed out waiting for {}", what))
}

async fn next_message(events: &mut broadcast::Receiver<SessionEvent>) -> Result<String> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::MessageReceived(message)) => return Ok(message.text),
                Ok(SessionEvent::MessageRejected { reason, .. }) => {
                    bail!("message rejected: {}", reason)
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => bail!("session stopped"),
            }
        }
    };

    timeout(STEP_TIMEOUT, wait)
        .await
        .map_err(|_| eyre!("timed out waiting for a message"))?
}

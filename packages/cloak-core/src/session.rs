//! # Session
//!
//! Everything one logged-in user holds: the session key pair, the archive
//! bundle and the handshake state.
//!
//! ## Lifecycle
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SESSION LIFECYCLE                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  login(user, password, salt)                                           │
//! │     ├── AsymmetricKeyPair::generate()      (blocking pool)             │
//! │     └── PasswordKeyBundle::derive()        (blocking pool)             │
//! │                                                                         │
//! │  resume(user, bundle)   bundle from the BundleStore, fresh key pair    │
//! │                                                                         │
//! │  logout(self)           consumes the session; keys are zeroized on     │
//! │                         drop and trust state goes with it              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Permits
//!
//! Cryptographic work runs outside the session borrow. A permit captures
//! what the work needs plus the peer's epoch at the start; the result is
//! committed only if [`Session::ensure_current`] still agrees afterwards.

use std::sync::Arc;

use crate::crypto::{
    self, AsymmetricKeyPair, ArchiveEncryptedRecord, LiveEncryptedEnvelope, PasswordKeyBundle,
    PeerPublicKey, PortableKey,
};
use crate::error::{Error, Result};
use crate::handshake::Handshake;
use crate::protocol::UserId;
use crate::storage::BundleStore;

/// State of one logged-in user
#[derive(Debug)]
pub struct Session {
    user_id: UserId,
    keys: Arc<AsymmetricKeyPair>,
    bundle: Arc<PasswordKeyBundle>,
    handshake: Handshake,
}

impl Session {
    /// Log in: generate the session key pair and derive the archive bundle
    ///
    /// ## Errors
    ///
    /// - `KeyGenerationFailure` (fatal) if no key pair can be made
    /// - `KeyDerivationFailed` if the bundle cannot be derived
    pub async fn login(user_id: UserId, password: &str, salt: &[u8]) -> Result<Self> {
        let password = zeroize::Zeroizing::new(password.to_string());
        let salt = salt.to_vec();

        let keys = tokio::task::spawn_blocking(AsymmetricKeyPair::generate);
        let bundle =
            tokio::task::spawn_blocking(move || PasswordKeyBundle::derive(&password, &salt));

        let keys = keys
            .await
            .map_err(|e| Error::KeyGenerationFailure(format!("key task failed: {}", e)))??;
        let bundle = bundle
            .await
            .map_err(|e| Error::KeyDerivationFailed(format!("derivation task failed: {}", e)))??;

        tracing::info!("User {} logged in", user_id);
        Ok(Self::from_parts(user_id, Arc::new(keys), Arc::new(bundle)))
    }

    /// Resume with a previously derived bundle
    pub async fn resume(user_id: UserId, bundle: PasswordKeyBundle) -> Result<Self> {
        let keys = tokio::task::spawn_blocking(AsymmetricKeyPair::generate)
            .await
            .map_err(|e| Error::KeyGenerationFailure(format!("key task failed: {}", e)))??;

        tracing::info!("User {} resumed with stored bundle", user_id);
        Ok(Self::from_parts(user_id, Arc::new(keys), Arc::new(bundle)))
    }

    /// Resume from a bundle store, if it still holds a live bundle
    pub async fn restore(user_id: UserId, store: &BundleStore) -> Result<Option<Self>> {
        match store.load(user_id)? {
            Some(bundle) => Self::resume(user_id, bundle).await.map(Some),
            None => Ok(None),
        }
    }

    /// Assemble a session from existing parts
    pub fn from_parts(
        user_id: UserId,
        keys: Arc<AsymmetricKeyPair>,
        bundle: Arc<PasswordKeyBundle>,
    ) -> Self {
        let handshake = Handshake::new(user_id, keys.export_public_key());
        Self {
            user_id,
            keys,
            bundle,
            handshake,
        }
    }

    /// End the session
    ///
    /// Dropping the session wipes the private key and the bundle; the
    /// handshake table goes with it.
    pub fn logout(self) {
        tracing::info!("User {} logged out", self.user_id);
    }

    /// Our user id
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Our public key in portable form
    pub fn public_key_export(&self) -> PortableKey {
        self.keys.export_public_key()
    }

    /// The archive bundle
    pub fn bundle(&self) -> &Arc<PasswordKeyBundle> {
        &self.bundle
    }

    /// Handshake state
    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// Handshake state, mutably
    pub fn handshake_mut(&mut self) -> &mut Handshake {
        &mut self.handshake
    }

    /// Start sending to `peer`
    ///
    /// ## Errors
    ///
    /// `NotSecured` unless the conversation is `Established`.
    pub fn begin_send(&self, peer: UserId) -> Result<SendPermit> {
        let (key, epoch) = self.handshake.require_established(peer)?;
        Ok(SendPermit {
            peer,
            epoch,
            peer_key: key.clone(),
            bundle: Arc::clone(&self.bundle),
        })
    }

    /// Start receiving from `sender`
    ///
    /// Messages are accepted from peers we have a live conversation with,
    /// whether or not their key has reached us yet.
    ///
    /// ## Errors
    ///
    /// `NotSecured` if there is no conversation with `sender`.
    pub fn begin_receive(&self, sender: UserId) -> Result<ReceivePermit> {
        let epoch = self.handshake.require_live(sender)?;
        Ok(ReceivePermit {
            peer: sender,
            epoch,
            keys: Arc::clone(&self.keys),
            bundle: Arc::clone(&self.bundle),
        })
    }

    /// Check that trust for `peer` has not changed since `epoch`
    ///
    /// ## Errors
    ///
    /// `StaleResult` if the peer was closed, revoked or re-keyed meanwhile.
    pub fn ensure_current(&self, peer: UserId, epoch: u64) -> Result<()> {
        if self.handshake.is_current(peer, epoch) {
            Ok(())
        } else {
            Err(Error::StaleResult(peer))
        }
    }

    /// Seal text for our own archive
    pub fn seal_for_archive(&self, text: &str) -> Result<ArchiveEncryptedRecord> {
        crypto::seal(text.as_bytes(), &self.bundle)
    }

    /// Open one of our archived records
    pub fn open_archived(&self, record: &ArchiveEncryptedRecord) -> Result<String> {
        open_text(record, &self.bundle)
    }
}

/// Capability to encrypt one message to an established peer
#[derive(Debug, Clone)]
pub struct SendPermit {
    peer: UserId,
    epoch: u64,
    peer_key: PeerPublicKey,
    bundle: Arc<PasswordKeyBundle>,
}

impl SendPermit {
    /// Target peer
    pub fn peer(&self) -> UserId {
        self.peer
    }

    /// Epoch the permit was issued under
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Encrypt for the live channel
    pub fn encrypt(&self, text: &str) -> Result<LiveEncryptedEnvelope> {
        crypto::encrypt_for_peer(text.as_bytes(), &self.peer_key)
    }

    /// Seal our own archive copy
    pub fn seal(&self, text: &str) -> Result<ArchiveEncryptedRecord> {
        crypto::seal(text.as_bytes(), &self.bundle)
    }
}

/// Capability to decrypt one message from a peer
#[derive(Debug, Clone)]
pub struct ReceivePermit {
    peer: UserId,
    epoch: u64,
    keys: Arc<AsymmetricKeyPair>,
    bundle: Arc<PasswordKeyBundle>,
}

impl ReceivePermit {
    /// Sending peer
    pub fn peer(&self) -> UserId {
        self.peer
    }

    /// Epoch the permit was issued under
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Decrypt and verify, then check the bytes are text
    ///
    /// ## Errors
    ///
    /// - `DecryptionFailed` / `IntegrityCheckFailed` from the cipher
    /// - `InvalidMessageContent` if the verified bytes are not UTF-8
    pub fn decrypt(&self, envelope: &LiveEncryptedEnvelope) -> Result<String> {
        let plaintext = crypto::decrypt_from_peer(envelope, &self.keys)?;
        String::from_utf8(plaintext)
            .map_err(|_| Error::InvalidMessageContent("message is not UTF-8".into()))
    }

    /// Seal our archive copy of the received text
    pub fn seal(&self, text: &str) -> Result<ArchiveEncryptedRecord> {
        crypto::seal(text.as_bytes(), &self.bundle)
    }
}

/// Open an archived record as text
pub(crate) fn open_text(record: &ArchiveEncryptedRecord, bundle: &PasswordKeyBundle) -> Result<String> {
    let plaintext = crypto::open(record, bundle)?;
    String::from_utf8(plaintext)
        .map_err(|_| Error::InvalidMessageContent("archived message is not UTF-8".into()))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::HandshakeEffect;
    use crate::protocol::ChannelMessage;
    use once_cell::sync::Lazy;
    use std::time::Duration;

    static ALICE_KEYS: Lazy<Arc<AsymmetricKeyPair>> =
        Lazy::new(|| Arc::new(AsymmetricKeyPair::generate().unwrap()));
    static BOB_KEYS: Lazy<Arc<AsymmetricKeyPair>> =
        Lazy::new(|| Arc::new(AsymmetricKeyPair::generate().unwrap()));

    fn session(id: UserId, keys: &Lazy<Arc<AsymmetricKeyPair>>, seed: u8) -> Session {
        Session::from_parts(
            id,
            Arc::clone(keys),
            Arc::new(PasswordKeyBundle::from_keys([seed; 32], [seed + 1; 32])),
        )
    }

    fn exchange(a: &mut Session, b: &mut Session) {
        b.handshake_mut().open_conversation(a.user_id());
        let request = a.handshake_mut().open_conversation(b.user_id());
        for effect in request {
            if let HandshakeEffect::Send(m) = effect {
                for reply in b.handshake_mut().handle(&m).unwrap() {
                    if let HandshakeEffect::Send(r) = reply {
                        a.handshake_mut().handle(&r).unwrap();
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_login_derives_deterministic_bundle() {
        let first = Session::login(1, "pw", b"salt").await.unwrap();
        let second = Session::login(1, "pw", b"salt").await.unwrap();

        assert_eq!(first.bundle().as_ref(), second.bundle().as_ref());
        assert_ne!(first.public_key_export(), second.public_key_export());

        let record = first.seal_for_archive("kept across logins").unwrap();
        assert_eq!(second.open_archived(&record).unwrap(), "kept across logins");
    }

    #[tokio::test]
    async fn test_restore_from_store() {
        let store = BundleStore::in_memory(Duration::from_secs(60));
        assert!(Session::restore(4, &store).await.unwrap().is_none());

        let bundle = PasswordKeyBundle::from_keys([1u8; 32], [2u8; 32]);
        store.save(4, &bundle).unwrap();

        let session = Session::restore(4, &store).await.unwrap().unwrap();
        assert_eq!(session.bundle().as_ref(), &bundle);
        session.logout();
    }

    #[test]
    fn test_send_requires_established() {
        let mut a = session(1, &ALICE_KEYS, 10);
        assert!(matches!(a.begin_send(2), Err(Error::NotSecured(2))));

        a.handshake_mut().open_conversation(2);
        assert!(matches!(a.begin_send(2), Err(Error::NotSecured(2))));
    }

    #[test]
    fn test_live_round_trip_through_permits() {
        let mut a = session(1, &ALICE_KEYS, 10);
        let mut b = session(2, &BOB_KEYS, 20);
        exchange(&mut a, &mut b);

        let send = a.begin_send(2).unwrap();
        let envelope = send.encrypt("hi bob").unwrap();
        a.ensure_current(2, send.epoch()).unwrap();

        let receive = b.begin_receive(1).unwrap();
        assert_eq!(receive.decrypt(&envelope).unwrap(), "hi bob");
        b.ensure_current(1, receive.epoch()).unwrap();

        // each side seals under its own bundle
        let a_copy = send.seal("hi bob").unwrap();
        let b_copy = receive.seal("hi bob").unwrap();
        assert_eq!(a.open_archived(&a_copy).unwrap(), "hi bob");
        assert_eq!(b.open_archived(&b_copy).unwrap(), "hi bob");
        assert!(b.open_archived(&a_copy).is_err());
    }

    #[test]
    fn test_result_discarded_after_close() {
        let mut a = session(1, &ALICE_KEYS, 10);
        let mut b = session(2, &BOB_KEYS, 20);
        exchange(&mut a, &mut b);

        let permit = a.begin_send(2).unwrap();
        let _envelope = permit.encrypt("in flight").unwrap();

        a.handshake_mut().close_conversation();
        assert!(matches!(
            a.ensure_current(2, permit.epoch()),
            Err(Error::StaleResult(2))
        ));
    }

    #[test]
    fn test_decrypt_discarded_after_revoke() {
        let mut a = session(1, &ALICE_KEYS, 10);
        let mut b = session(2, &BOB_KEYS, 20);
        exchange(&mut a, &mut b);

        let permit = b.begin_receive(1).unwrap();

        let delete = ChannelMessage::RequestToDeletePublicKey(crate::protocol::KeyDeletion {
            sender_id: 1,
            receiver_id: 2,
        });
        b.handshake_mut().handle(&delete).unwrap();

        assert!(b.ensure_current(1, permit.epoch()).is_err());
        assert!(matches!(b.begin_receive(1), Err(Error::NotSecured(1))));
    }

    #[test]
    fn test_non_text_plaintext_rejected() {
        let mut a = session(1, &ALICE_KEYS, 10);
        let mut b = session(2, &BOB_KEYS, 20);
        exchange(&mut a, &mut b);

        let envelope = crypto::encrypt_for_peer(&[0xff, 0xfe], BOB_KEYS.public_key()).unwrap();
        let permit = b.begin_receive(1).unwrap();

        assert!(matches!(
            permit.decrypt(&envelope),
            Err(Error::InvalidMessageContent(_))
        ));
    }
}

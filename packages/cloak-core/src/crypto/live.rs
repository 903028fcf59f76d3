//! # Live Message Cipher
//!
//! Protects messages in transit between two online peers.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     LIVE MESSAGE ENCRYPTION                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  SENDER                                                                │
//! │  ──────                                                                 │
//! │  1. auth_key   = 32 random bytes (fresh for every message)             │
//! │  2. auth_tag   = HMAC-SHA256(auth_key, plaintext)                      │
//! │  3. ciphertext = RSA-OAEP-SHA256(peer_public, plaintext)               │
//! │  4. enc_auth   = RSA-OAEP-SHA256(peer_public, auth_key)                │
//! │                                                                         │
//! │  Output: LiveEncryptedEnvelope { ciphertext, enc_auth, auth_tag }      │
//! │                                                                         │
//! │  RECIPIENT                                                             │
//! │  ─────────                                                              │
//! │  1. plaintext = RSA-OAEP-decrypt(own_private, ciphertext)              │
//! │  2. auth_key  = RSA-OAEP-decrypt(own_private, enc_auth)                │
//! │  3. verify HMAC-SHA256(auth_key, plaintext) == auth_tag                │
//! │     (constant time; plaintext is wiped and never returned on failure)  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! RSA-OAEP with a 2048-bit modulus and SHA-256 carries at most
//! [`MAX_LIVE_PAYLOAD`] bytes per block. Larger payloads are refused
//! with `PayloadTooLarge` rather than split.

use rand::{rngs::OsRng, RngCore};
use rsa::Oaep;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

use super::keys::{AsymmetricKeyPair, PeerPublicKey};
use super::mac::{hmac_sha256, verify_hmac_sha256};

/// Size of the one-time authentication key in bytes
pub const AUTH_KEY_SIZE: usize = 32;

/// Largest plaintext that fits one RSA-2048 OAEP-SHA256 block
///
/// `k - 2 * hLen - 2` = 256 - 64 - 2
pub const MAX_LIVE_PAYLOAD: usize = 190;

/// Wire-level protected form of one live message
///
/// Produced once per send and never reused. There is no IV: RSA-OAEP
/// pads each block with fresh randomness, so the same plaintext never
/// encrypts to the same ciphertext twice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveEncryptedEnvelope {
    /// RSA-OAEP ciphertext of the plaintext
    pub ciphertext: Vec<u8>,
    /// RSA-OAEP ciphertext of the one-time HMAC key
    pub encrypted_auth_key: Vec<u8>,
    /// HMAC-SHA256 of the plaintext under the one-time key
    pub auth_tag: Vec<u8>,
}

/// Encrypt a message to a peer's public key
///
/// ## Errors
///
/// - `PayloadTooLarge` if `plaintext` exceeds [`MAX_LIVE_PAYLOAD`]
/// - `EncryptionFailed` if RSA encryption fails
pub fn encrypt_for_peer(plaintext: &[u8], peer: &PeerPublicKey) -> Result<LiveEncryptedEnvelope> {
    if plaintext.len() > MAX_LIVE_PAYLOAD {
        return Err(Error::PayloadTooLarge {
            len: plaintext.len(),
            max: MAX_LIVE_PAYLOAD,
        });
    }

    let mut auth_key = Zeroizing::new([0u8; AUTH_KEY_SIZE]);
    OsRng.fill_bytes(&mut auth_key[..]);

    let auth_tag = hmac_sha256(&auth_key[..], plaintext)?;

    let ciphertext = peer
        .as_rsa()
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| Error::EncryptionFailed(format!("message: {}", e)))?;

    let encrypted_auth_key = peer
        .as_rsa()
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &auth_key[..])
        .map_err(|e| Error::EncryptionFailed(format!("auth key: {}", e)))?;

    Ok(LiveEncryptedEnvelope {
        ciphertext,
        encrypted_auth_key,
        auth_tag: auth_tag.to_vec(),
    })
}

/// Decrypt and verify a message addressed to us
///
/// ## Errors
///
/// - `DecryptionFailed` if either RSA block does not decrypt under our key
/// - `IntegrityCheckFailed` if the tag does not match the plaintext
pub fn decrypt_from_peer(envelope: &LiveEncryptedEnvelope, keypair: &AsymmetricKeyPair) -> Result<Vec<u8>> {
    let private = keypair.private_key();

    let mut plaintext = Zeroizing::new(
        private
            .decrypt(Oaep::new::<Sha256>(), &envelope.ciphertext)
            .map_err(|_| Error::DecryptionFailed("message block".into()))?,
    );

    let auth_key = Zeroizing::new(
        private
            .decrypt(Oaep::new::<Sha256>(), &envelope.encrypted_auth_key)
            .map_err(|_| Error::DecryptionFailed("auth key block".into()))?,
    );

    verify_hmac_sha256(&auth_key, &plaintext, &envelope.auth_tag)?;

    Ok(std::mem::take(&mut *plaintext))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;

    static ALICE: Lazy<AsymmetricKeyPair> = Lazy::new(|| AsymmetricKeyPair::generate().unwrap());
    static BOB: Lazy<AsymmetricKeyPair> = Lazy::new(|| AsymmetricKeyPair::generate().unwrap());

    #[test]
    fn test_encrypt_decrypt() {
        let envelope = encrypt_for_peer(b"hello bob", BOB.public_key()).unwrap();
        let plaintext = decrypt_from_peer(&envelope, &BOB).unwrap();

        assert_eq!(plaintext, b"hello bob");
        assert_eq!(envelope.auth_tag.len(), 32);
    }

    #[test]
    fn test_each_send_is_fresh() {
        let a = encrypt_for_peer(b"same", BOB.public_key()).unwrap();
        let b = encrypt_for_peer(b"same", BOB.public_key()).unwrap();

        assert_ne!(a.ciphertext, b.ciphertext);
        assert_ne!(a.encrypted_auth_key, b.encrypted_auth_key);
        assert_ne!(a.auth_tag, b.auth_tag);
    }

    #[test]
    fn test_wrong_recipient_fails() {
        let envelope = encrypt_for_peer(b"for bob", BOB.public_key()).unwrap();

        assert!(matches!(
            decrypt_from_peer(&envelope, &ALICE),
            Err(Error::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_tampered_tag_fails() {
        let mut envelope = encrypt_for_peer(b"hello", BOB.public_key()).unwrap();
        envelope.auth_tag[0] ^= 0x01;

        assert!(matches!(
            decrypt_from_peer(&envelope, &BOB),
            Err(Error::IntegrityCheckFailed)
        ));
    }

    #[test]
    fn test_swapped_auth_key_fails() {
        let mut first = encrypt_for_peer(b"one", BOB.public_key()).unwrap();
        let second = encrypt_for_peer(b"one", BOB.public_key()).unwrap();
        first.encrypted_auth_key = second.encrypted_auth_key;

        assert!(matches!(
            decrypt_from_peer(&first, &BOB),
            Err(Error::IntegrityCheckFailed)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let mut envelope = encrypt_for_peer(b"hello", BOB.public_key()).unwrap();
        envelope.ciphertext[10] ^= 0xff;

        let err = decrypt_from_peer(&envelope, &BOB).unwrap_err();
        assert!(err.is_integrity_failure());
    }

    #[test]
    fn test_payload_limit() {
        let max = vec![b'a'; MAX_LIVE_PAYLOAD];
        let envelope = encrypt_for_peer(&max, BOB.public_key()).unwrap();
        assert_eq!(decrypt_from_peer(&envelope, &BOB).unwrap(), max);

        let too_big = vec![b'a'; MAX_LIVE_PAYLOAD + 1];
        assert!(matches!(
            encrypt_for_peer(&too_big, BOB.public_key()),
            Err(Error::PayloadTooLarge { len: 191, max: 190 })
        ));
    }

    #[test]
    fn test_empty_message() {
        let envelope = encrypt_for_peer(b"", BOB.public_key()).unwrap();
        assert!(decrypt_from_peer(&envelope, &BOB).unwrap().is_empty());
    }
}

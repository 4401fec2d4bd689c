//! Per-recipient sealed frames for the gossip transport
//!
//! Gossip floods every frame to every topic member, so each payload is
//! encrypted for exactly one recipient and carries both parties' keys in the
//! clear for routing.
//!
//! ## Key Agreement
//!
//! ```text
//! node identity:  ed25519 seed (the iroh secret key)
//! x25519 secret:  scalar bytes of the ed25519 signing key
//! x25519 public:  Montgomery form of the ed25519 verifying key
//!
//! shared  = X25519(own secret, peer public)
//! key     = BLAKE3-derive-key(FRAME_KEY_CONTEXT, shared || topic)
//! frame   = ChaCha20-Poly1305(key, nonce, plaintext, aad = sender || recipient)
//! ```
//!
//! Both sides derive the same key from the static keys alone, so a frame that
//! opens is proof that its claimed sender produced it.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use crate::error::{ChatError, ChatResult};
use crate::types::{PeerKey, TopicId};

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Domain separation for frame key derivation
const FRAME_KEY_CONTEXT: &str = "swarmchat 2026-10 gossip frame key";

/// A frame as broadcast on a gossip topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedFrame {
    pub sender: [u8; 32],
    pub recipient: [u8; 32],
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

impl SealedFrame {
    pub fn to_bytes(&self) -> ChatResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ChatResult<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }

    fn aad(&self) -> [u8; 64] {
        let mut aad = [0u8; 64];
        aad[..32].copy_from_slice(&self.sender);
        aad[32..].copy_from_slice(&self.recipient);
        aad
    }
}

/// Seals and opens frames for one node identity
pub struct FrameSealer {
    secret: X25519StaticSecret,
    public: PeerKey,
}

impl FrameSealer {
    /// Build from a 32-byte ed25519 seed (an iroh secret key)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(seed);
        Self {
            secret: X25519StaticSecret::from(signing.to_scalar_bytes()),
            public: PeerKey::from_bytes(signing.verifying_key().to_bytes()),
        }
    }

    pub fn public_key(&self) -> PeerKey {
        self.public
    }

    /// Encrypt `plaintext` for `recipient` on `topic`
    pub fn seal(&self, recipient: PeerKey, topic: TopicId, plaintext: &[u8]) -> ChatResult<SealedFrame> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);

        let mut frame = SealedFrame {
            sender: *self.public.as_bytes(),
            recipient: *recipient.as_bytes(),
            nonce,
            ciphertext: Vec::new(),
        };

        let key = self.frame_key(&recipient, topic)?;
        let cipher = ChaCha20Poly1305::new((&key).into());
        frame.ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &frame.aad(),
                },
            )
            .map_err(|e| ChatError::Crypto(format!("Encryption failed: {}", e)))?;

        Ok(frame)
    }

    /// Decrypt a frame addressed to us.
    ///
    /// Returns `Ok(None)` for frames addressed to someone else and an error
    /// for frames addressed to us that fail authentication.
    pub fn open(&self, topic: TopicId, frame: &SealedFrame) -> ChatResult<Option<(PeerKey, Vec<u8>)>> {
        if frame.recipient != *self.public.as_bytes() {
            return Ok(None);
        }

        let sender = PeerKey::from_bytes(frame.sender);
        let key = self.frame_key(&sender, topic)?;
        let cipher = ChaCha20Poly1305::new((&key).into());
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&frame.nonce),
                Payload {
                    msg: &frame.ciphertext,
                    aad: &frame.aad(),
                },
            )
            .map_err(|e| ChatError::Crypto(format!("Decryption failed: {}", e)))?;

        Ok(Some((sender, plaintext)))
    }

    fn frame_key(&self, peer: &PeerKey, topic: TopicId) -> ChatResult<[u8; 32]> {
        let shared = self.secret.diffie_hellman(&x25519_public(peer)?);
        if !shared.was_contributory() {
            return Err(ChatError::Crypto("Low-order peer key".into()));
        }

        let mut material = [0u8; 64];
        material[..32].copy_from_slice(shared.as_bytes());
        material[32..].copy_from_slice(topic.as_bytes());
        Ok(blake3::derive_key(FRAME_KEY_CONTEXT, &material))
    }
}

fn x25519_public(peer: &PeerKey) -> ChatResult<X25519PublicKey> {
    let verifying = VerifyingKey::from_bytes(peer.as_bytes())
        .map_err(|e| ChatError::Crypto(format!("Invalid peer key: {}", e)))?;
    Ok(X25519PublicKey::from(verifying.to_montgomery().to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealer() -> FrameSealer {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        FrameSealer::from_seed(&seed)
    }

    #[test]
    fn test_seal_open() {
        let alice = sealer();
        let bob = sealer();
        let topic = TopicId::random();

        let frame = alice.seal(bob.public_key(), topic, b"hello bob").unwrap();
        let bytes = frame.to_bytes().unwrap();
        let parsed = SealedFrame::from_bytes(&bytes).unwrap();

        let (sender, plaintext) = bob.open(topic, &parsed).unwrap().unwrap();
        assert_eq!(sender, alice.public_key());
        assert_eq!(plaintext, b"hello bob");
    }

    #[test]
    fn test_frame_for_someone_else_is_skipped() {
        let alice = sealer();
        let bob = sealer();
        let carol = sealer();
        let topic = TopicId::random();

        let frame = alice.seal(bob.public_key(), topic, b"for bob").unwrap();
        assert!(carol.open(topic, &frame).unwrap().is_none());
    }

    #[test]
    fn test_forged_sender_fails() {
        let alice = sealer();
        let bob = sealer();
        let mallory = sealer();
        let topic = TopicId::random();

        let mut frame = mallory.seal(bob.public_key(), topic, b"trust me").unwrap();
        frame.sender = *alice.public_key().as_bytes();

        assert!(matches!(bob.open(topic, &frame), Err(ChatError::Crypto(_))));
    }

    #[test]
    fn test_wrong_topic_fails() {
        let alice = sealer();
        let bob = sealer();

        let frame = alice.seal(bob.public_key(), TopicId::random(), b"x").unwrap();
        assert!(bob.open(TopicId::random(), &frame).is_err());
    }

    #[test]
    fn test_public_key_matches_seed() {
        let seed = [9u8; 32];
        let a = FrameSealer::from_seed(&seed);
        let b = FrameSealer::from_seed(&seed);
        assert_eq!(a.public_key(), b.public_key());
    }
}

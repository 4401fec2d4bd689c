//! Core types for swarmchat
//!
//! Identifiers are fixed 32-byte values whose canonical form (map keys,
//! wire format, display) is lowercase hex.

use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ChatError, ChatResult};

mod action;
mod contact;
mod conversation;
mod profile;

pub use action::{Action, ActionData, ActionState};
pub use contact::{Contact, ContactRequest, ContactState};
pub use conversation::{Conversation, ConversationKind, Message, MessageBlock, MessageSource};
pub use profile::{PeerInfo, Profile};

fn parse_hex_32(s: &str, what: &str) -> ChatResult<[u8; 32]> {
    let bytes = hex::decode(s)
        .map_err(|e| ChatError::Serialization(format!("Invalid {} hex: {}", what, e)))?;
    bytes
        .try_into()
        .map_err(|_| ChatError::Serialization(format!("{} must be 32 bytes", what)))
}

macro_rules! hex_id {
    ($(#[$meta:meta])* $name:ident, $what:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Create from raw bytes
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Get the raw bytes
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Canonical lowercase hex form
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse the canonical hex form
            pub fn from_hex(s: &str) -> ChatResult<Self> {
                parse_hex_32(s, $what).map(Self)
            }

            /// First eight hex characters, for log lines
            pub fn short(&self) -> String {
                hex::encode(&self.0[..4])
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }

        impl FromStr for $name {
            type Err = ChatError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_id!(
    /// Identifier of a pub/sub topic
    ///
    /// Either derived by hashing a human-readable name (contact topics) or
    /// drawn at random (direct and channel topics).
    TopicId,
    "topic id"
);

hex_id!(
    /// Public key of a peer, as handed out by the transport
    PeerKey,
    "peer key"
);

impl TopicId {
    /// Create a new random topic
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive a topic from a human-readable name with BLAKE3
    pub fn from_name(name: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(name.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }
}

impl PeerKey {
    /// Create a random key (loopback network identities and tests)
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

//! Wire protocol: event kinds and the nonce-tagged envelope
//!
//! ## Wire Format
//!
//! Every message published on a topic is a JSON envelope, encrypted by the
//! transport for its single recipient:
//!
//! ```text
//! {
//!   "nonce": "9f2c01aa7be04d13",          // 8 random bytes, hex
//!   "payload": {
//!     "type": "TOPIC_MESSAGE",            // event kind
//!     "payload": { "blocks": [...] }      // kind-specific body
//!   }
//! }
//! ```
//!
//! The nonce is the de-duplication key: the transport delivers at least
//! once, so the [`EnvelopeCodec`] drops any envelope whose nonce it has
//! already accepted.
//!
//! ## Event kinds
//!
//! | kind              | legal on               |
//! |-------------------|------------------------|
//! | CONTACT_REQUEST   | contact topic          |
//! | CHANNEL_INVITE    | direct topic           |
//! | PROFILE_REQUEST   | channel                |
//! | PROFILE_RESPONSE  | channel                |
//! | TOPIC_JOINED      | direct, channel        |
//! | TOPIC_MESSAGE     | direct, channel        |
//! | TOPIC_TYPING      | direct, channel        |
//! | ACTION_STATE      | direct, channel        |
//!
//! Kinds arriving on a topic class where they are not legal are logged and
//! ignored by the receiver.

pub mod envelope;
pub mod events;

pub use envelope::{Decoded, EnvelopeCodec, NonceRegistry, NONCE_LEN};
pub use events::{
    ActionStatePayload, ChannelInvitePayload, ContactRequestPayload, ProfileRequestPayload,
    ProfileResponsePayload, ProtocolEvent, TopicClass, TopicJoinedPayload, TopicMessagePayload,
    TopicTypingPayload,
};

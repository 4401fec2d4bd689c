//! Protocol event kinds and their payloads

use serde::{Deserialize, Serialize};

use crate::types::{ActionState, MessageBlock, PeerInfo, Profile, TopicId};

/// Class of topic an event arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicClass {
    /// A peer's own contact topic (unsolicited requests only)
    Contact,
    /// Two-party conversation topic
    Direct,
    /// N-party channel topic
    Channel,
}

impl std::fmt::Display for TopicClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopicClass::Contact => f.write_str("contact"),
            TopicClass::Direct => f.write_str("direct"),
            TopicClass::Channel => f.write_str("channel"),
        }
    }
}

/// Request to open a direct conversation on `topic`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactRequestPayload {
    #[serde(default)]
    pub address: String,
    pub profile: Profile,
    pub topic: TopicId,
}

/// Invitation to a channel, sent over a direct topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInvitePayload {
    pub topic: TopicId,
    pub subject: String,
    /// Channel members, creator first
    pub peers: Vec<PeerInfo>,
    #[serde(default)]
    pub dark: bool,
}

/// Ask the recipient for its profile
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProfileRequestPayload {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileResponsePayload {
    pub profile: Profile,
}

/// Announces that the sender joined the topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicJoinedPayload {
    /// Empty in dark channels
    #[serde(default)]
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicMessagePayload {
    pub blocks: Vec<MessageBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicTypingPayload {
    pub typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStatePayload {
    pub id: String,
    pub state: ActionState,
}

/// A decoded protocol event
///
/// Serialized adjacently tagged: `{"type": "TOPIC_MESSAGE", "payload": {...}}`.
/// [`ProtocolEvent::Unknown`] is produced by the decoder for kinds this
/// version does not know and is never put on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolEvent {
    ContactRequest(ContactRequestPayload),
    ChannelInvite(ChannelInvitePayload),
    ProfileRequest(ProfileRequestPayload),
    ProfileResponse(ProfileResponsePayload),
    TopicJoined(TopicJoinedPayload),
    TopicMessage(TopicMessagePayload),
    TopicTyping(TopicTypingPayload),
    ActionState(ActionStatePayload),
    #[serde(skip)]
    Unknown { kind: String },
}

impl ProtocolEvent {
    /// Wire names of every kind this version understands
    pub const KNOWN_KINDS: [&'static str; 8] = [
        "CONTACT_REQUEST",
        "CHANNEL_INVITE",
        "PROFILE_REQUEST",
        "PROFILE_RESPONSE",
        "TOPIC_JOINED",
        "TOPIC_MESSAGE",
        "TOPIC_TYPING",
        "ACTION_STATE",
    ];

    /// Wire name of this event's kind
    pub fn kind(&self) -> &str {
        match self {
            ProtocolEvent::ContactRequest(_) => "CONTACT_REQUEST",
            ProtocolEvent::ChannelInvite(_) => "CHANNEL_INVITE",
            ProtocolEvent::ProfileRequest(_) => "PROFILE_REQUEST",
            ProtocolEvent::ProfileResponse(_) => "PROFILE_RESPONSE",
            ProtocolEvent::TopicJoined(_) => "TOPIC_JOINED",
            ProtocolEvent::TopicMessage(_) => "TOPIC_MESSAGE",
            ProtocolEvent::TopicTyping(_) => "TOPIC_TYPING",
            ProtocolEvent::ActionState(_) => "ACTION_STATE",
            ProtocolEvent::Unknown { kind } => kind,
        }
    }

    /// Whether this kind may appear on a topic of `class`
    pub fn is_legal_on(&self, class: TopicClass) -> bool {
        match self {
            ProtocolEvent::ContactRequest(_) => class == TopicClass::Contact,
            ProtocolEvent::ChannelInvite(_) => class == TopicClass::Direct,
            ProtocolEvent::ProfileRequest(_) | ProtocolEvent::ProfileResponse(_) => {
                class == TopicClass::Channel
            }
            ProtocolEvent::TopicJoined(_)
            | ProtocolEvent::TopicMessage(_)
            | ProtocolEvent::TopicTyping(_)
            | ProtocolEvent::ActionState(_) => class != TopicClass::Contact,
            ProtocolEvent::Unknown { .. } => false,
        }
    }

    pub fn profile_request() -> Self {
        ProtocolEvent::ProfileRequest(ProfileRequestPayload {})
    }

    pub fn topic_message(blocks: Vec<MessageBlock>) -> Self {
        ProtocolEvent::TopicMessage(TopicMessagePayload { blocks })
    }

    pub fn typing(typing: bool) -> Self {
        ProtocolEvent::TopicTyping(TopicTypingPayload { typing })
    }

    pub fn action_state(id: impl Into<String>, state: ActionState) -> Self {
        ProtocolEvent::ActionState(ActionStatePayload {
            id: id.into(),
            state,
        })
    }

    pub fn topic_joined(address: impl Into<String>, profile: Option<Profile>) -> Self {
        ProtocolEvent::TopicJoined(TopicJoinedPayload {
            address: address.into(),
            profile,
        })
    }
}

//! Conversation and message types
//!
//! A [`Conversation`] is keyed by its topic and holds the ordered message log
//! together with the read pointer. The pointer always lies within
//! `0..=messages.len()` and only moves forward.

use serde::{Deserialize, Serialize};

use super::{now_millis, ActionData, PeerKey, TopicId};

/// Two-party or N-party conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationKind {
    Direct,
    Channel,
}

/// Who produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageSource {
    #[default]
    User,
    /// Synthesized locally (e.g. action state changes)
    System,
}

/// One block of a message body
///
/// Fields other than `text` and `action` are preserved untouched so that
/// richer clients can round-trip content this layer does not interpret.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionData>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MessageBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn action(action: ActionData) -> Self {
        Self {
            action: Some(action),
            ..Default::default()
        }
    }
}

/// A message in a conversation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub blocks: Vec<MessageBlock>,
    #[serde(default)]
    pub source: MessageSource,
    /// Peer that sent the message, or whose action a system message records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<PeerKey>,
    /// Local receive/creation time in milliseconds
    pub timestamp: i64,
}

impl Message {
    pub fn user(sender: PeerKey, blocks: Vec<MessageBlock>) -> Self {
        Self {
            blocks,
            source: MessageSource::User,
            sender: Some(sender),
            timestamp: now_millis(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            blocks: vec![MessageBlock::text(text)],
            source: MessageSource::System,
            sender: None,
            timestamp: now_millis(),
        }
    }

    /// Actions embedded in this message's blocks
    pub fn actions(&self) -> impl Iterator<Item = &ActionData> {
        self.blocks.iter().filter_map(|b| b.action.as_ref())
    }
}

/// A direct conversation or a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: TopicId,
    pub kind: ConversationKind,
    /// Channel subject; `None` for direct conversations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Dark channels never carry routing addresses
    #[serde(default)]
    pub dark: bool,
    messages: Vec<Message>,
    pointer: usize,
    pub peers: Vec<PeerKey>,
    pub last_active: i64,
}

impl Conversation {
    /// Create an empty direct conversation with one peer
    pub fn direct(id: TopicId, peer: PeerKey) -> Self {
        Self {
            id,
            kind: ConversationKind::Direct,
            subject: None,
            dark: false,
            messages: Vec::new(),
            pointer: 0,
            peers: vec![peer],
            last_active: now_millis(),
        }
    }

    /// Create an empty channel
    pub fn channel(id: TopicId, subject: impl Into<String>, peers: Vec<PeerKey>, dark: bool) -> Self {
        Self {
            id,
            kind: ConversationKind::Channel,
            subject: Some(subject.into()),
            dark,
            messages: Vec::new(),
            pointer: 0,
            peers,
            last_active: now_millis(),
        }
    }

    pub fn is_channel(&self) -> bool {
        self.kind == ConversationKind::Channel
    }

    /// Messages in arrival order
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages the user has seen
    pub fn pointer(&self) -> usize {
        self.pointer
    }

    pub fn unread(&self) -> usize {
        self.messages.len().saturating_sub(self.pointer)
    }

    /// Append a message. When `read` is set the pointer moves to the end.
    pub fn push(&mut self, message: Message, read: bool) {
        self.last_active = self.last_active.max(message.timestamp);
        self.messages.push(message);
        if read {
            self.pointer = self.messages.len();
        }
    }

    /// Move the read pointer forward to `to`, clamped to the log length.
    ///
    /// Returns the resulting pointer. A target behind the current pointer
    /// leaves it unchanged.
    pub fn advance_pointer(&mut self, to: usize) -> usize {
        let target = to.min(self.messages.len());
        if target > self.pointer {
            self.pointer = target;
        }
        self.pointer
    }

    /// Add a peer if not already listed
    pub fn add_peer(&mut self, peer: PeerKey) {
        if !self.peers.contains(&peer) {
            self.peers.push(peer);
        }
    }
}

//! Notifications published by the session manager
//!
//! Every state change the session applies, whether caused by a local call or
//! by an inbound protocol event, is mirrored as a [`SessionEvent`] on the
//! manager's broadcast channel. Presentation layers subscribe with
//! [`SessionManager::subscribe_events`](super::SessionManager::subscribe_events).

use crate::types::{Action, Contact, ContactRequest, ConversationKind, Message, PeerKey, TopicId};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A peer asked to become a contact
    ContactRequestReceived(ContactRequest),
    /// A contact record changed (state, address or profile)
    ContactUpdated(Contact),
    /// We joined a topic and routed it
    ConversationJoined { id: TopicId, kind: ConversationKind },
    /// A message was appended at `index`
    MessageAdded {
        convo: TopicId,
        index: usize,
        message: Message,
    },
    TypingChanged {
        convo: TopicId,
        peer: PeerKey,
        typing: bool,
    },
    ActionUpdated(Action),
    ConversationLeft(TopicId),
}

impl SessionEvent {
    /// Conversation the event belongs to, if any
    pub fn conversation(&self) -> Option<TopicId> {
        match self {
            SessionEvent::ConversationJoined { id, .. } => Some(*id),
            SessionEvent::MessageAdded { convo, .. } | SessionEvent::TypingChanged { convo, .. } => {
                Some(*convo)
            }
            SessionEvent::ActionUpdated(action) => Some(action.convo_id),
            SessionEvent::ConversationLeft(id) => Some(*id),
            SessionEvent::ContactRequestReceived(_) | SessionEvent::ContactUpdated(_) => None,
        }
    }
}

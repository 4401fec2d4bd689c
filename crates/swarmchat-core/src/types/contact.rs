//! Contact relationship types
//!
//! A contact moves `NONE -> SENT -> ACCEPTED` when we initiate and
//! `NONE -> RECEIVED -> ACCEPTED` when they do. Merges never move the state
//! backwards or sideways, so replays and reordering on the wire cannot undo
//! an accepted relationship.

use serde::{Deserialize, Serialize};

use super::{PeerKey, Profile, TopicId};

/// Relationship state with a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContactState {
    /// Known peer (e.g. channel member) without a direct relationship
    #[default]
    None,
    /// We sent a contact request
    Sent,
    /// They sent us a contact request that is still pending
    Received,
    /// Both sides joined the direct topic
    Accepted,
}

impl ContactState {
    fn rank(self) -> u8 {
        match self {
            ContactState::None => 0,
            ContactState::Sent | ContactState::Received => 1,
            ContactState::Accepted => 2,
        }
    }

    /// Combine a stored state with an incoming one.
    ///
    /// Returns `next` only when it is strictly further along.
    pub fn advance(self, next: ContactState) -> ContactState {
        if next.rank() > self.rank() {
            next
        } else {
            self
        }
    }
}

/// A peer we know about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub profile: Profile,
    /// Last known routing address (may be empty)
    #[serde(default)]
    pub address: String,
    /// Direct conversation topic once a request was sent or received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convo_id: Option<TopicId>,
    #[serde(default)]
    pub state: ContactState,
}

impl Contact {
    /// A contact we only know by key (state `NONE`)
    pub fn placeholder(key: PeerKey) -> Self {
        Self {
            profile: Profile::new(key),
            address: String::new(),
            convo_id: None,
            state: ContactState::None,
        }
    }

    pub fn key(&self) -> PeerKey {
        self.profile.id
    }

    /// Merge an incoming record into this one.
    ///
    /// Profile fields are merged, a non-empty address and a present
    /// `convo_id` replace ours, and the state only advances.
    pub fn merge(&mut self, incoming: Contact) {
        self.profile.merge(&incoming.profile);
        if !incoming.address.is_empty() {
            self.address = incoming.address;
        }
        if incoming.convo_id.is_some() {
            self.convo_id = incoming.convo_id;
        }
        self.state = self.state.advance(incoming.state);
    }
}

/// A pending inbound contact request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRequest {
    pub profile: Profile,
    #[serde(default)]
    pub address: String,
    /// Direct topic the requester already joined
    pub topic: TopicId,
}

impl ContactRequest {
    pub fn key(&self) -> PeerKey {
        self.profile.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_advances_along_both_paths() {
        assert_eq!(ContactState::None.advance(ContactState::Sent), ContactState::Sent);
        assert_eq!(ContactState::Sent.advance(ContactState::Accepted), ContactState::Accepted);
        assert_eq!(ContactState::None.advance(ContactState::Received), ContactState::Received);
        assert_eq!(
            ContactState::Received.advance(ContactState::Accepted),
            ContactState::Accepted
        );
    }

    #[test]
    fn test_state_never_moves_back_or_sideways() {
        assert_eq!(ContactState::Accepted.advance(ContactState::None), ContactState::Accepted);
        assert_eq!(ContactState::Accepted.advance(ContactState::Sent), ContactState::Accepted);
        assert_eq!(ContactState::Sent.advance(ContactState::Received), ContactState::Sent);
        assert_eq!(ContactState::Received.advance(ContactState::None), ContactState::Received);
    }

    #[test]
    fn test_merge_keeps_address_when_incoming_empty() {
        let key = PeerKey::random();
        let mut contact = Contact::placeholder(key);
        contact.address = "addr-1".to_string();
        contact.state = ContactState::Accepted;

        let mut incoming = Contact::placeholder(key);
        incoming.profile.name = Some("bob".to_string());
        contact.merge(incoming);

        assert_eq!(contact.address, "addr-1");
        assert_eq!(contact.state, ContactState::Accepted);
        assert_eq!(contact.profile.name.as_deref(), Some("bob"));
    }

    #[test]
    fn test_state_serializes_screaming_case() {
        let json = serde_json::to_string(&ContactState::Received).unwrap();
        assert_eq!(json, "\"RECEIVED\"");
    }
}

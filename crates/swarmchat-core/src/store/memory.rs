//! In-memory [`Store`] backed by `parking_lot` maps.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use tracing::debug;

use super::Store;
use crate::error::{ChatError, ChatResult};
use crate::types::{Action, Contact, ContactRequest, Conversation, Message, PeerKey, Profile, TopicId};

#[derive(Default)]
pub struct MemoryStore {
    profile: RwLock<Option<Profile>>,
    address: RwLock<String>,
    contacts: RwLock<HashMap<PeerKey, Contact>>,
    requests: RwLock<HashMap<PeerKey, ContactRequest>>,
    conversations: RwLock<HashMap<TopicId, Conversation>>,
    actions: RwLock<HashMap<String, Action>>,
    typing: RwLock<HashMap<TopicId, BTreeSet<PeerKey>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn load_profile(&self) -> ChatResult<Option<Profile>> {
        Ok(self.profile.read().clone())
    }

    fn save_profile(&self, profile: &Profile) -> ChatResult<()> {
        *self.profile.write() = Some(profile.clone());
        Ok(())
    }

    fn load_address(&self) -> ChatResult<String> {
        Ok(self.address.read().clone())
    }

    fn save_address(&self, address: &str) -> ChatResult<()> {
        *self.address.write() = address.to_string();
        Ok(())
    }

    fn load_contact(&self, key: &PeerKey) -> ChatResult<Option<Contact>> {
        Ok(self.contacts.read().get(key).cloned())
    }

    fn save_contact(&self, contact: &Contact) -> ChatResult<()> {
        self.contacts.write().insert(contact.key(), contact.clone());
        Ok(())
    }

    fn upsert_contact(&self, contact: Contact) -> ChatResult<Contact> {
        let mut contacts = self.contacts.write();
        let merged = match contacts.entry(contact.key()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().merge(contact);
                entry.get().clone()
            }
            Entry::Vacant(entry) => entry.insert(contact).clone(),
        };
        Ok(merged)
    }

    fn delete_contact(&self, key: &PeerKey) -> ChatResult<bool> {
        Ok(self.contacts.write().remove(key).is_some())
    }

    fn list_contacts(&self) -> ChatResult<Vec<Contact>> {
        let mut contacts: Vec<_> = self.contacts.read().values().cloned().collect();
        contacts.sort_by_key(|c| c.key());
        Ok(contacts)
    }

    fn load_contact_request(&self, key: &PeerKey) -> ChatResult<Option<ContactRequest>> {
        Ok(self.requests.read().get(key).cloned())
    }

    fn save_contact_request(&self, request: &ContactRequest) -> ChatResult<()> {
        self.requests.write().insert(request.key(), request.clone());
        Ok(())
    }

    fn delete_contact_request(&self, key: &PeerKey) -> ChatResult<bool> {
        Ok(self.requests.write().remove(key).is_some())
    }

    fn list_contact_requests(&self) -> ChatResult<Vec<ContactRequest>> {
        let mut requests: Vec<_> = self.requests.read().values().cloned().collect();
        requests.sort_by_key(|r| r.key());
        Ok(requests)
    }

    fn load_conversation(&self, id: &TopicId) -> ChatResult<Option<Conversation>> {
        Ok(self.conversations.read().get(id).cloned())
    }

    fn save_conversation(&self, conversation: &Conversation) -> ChatResult<()> {
        self.conversations
            .write()
            .insert(conversation.id, conversation.clone());
        Ok(())
    }

    fn delete_conversation(&self, id: &TopicId) -> ChatResult<bool> {
        self.typing.write().remove(id);
        Ok(self.conversations.write().remove(id).is_some())
    }

    fn list_conversations(&self) -> ChatResult<Vec<Conversation>> {
        let mut conversations: Vec<_> = self.conversations.read().values().cloned().collect();
        conversations.sort_by(|a, b| b.last_active.cmp(&a.last_active));
        Ok(conversations)
    }

    fn append_message(&self, id: &TopicId, message: Message, read: bool) -> ChatResult<usize> {
        let mut conversations = self.conversations.write();
        let conversation = conversations
            .get_mut(id)
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", id)))?;

        {
            let mut actions = self.actions.write();
            for data in message.actions() {
                if !actions.contains_key(&data.id) {
                    debug!(action = %data.id, convo = %id.short(), "Registering action");
                    actions.insert(data.id.clone(), Action::new(*id, data.clone()));
                }
            }
        }

        conversation.push(message, read);
        Ok(conversation.messages().len())
    }

    fn advance_pointer(&self, id: &TopicId, to: usize) -> ChatResult<usize> {
        self.conversations
            .write()
            .get_mut(id)
            .map(|c| c.advance_pointer(to))
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", id)))
    }

    fn load_action(&self, id: &str) -> ChatResult<Option<Action>> {
        Ok(self.actions.read().get(id).cloned())
    }

    fn save_action(&self, action: &Action) -> ChatResult<()> {
        self.actions.write().insert(action.id.clone(), action.clone());
        Ok(())
    }

    fn set_typing(&self, conversation: &TopicId, peer: &PeerKey, typing: bool) -> ChatResult<()> {
        let mut map = self.typing.write();
        let peers = map.entry(*conversation).or_default();
        if typing {
            peers.insert(*peer);
        } else {
            peers.remove(peer);
        }
        Ok(())
    }

    fn typing_peers(&self, conversation: &TopicId) -> ChatResult<Vec<PeerKey>> {
        Ok(self
            .typing
            .read()
            .get(conversation)
            .map(|peers| peers.iter().copied().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionData, ActionState, ContactState, MessageBlock};

    #[test]
    fn test_upsert_merges_monotonically() {
        let store = MemoryStore::new();
        let key = PeerKey::random();

        let mut accepted = Contact::placeholder(key);
        accepted.state = ContactState::Accepted;
        store.upsert_contact(accepted).unwrap();

        let mut stale = Contact::placeholder(key);
        stale.state = ContactState::Received;
        stale.address = "newer".into();
        let merged = store.upsert_contact(stale).unwrap();

        assert_eq!(merged.state, ContactState::Accepted);
        assert_eq!(merged.address, "newer");
        assert_eq!(store.load_contact(&key).unwrap(), Some(merged));
    }

    #[test]
    fn test_append_requires_conversation() {
        let store = MemoryStore::new();
        let result = store.append_message(
            &TopicId::random(),
            Message::system("hello"),
            false,
        );
        assert!(matches!(result, Err(ChatError::NotFound(_))));
    }

    #[test]
    fn test_append_registers_actions_once() {
        let store = MemoryStore::new();
        let peer = PeerKey::random();
        let convo = Conversation::direct(TopicId::random(), peer);
        store.save_conversation(&convo).unwrap();

        let action = ActionData::new("approve-1");
        let msg = Message::user(peer, vec![MessageBlock::action(action.clone())]);
        store.append_message(&convo.id, msg, false).unwrap();

        let mut done = store.load_action("approve-1").unwrap().unwrap();
        assert_eq!(done.convo_id, convo.id);
        done.data.state = ActionState::Done;
        store.save_action(&done).unwrap();

        // Re-posting the same block does not reset the action
        let msg = Message::user(peer, vec![MessageBlock::action(action)]);
        assert_eq!(store.append_message(&convo.id, msg, false).unwrap(), 2);
        assert_eq!(
            store.load_action("approve-1").unwrap().unwrap().state(),
            ActionState::Done
        );
    }

    #[test]
    fn test_pointer_via_store() {
        let store = MemoryStore::new();
        let peer = PeerKey::random();
        let convo = Conversation::direct(TopicId::random(), peer);
        store.save_conversation(&convo).unwrap();

        store.append_message(&convo.id, Message::system("a"), false).unwrap();
        store.append_message(&convo.id, Message::system("b"), false).unwrap();
        assert_eq!(store.advance_pointer(&convo.id, 1).unwrap(), 1);
        assert_eq!(store.advance_pointer(&convo.id, 0).unwrap(), 1);

        store.append_message(&convo.id, Message::system("c"), true).unwrap();
        assert_eq!(store.load_conversation(&convo.id).unwrap().unwrap().pointer(), 3);
    }

    #[test]
    fn test_typing_flags() {
        let store = MemoryStore::new();
        let topic = TopicId::random();
        let peer = PeerKey::random();

        store.set_typing(&topic, &peer, true).unwrap();
        assert_eq!(store.typing_peers(&topic).unwrap(), vec![peer]);

        store.set_typing(&topic, &peer, false).unwrap();
        assert!(store.typing_peers(&topic).unwrap().is_empty());
    }
}

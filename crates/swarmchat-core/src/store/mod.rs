//! Data-store boundary
//!
//! The session layer reads and writes contacts, conversations and actions
//! through [`Store`]. Calls are synchronous and short; implementations guard
//! their own state and must never block on the network.
//!
//! [`MemoryStore`] is the reference implementation.

mod memory;

pub use memory::MemoryStore;

use crate::error::ChatResult;
use crate::types::{Action, Contact, ContactRequest, Conversation, Message, PeerKey, Profile, TopicId};

pub trait Store: Send + Sync {
    /// Local profile, if one was set up
    fn load_profile(&self) -> ChatResult<Option<Profile>>;
    fn save_profile(&self, profile: &Profile) -> ChatResult<()>;

    /// Local routing address (empty when unknown)
    fn load_address(&self) -> ChatResult<String>;
    fn save_address(&self, address: &str) -> ChatResult<()>;

    fn load_contact(&self, key: &PeerKey) -> ChatResult<Option<Contact>>;
    /// Overwrite a contact as given
    fn save_contact(&self, contact: &Contact) -> ChatResult<()>;
    /// Merge into the stored contact (see [`Contact::merge`]) and return the result
    fn upsert_contact(&self, contact: Contact) -> ChatResult<Contact>;
    fn delete_contact(&self, key: &PeerKey) -> ChatResult<bool>;
    fn list_contacts(&self) -> ChatResult<Vec<Contact>>;

    fn load_contact_request(&self, key: &PeerKey) -> ChatResult<Option<ContactRequest>>;
    fn save_contact_request(&self, request: &ContactRequest) -> ChatResult<()>;
    fn delete_contact_request(&self, key: &PeerKey) -> ChatResult<bool>;
    fn list_contact_requests(&self) -> ChatResult<Vec<ContactRequest>>;

    fn load_conversation(&self, id: &TopicId) -> ChatResult<Option<Conversation>>;
    fn save_conversation(&self, conversation: &Conversation) -> ChatResult<()>;
    fn delete_conversation(&self, id: &TopicId) -> ChatResult<bool>;
    fn list_conversations(&self) -> ChatResult<Vec<Conversation>>;

    /// Append to a conversation log and return the new message count.
    ///
    /// Action blocks in `message` are registered as actions of the
    /// conversation unless an action with that id already exists. With
    /// `read` set the read pointer moves to the end of the log.
    /// Fails with `NotFound` if the conversation does not exist.
    fn append_message(&self, id: &TopicId, message: Message, read: bool) -> ChatResult<usize>;

    /// Advance the read pointer (clamped, never backwards); returns the new pointer
    fn advance_pointer(&self, id: &TopicId, to: usize) -> ChatResult<usize>;

    fn load_action(&self, id: &str) -> ChatResult<Option<Action>>;
    fn save_action(&self, action: &Action) -> ChatResult<()>;

    /// Ephemeral per-peer typing flag
    fn set_typing(&self, conversation: &TopicId, peer: &PeerKey, typing: bool) -> ChatResult<()>;
    fn typing_peers(&self, conversation: &TopicId) -> ChatResult<Vec<PeerKey>>;
}

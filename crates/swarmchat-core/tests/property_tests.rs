//! Property-based tests for the protocol and state invariants
//!
//! Uses proptest to check the codec, the topic registry, contact state
//! merging and the conversation read pointer.

use std::sync::Arc;

use proptest::prelude::*;
use swarmchat_core::protocol::{EnvelopeCodec, NonceRegistry, ProtocolEvent};
use swarmchat_core::{
    ActionData, ActionState, Contact, ContactState, Conversation, Message, MessageBlock, PeerInfo,
    PeerKey, Profile, TopicId, TopicRegistry,
};
use std::time::Duration;

// ============================================================================
// Strategy Generators
// ============================================================================

fn peer_key_strategy() -> impl Strategy<Value = PeerKey> {
    any::<[u8; 32]>().prop_map(PeerKey::from_bytes)
}

fn topic_strategy() -> impl Strategy<Value = TopicId> {
    any::<[u8; 32]>().prop_map(TopicId::from_bytes)
}

fn text_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9 .,!?]{0,64}").expect("valid regex")
}

fn profile_strategy() -> impl Strategy<Value = Profile> {
    (
        peer_key_strategy(),
        prop::option::of(text_strategy()),
        prop::option::of(text_strategy()),
    )
        .prop_map(|(id, name, bio)| Profile {
            id,
            name,
            avatar: None,
            bio,
        })
}

fn block_strategy() -> impl Strategy<Value = MessageBlock> {
    prop_oneof![
        text_strategy().prop_map(MessageBlock::text),
        "[a-z0-9-]{1,16}".prop_map(|id| MessageBlock::action(ActionData::new(id))),
    ]
}

fn state_strategy() -> impl Strategy<Value = ContactState> {
    prop_oneof![
        Just(ContactState::None),
        Just(ContactState::Sent),
        Just(ContactState::Received),
        Just(ContactState::Accepted),
    ]
}

/// Events of every kind the wire carries
fn event_strategy() -> impl Strategy<Value = ProtocolEvent> {
    prop_oneof![
        (text_strategy(), profile_strategy(), topic_strategy()).prop_map(
            |(address, profile, topic)| {
                ProtocolEvent::ContactRequest(swarmchat_core::protocol::ContactRequestPayload {
                    address,
                    profile,
                    topic,
                })
            }
        ),
        (
            topic_strategy(),
            text_strategy(),
            prop::collection::vec((peer_key_strategy(), text_strategy()), 0..4),
            any::<bool>()
        )
            .prop_map(|(topic, subject, peers, dark)| {
                ProtocolEvent::ChannelInvite(swarmchat_core::protocol::ChannelInvitePayload {
                    topic,
                    subject,
                    peers: peers
                        .into_iter()
                        .map(|(key, address)| PeerInfo::new(key, address))
                        .collect(),
                    dark,
                })
            }),
        Just(ProtocolEvent::profile_request()),
        profile_strategy().prop_map(|profile| {
            ProtocolEvent::ProfileResponse(swarmchat_core::protocol::ProfileResponsePayload {
                profile,
            })
        }),
        (text_strategy(), prop::option::of(profile_strategy()))
            .prop_map(|(address, profile)| ProtocolEvent::topic_joined(address, profile)),
        prop::collection::vec(block_strategy(), 0..4).prop_map(ProtocolEvent::topic_message),
        any::<bool>().prop_map(ProtocolEvent::typing),
        ("[a-z0-9-]{1,16}", any::<bool>()).prop_map(|(id, done)| {
            let state = if done {
                ActionState::Done
            } else {
                ActionState::Pending
            };
            ProtocolEvent::action_state(id, state)
        }),
    ]
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Every known event survives encode then decode unchanged
    #[test]
    fn codec_preserves_events(event in event_strategy()) {
        let codec = EnvelopeCodec::default();
        let data = codec.encode(&event).unwrap();
        prop_assert_eq!(codec.decode(&data), Some(event));
    }

    /// A nonce is accepted exactly once, however often it is replayed
    #[test]
    fn replayed_nonce_yields_one_event(event in event_strategy(), replays in 1usize..5) {
        let codec = EnvelopeCodec::default();
        let data = EnvelopeCodec::encode_with_nonce(&event, "00112233aabbccdd").unwrap();

        let delivered = (0..=replays)
            .filter_map(|_| codec.decode(&data))
            .count();
        prop_assert_eq!(delivered, 1);
        prop_assert_eq!(codec.remembered(), 1);
    }

    /// The nonce registry never holds more than its capacity
    #[test]
    fn nonce_registry_bounded(capacity in 1usize..32, nonces in prop::collection::vec("[0-9a-f]{16}", 0..100)) {
        let mut registry = NonceRegistry::new(capacity, Duration::from_secs(60));
        for nonce in &nonces {
            registry.check_and_insert(nonce);
            prop_assert!(registry.len() <= capacity);
        }
    }

    /// Lookup returns the last session put for a topic
    #[test]
    fn registry_last_write_wins(puts in prop::collection::vec((0usize..4, any::<u32>()), 1..40)) {
        let topics: Vec<TopicId> = (0..4).map(|_| TopicId::random()).collect();
        let registry = TopicRegistry::new();
        let mut expected = std::collections::HashMap::new();

        for (slot, value) in puts {
            let previous = registry.put(topics[slot], Arc::new(value));
            prop_assert_eq!(previous.map(|v| *v), expected.insert(slot, value));
        }
        for (slot, value) in expected {
            prop_assert_eq!(registry.get(&topics[slot]).map(|v| *v), Some(value));
        }
    }

    /// Merging never moves a contact backwards, and never back to NONE
    #[test]
    fn contact_state_monotonic(states in prop::collection::vec(state_strategy(), 1..20)) {
        let key = PeerKey::random();
        let mut contact = Contact::placeholder(key);
        let rank = |s: ContactState| match s {
            ContactState::None => 0,
            ContactState::Sent | ContactState::Received => 1,
            ContactState::Accepted => 2,
        };

        for state in states {
            let before = contact.state;
            let mut incoming = Contact::placeholder(key);
            incoming.state = state;
            contact.merge(incoming);

            prop_assert!(rank(contact.state) >= rank(before));
            if before != ContactState::None {
                prop_assert_ne!(contact.state, ContactState::None);
            }
            if rank(before) == rank(state) {
                prop_assert_eq!(contact.state, before);
            }
        }
    }

    /// The read pointer stays within [0, count] and never decreases
    #[test]
    fn pointer_bounded_and_monotonic(ops in prop::collection::vec((any::<bool>(), any::<bool>(), 0usize..20), 0..50)) {
        let peer = PeerKey::random();
        let mut convo = Conversation::direct(TopicId::random(), peer);

        for (append, read, target) in ops {
            let before = convo.pointer();
            if append {
                convo.push(Message::user(peer, vec![MessageBlock::text("x")]), read);
            } else {
                convo.advance_pointer(target);
            }
            prop_assert!(convo.pointer() <= convo.messages().len());
            prop_assert!(convo.pointer() >= before);
        }
    }
}

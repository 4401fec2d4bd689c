//! Per-topic inbound dispatch
//!
//! One router is attached to every joined topic. It maps each decoded event
//! to store mutations and replies, checks the kind against the topic class,
//! and mirrors every applied change as a [`SessionEvent`]. Nothing here is
//! fatal: failures are logged and the next event is handled.

use std::sync::Arc;

use tracing::{debug, warn};

use super::handshake;
use super::topic::{ReceivedEvent, Subscription, TopicSession};
use super::{Command, SessionContext, SessionEvent};
use crate::error::{ChatError, ChatResult};
use crate::protocol::{
    ActionStatePayload, ChannelInvitePayload, ProfileResponsePayload, ProtocolEvent, TopicClass,
    TopicJoinedPayload,
};
use crate::transport::Transport;
use crate::types::{
    Action, ActionState, Contact, ContactState, Message, MessageBlock, PeerKey, Profile, TopicId,
};

/// Start routing `session`'s events as a topic of `class`
pub(crate) fn attach<T: Transport>(
    ctx: Arc<SessionContext<T>>,
    session: &TopicSession<T>,
    class: TopicClass,
) -> Subscription {
    debug!(topic = %session.topic().short(), %class, "Attaching router");
    session.subscribe(move |received| {
        let ctx = ctx.clone();
        async move { route(&ctx, class, received).await }
    })
}

async fn route<T: Transport>(ctx: &SessionContext<T>, class: TopicClass, received: ReceivedEvent) {
    let ReceivedEvent {
        topic,
        sender,
        event,
    } = received;
    let kind = event.kind().to_string();

    if sender == ctx.own_key() {
        debug!(topic = %topic.short(), %kind, "Ignoring our own event");
        return;
    }
    if let ProtocolEvent::Unknown { .. } = event {
        warn!(topic = %topic.short(), sender = %sender.short(), %kind, "Ignoring unknown event kind");
        return;
    }
    if !event.is_legal_on(class) {
        warn!(
            topic = %topic.short(),
            sender = %sender.short(),
            %kind,
            %class,
            "Ignoring event not allowed on this topic class"
        );
        return;
    }

    let result = match event {
        ProtocolEvent::ContactRequest(payload) => {
            handshake::receive_contact_request(ctx, sender, payload)
        }
        ProtocolEvent::ChannelInvite(invite) => queue_channel_join(ctx, sender, invite),
        ProtocolEvent::ProfileRequest(_) => answer_profile_request(ctx, topic, sender).await,
        ProtocolEvent::ProfileResponse(ProfileResponsePayload { profile }) => {
            apply_profile(ctx, sender, profile)
        }
        ProtocolEvent::TopicJoined(payload) => {
            apply_topic_joined(ctx, class, topic, sender, payload).await
        }
        ProtocolEvent::TopicMessage(payload) => apply_message(ctx, topic, sender, payload.blocks),
        ProtocolEvent::TopicTyping(payload) => apply_typing(ctx, topic, sender, payload.typing),
        ProtocolEvent::ActionState(payload) => apply_action_state(ctx, topic, sender, payload),
        ProtocolEvent::Unknown { .. } => Ok(()),
    };

    if let Err(e) = result {
        warn!(
            topic = %topic.short(),
            sender = %sender.short(),
            %kind,
            error = %e,
            "Failed to apply event"
        );
    }
}

fn queue_channel_join<T: Transport>(
    ctx: &SessionContext<T>,
    from: PeerKey,
    invite: ChannelInvitePayload,
) -> ChatResult<()> {
    debug!(channel = %invite.topic.short(), from = %from.short(), "Queueing channel join");
    ctx.commands
        .send(Command::JoinChannel { invite, from })
        .map_err(|_| ChatError::Precondition("Session command loop is not running".into()))
}

async fn answer_profile_request<T: Transport>(
    ctx: &SessionContext<T>,
    topic: TopicId,
    sender: PeerKey,
) -> ChatResult<()> {
    let Some(profile) = ctx.store.load_profile()? else {
        debug!(topic = %topic.short(), "No local profile, not answering profile request");
        return Ok(());
    };
    let Some(session) = ctx.registry.get(&topic) else {
        debug!(topic = %topic.short(), "Topic session gone, not answering profile request");
        return Ok(());
    };
    session
        .send_to_peer(sender, &ProtocolEvent::ProfileResponse(ProfileResponsePayload { profile }))
        .await
}

fn apply_profile<T: Transport>(
    ctx: &SessionContext<T>,
    sender: PeerKey,
    profile: Profile,
) -> ChatResult<()> {
    if profile.id != sender {
        warn!(sender = %sender.short(), claimed = %profile.id.short(), "Profile does not belong to sender, ignoring");
        return Ok(());
    }
    let mut incoming = Contact::placeholder(sender);
    incoming.profile = profile;
    let contact = ctx.store.upsert_contact(incoming)?;
    ctx.emit(SessionEvent::ContactUpdated(contact));
    Ok(())
}

async fn apply_topic_joined<T: Transport>(
    ctx: &SessionContext<T>,
    class: TopicClass,
    topic: TopicId,
    sender: PeerKey,
    payload: TopicJoinedPayload,
) -> ChatResult<()> {
    let TopicJoinedPayload { address, profile } = payload;
    let profile = match profile {
        Some(p) if p.id != sender => {
            warn!(sender = %sender.short(), claimed = %p.id.short(), "Join profile does not belong to sender, dropping it");
            None
        }
        other => other,
    };

    let mut incoming = Contact::placeholder(sender);

    if profile.is_some() {
        let stored = ctx
            .store
            .load_contact(&sender)?
            .map(|c| c.address)
            .unwrap_or_default();
        if address.len() > stored.len() {
            if let Some(session) = ctx.registry.get(&topic) {
                session.add_peer(sender, &address).await?;
            }
            debug!(peer = %sender.short(), "Refined peer address");
            incoming.address = address;
        }
    }
    if let Some(profile) = profile {
        incoming.profile = profile;
    }

    match class {
        TopicClass::Direct => {
            incoming.state = ContactState::Accepted;
            incoming.convo_id = Some(topic);
        }
        TopicClass::Channel => {
            if let Some(mut conversation) = ctx.store.load_conversation(&topic)? {
                if !conversation.peers.contains(&sender) {
                    conversation.add_peer(sender);
                    ctx.store.save_conversation(&conversation)?;
                }
            }
        }
        TopicClass::Contact => {}
    }

    let contact = ctx.store.upsert_contact(incoming)?;
    debug!(topic = %topic.short(), peer = %sender.short(), state = ?contact.state, "Peer joined topic");
    ctx.emit(SessionEvent::ContactUpdated(contact));
    Ok(())
}

fn apply_message<T: Transport>(
    ctx: &SessionContext<T>,
    topic: TopicId,
    sender: PeerKey,
    blocks: Vec<MessageBlock>,
) -> ChatResult<()> {
    append_and_emit(ctx, topic, Message::user(sender, blocks), false)?;
    Ok(())
}

fn apply_typing<T: Transport>(
    ctx: &SessionContext<T>,
    topic: TopicId,
    sender: PeerKey,
    typing: bool,
) -> ChatResult<()> {
    ctx.store.set_typing(&topic, &sender, typing)?;
    ctx.emit(SessionEvent::TypingChanged {
        convo: topic,
        peer: sender,
        typing,
    });
    Ok(())
}

fn apply_action_state<T: Transport>(
    ctx: &SessionContext<T>,
    topic: TopicId,
    sender: PeerKey,
    payload: ActionStatePayload,
) -> ChatResult<()> {
    let Some(action) = ctx.store.load_action(&payload.id)? else {
        debug!(action = %payload.id, "Unknown action, ignoring state change");
        return Ok(());
    };
    if action.convo_id != topic {
        warn!(
            action = %payload.id,
            topic = %topic.short(),
            owner = %action.convo_id.short(),
            "Action belongs to another conversation, ignoring"
        );
        return Ok(());
    }

    let actor = peer_name(ctx, &sender)?;
    if advance_action(ctx, action, payload.state, sender, &actor, false)?.is_none() {
        debug!(action = %payload.id, state = ?payload.state, "Stale action state, ignoring");
    }
    Ok(())
}

/// Append `message` to `convo` and publish it
pub(crate) fn append_and_emit<T: Transport>(
    ctx: &SessionContext<T>,
    convo: TopicId,
    message: Message,
    read: bool,
) -> ChatResult<usize> {
    let count = ctx.store.append_message(&convo, message.clone(), read)?;
    ctx.emit(SessionEvent::MessageAdded {
        convo,
        index: count - 1,
        message,
    });
    Ok(count)
}

/// Move `action` to `state` if that is a step forward, recording a system
/// message in its conversation. Returns the updated action.
///
/// The system message names `actor`, carries the updated action as a block
/// and records `actor_key` as its sender.
pub(crate) fn advance_action<T: Transport>(
    ctx: &SessionContext<T>,
    mut action: Action,
    state: ActionState,
    actor_key: PeerKey,
    actor: &str,
    read: bool,
) -> ChatResult<Option<Action>> {
    if !action.state().advances_to(state) {
        return Ok(None);
    }

    action.data.state = state;
    ctx.store.save_action(&action)?;
    ctx.emit(SessionEvent::ActionUpdated(action.clone()));

    let label = match state {
        ActionState::Pending => "pending",
        ActionState::Done => "done",
    };
    let mut note = Message::system(format!("{} marked {} as {}", actor, action.id, label));
    note.blocks.push(MessageBlock::action(action.data.clone()));
    note.sender = Some(actor_key);
    append_and_emit(ctx, action.convo_id, note, read)?;
    Ok(Some(action))
}

/// Display name for `key`, from its contact record when we have one
pub(crate) fn peer_name<T: Transport>(ctx: &SessionContext<T>, key: &PeerKey) -> ChatResult<String> {
    Ok(ctx
        .store
        .load_contact(key)?
        .map(|c| c.profile.display_name())
        .unwrap_or_else(|| key.short()))
}

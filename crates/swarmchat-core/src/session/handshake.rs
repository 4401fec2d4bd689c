//! Multi-step handshakes: direct contacts, channels, contact-topic bootstrap
//!
//! ## Direct contact
//!
//! ```text
//! initiator                                   responder
//!   join T (random), register responder
//!   contact = SENT, convoId = T
//!   CONTACT_REQUEST{profile, address, T} ──>  (own contact topic)
//!                                             request stored, contact = RECEIVED
//!                                             accept: join T, contact = ACCEPTED
//!   contact = ACCEPTED  <──────────────────── TOPIC_JOINED{address, profile} on T
//! ```
//!
//! ## Channel
//!
//! ```text
//! creator                                      invitee
//!   join C, register invitees
//!   CHANNEL_INVITE{C, subject, peers, dark} ──> (existing direct topic)
//!   TOPIC_JOINED{profile} on C                  join C, register peers
//!                                               TOPIC_JOINED{address, profile} on C
//!                                               PROFILE_REQUEST to unknown peers
//! ```
//!
//! No step has a timeout. Each awaited step races the caller's
//! [`CancellationToken`]; a cancelled handshake returns
//! [`ChatError::Cancelled`] and keeps whatever was already applied.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::router;
use super::topic::TopicSession;
use super::{SessionContext, SessionEvent};
use crate::error::{ChatError, ChatResult};
use crate::protocol::{ChannelInvitePayload, ContactRequestPayload, ProtocolEvent, TopicClass};
use crate::transport::Transport;
use crate::types::{
    Contact, ContactRequest, ContactState, Conversation, ConversationKind, PeerInfo, PeerKey,
    Profile, TopicId,
};

/// Human-readable name hashed into `key`'s contact topic
pub fn contact_topic_name(prefix: &str, key: &PeerKey) -> String {
    format!("{}{}", prefix, key.to_hex())
}

/// Contact topic of `key` as derived by this session's transport
pub(crate) fn contact_topic<T: Transport>(ctx: &SessionContext<T>, key: &PeerKey) -> TopicId {
    ctx.transport
        .string_to_topic(&contact_topic_name(&ctx.config.contact_topic_prefix, key))
}

/// Await `fut` unless `cancel` fires first
async fn step<F, R>(cancel: &CancellationToken, what: &str, fut: F) -> ChatResult<R>
where
    F: Future<Output = ChatResult<R>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            info!(step = what, "Handshake cancelled");
            Err(ChatError::Cancelled(what.to_string()))
        }
        result = fut => result,
    }
}

fn require_profile<T: Transport>(ctx: &SessionContext<T>) -> ChatResult<Profile> {
    ctx.store
        .load_profile()?
        .ok_or_else(|| ChatError::Precondition("Local profile is not set".into()))
}

/// Join `topic` (or reuse the live session), register `peers` on it and
/// route it as `class`.
pub(crate) async fn join_topic<T: Transport>(
    ctx: &Arc<SessionContext<T>>,
    topic: TopicId,
    class: TopicClass,
    peers: Vec<(PeerKey, String)>,
) -> ChatResult<Arc<TopicSession<T>>> {
    if let Some(existing) = ctx.registry.get(&topic) {
        for (key, address) in peers {
            if !existing.has_peer(&key) {
                existing.add_peer(key, &address).await?;
            }
        }
        debug!(topic = %topic.short(), "Reusing topic session");
        return Ok(existing);
    }

    // Dropping an unregistered session closes it, so a cancelled join
    // leaves no subscription behind
    let session = TopicSession::create(ctx.transport.clone(), ctx.codec.clone(), topic).await?;
    for (key, address) in peers {
        if let Err(e) = session.add_peer(key, &address).await {
            warn!(topic = %topic.short(), peer = %key.short(), error = %e, "Failed to register peer, leaving topic");
            session.close();
            return Err(e);
        }
    }
    router::attach(ctx.clone(), &session, class);

    if let Some(replaced) = ctx.registry.put(topic, session.clone()) {
        replaced.close();
    }
    info!(topic = %topic.short(), %class, peers = session.peers().len(), "Joined topic");
    Ok(session)
}

/// Subscribe to our own contact topic and route requests arriving on it
pub(crate) async fn bootstrap_contact_topic<T: Transport>(
    ctx: &Arc<SessionContext<T>>,
) -> ChatResult<TopicId> {
    let topic = contact_topic(ctx, &ctx.own_key());
    join_topic(ctx, topic, TopicClass::Contact, Vec::new()).await?;
    info!(topic = %topic.short(), "Listening for contact requests");
    Ok(topic)
}

/// Materialize an inbound `CONTACT_REQUEST` as a pending request
pub(crate) fn receive_contact_request<T: Transport>(
    ctx: &SessionContext<T>,
    sender: PeerKey,
    payload: ContactRequestPayload,
) -> ChatResult<()> {
    if payload.profile.id != sender {
        warn!(
            sender = %sender.short(),
            claimed = %payload.profile.id.short(),
            "Contact request profile does not belong to sender, ignoring"
        );
        return Ok(());
    }
    if let Some(existing) = ctx.store.load_contact(&sender)? {
        if existing.state == ContactState::Accepted {
            info!(peer = %sender.short(), "Contact request from existing contact, ignoring");
            return Ok(());
        }
    }

    let request = ContactRequest {
        profile: payload.profile,
        address: payload.address,
        topic: payload.topic,
    };
    ctx.store.save_contact_request(&request)?;
    let contact = ctx.store.upsert_contact(Contact {
        profile: request.profile.clone(),
        address: request.address.clone(),
        convo_id: None,
        state: ContactState::Received,
    })?;

    info!(
        peer = %sender.short(),
        topic = %request.topic.short(),
        "Contact request received"
    );
    ctx.emit(SessionEvent::ContactRequestReceived(request));
    ctx.emit(SessionEvent::ContactUpdated(contact));
    Ok(())
}

/// Ask `key` to become a contact. Returns the direct topic.
///
/// A repeated request to a peer in `SENT` reuses the original topic. A
/// request to a peer whose own request is pending accepts that request.
pub(crate) async fn request_contact<T: Transport>(
    ctx: &Arc<SessionContext<T>>,
    key: PeerKey,
    address: &str,
    cancel: &CancellationToken,
) -> ChatResult<TopicId> {
    let profile = require_profile(ctx)?;
    if key == ctx.own_key() {
        return Err(ChatError::Precondition(
            "Cannot send a contact request to ourselves".into(),
        ));
    }

    let existing = ctx.store.load_contact(&key)?;
    let topic = match &existing {
        Some(c) if c.state == ContactState::Accepted => {
            return Err(ChatError::Precondition(format!(
                "{} is already a contact",
                key.short()
            )));
        }
        Some(c) if c.state == ContactState::Received => {
            if ctx.store.load_contact_request(&key)?.is_some() {
                info!(peer = %key.short(), "Peer already asked us, accepting instead");
                return accept_contact(ctx, key, cancel).await;
            }
            TopicId::random()
        }
        Some(c) if c.state == ContactState::Sent => c.convo_id.unwrap_or_else(TopicId::random),
        _ => TopicId::random(),
    };

    if ctx.store.load_conversation(&topic)?.is_none() {
        ctx.store.save_conversation(&Conversation::direct(topic, key))?;
    }
    step(
        cancel,
        "join direct topic",
        join_topic(ctx, topic, TopicClass::Direct, vec![(key, address.to_string())]),
    )
    .await?;
    ctx.emit(SessionEvent::ConversationJoined {
        id: topic,
        kind: ConversationKind::Direct,
    });

    let contact_topic = contact_topic(ctx, &key);
    step(
        cancel,
        "register on contact topic",
        ctx.transport.register_peer_key(contact_topic, key, address),
    )
    .await?;

    let contact = ctx.store.upsert_contact(Contact {
        profile: Profile::new(key),
        address: address.to_string(),
        convo_id: Some(topic),
        state: ContactState::Sent,
    })?;
    ctx.emit(SessionEvent::ContactUpdated(contact));

    let request = ProtocolEvent::ContactRequest(ContactRequestPayload {
        address: ctx.transport.routing_address(),
        profile,
        topic,
    });
    let data = ctx.codec.encode(&request)?;
    step(
        cancel,
        "send contact request",
        ctx.transport.send_asymmetric(key, contact_topic, data),
    )
    .await?;

    info!(peer = %key.short(), topic = %topic.short(), "Contact request sent");
    Ok(topic)
}

/// Accept `key`'s pending request: join its topic and announce ourselves
pub(crate) async fn accept_contact<T: Transport>(
    ctx: &Arc<SessionContext<T>>,
    key: PeerKey,
    cancel: &CancellationToken,
) -> ChatResult<TopicId> {
    let profile = require_profile(ctx)?;
    let request = ctx
        .store
        .load_contact_request(&key)?
        .ok_or_else(|| ChatError::NotFound(format!("contact request from {}", key.short())))?;
    if ctx.store.load_contact(&key)?.is_none() {
        return Err(ChatError::NotFound(format!("contact {}", key.short())));
    }

    let topic = request.topic;
    if ctx.store.load_conversation(&topic)?.is_none() {
        ctx.store.save_conversation(&Conversation::direct(topic, key))?;
    }
    let session = step(
        cancel,
        "join direct topic",
        join_topic(
            ctx,
            topic,
            TopicClass::Direct,
            vec![(key, request.address.clone())],
        ),
    )
    .await?;
    ctx.emit(SessionEvent::ConversationJoined {
        id: topic,
        kind: ConversationKind::Direct,
    });

    ctx.store.delete_contact_request(&key)?;
    let contact = ctx.store.upsert_contact(Contact {
        profile: request.profile,
        address: request.address,
        convo_id: Some(topic),
        state: ContactState::Accepted,
    })?;
    ctx.emit(SessionEvent::ContactUpdated(contact));

    let joined = ProtocolEvent::topic_joined(ctx.transport.routing_address(), Some(profile));
    step(cancel, "announce join", session.send_to_all(&joined)).await?;

    info!(peer = %key.short(), topic = %topic.short(), "Contact accepted");
    Ok(topic)
}

/// Drop `key`'s pending request. Nothing goes on the wire.
pub(crate) fn decline_contact<T: Transport>(ctx: &SessionContext<T>, key: PeerKey) -> ChatResult<()> {
    if !ctx.store.delete_contact_request(&key)? {
        return Err(ChatError::NotFound(format!(
            "contact request from {}",
            key.short()
        )));
    }
    if let Some(contact) = ctx.store.load_contact(&key)? {
        if contact.state == ContactState::Received {
            ctx.store.delete_contact(&key)?;
        }
    }
    info!(peer = %key.short(), "Contact request declined");
    Ok(())
}

/// Invite payload for `members`, creator first
fn build_invite<T: Transport>(
    ctx: &SessionContext<T>,
    topic: TopicId,
    subject: &str,
    dark: bool,
    members: &[Contact],
) -> ChannelInvitePayload {
    let address_of = |address: String| if dark { String::new() } else { address };

    let mut peers = vec![PeerInfo::new(
        ctx.own_key(),
        address_of(ctx.transport.routing_address()),
    )];
    peers.extend(
        members
            .iter()
            .map(|c| PeerInfo::new(c.key(), address_of(c.address.clone()))),
    );

    ChannelInvitePayload {
        topic,
        subject: subject.to_string(),
        peers,
        dark,
    }
}

/// Send `invite` over the direct topic of each member that has one.
/// Returns the number of invites sent.
async fn send_invites<T: Transport>(
    ctx: &SessionContext<T>,
    invite: &ChannelInvitePayload,
    members: &[Contact],
    cancel: &CancellationToken,
) -> ChatResult<usize> {
    let event = ProtocolEvent::ChannelInvite(invite.clone());
    let mut sent = 0;

    for member in members {
        let key = member.key();
        let Some(direct) = member.convo_id.and_then(|id| ctx.registry.get(&id)) else {
            warn!(
                channel = %invite.topic.short(),
                peer = %key.short(),
                "No direct topic with invitee, invite not sent"
            );
            continue;
        };
        match step(cancel, "send channel invite", direct.send_to_peer(key, &event)).await {
            Ok(()) => sent += 1,
            Err(e @ ChatError::Cancelled(_)) => return Err(e),
            Err(e) => {
                warn!(channel = %invite.topic.short(), peer = %key.short(), error = %e, "Invite failed");
            }
        }
    }
    Ok(sent)
}

/// Publish on a channel where a failure is worth a log line, not an error
async fn announce<T: Transport>(
    session: &TopicSession<T>,
    event: &ProtocolEvent,
    cancel: &CancellationToken,
) -> ChatResult<()> {
    match step(cancel, "announce join", session.send_to_all(event)).await {
        Ok(_) => Ok(()),
        Err(e @ ChatError::Cancelled(_)) => Err(e),
        Err(e) => {
            warn!(topic = %session.topic().short(), error = %e, "Join announcement failed");
            Ok(())
        }
    }
}

/// Create a channel and invite `invitees`. Returns the channel topic.
///
/// Invitees without a contact record are dropped. Invitees without a live
/// direct topic are listed as members but receive no invite.
pub(crate) async fn create_channel<T: Transport>(
    ctx: &Arc<SessionContext<T>>,
    subject: &str,
    invitees: Vec<PeerKey>,
    dark: bool,
    cancel: &CancellationToken,
) -> ChatResult<TopicId> {
    let profile = require_profile(ctx)?;
    let own = ctx.own_key();

    let mut members: Vec<Contact> = Vec::new();
    for key in invitees {
        if key == own || members.iter().any(|c| c.key() == key) {
            continue;
        }
        match ctx.store.load_contact(&key)? {
            Some(contact) => members.push(contact),
            None => warn!(peer = %key.short(), "Dropping invitee without a contact record"),
        }
    }

    let topic = TopicId::random();
    let invite = build_invite(ctx, topic, subject, dark, &members);
    ctx.store.save_conversation(&Conversation::channel(
        topic,
        subject,
        members.iter().map(Contact::key).collect(),
        dark,
    ))?;

    let registrations = members
        .iter()
        .map(|c| (c.key(), c.address.clone()))
        .collect();
    let session = step(
        cancel,
        "join channel",
        join_topic(ctx, topic, TopicClass::Channel, registrations),
    )
    .await?;
    ctx.emit(SessionEvent::ConversationJoined {
        id: topic,
        kind: ConversationKind::Channel,
    });

    let sent = send_invites(ctx, &invite, &members, cancel).await?;
    announce(&session, &ProtocolEvent::topic_joined("", Some(profile)), cancel).await?;

    info!(
        channel = %topic.short(),
        members = members.len(),
        invited = sent,
        dark,
        "Channel created"
    );
    Ok(topic)
}

/// Join the channel described by `invite`, received from `from`
pub(crate) async fn join_channel<T: Transport>(
    ctx: &Arc<SessionContext<T>>,
    invite: ChannelInvitePayload,
    from: PeerKey,
    cancel: &CancellationToken,
) -> ChatResult<TopicId> {
    let profile = require_profile(ctx)?;
    let topic = invite.topic;
    if ctx.registry.contains(&topic) {
        debug!(channel = %topic.short(), "Already in channel, ignoring invite");
        return Ok(topic);
    }

    let own = ctx.own_key();
    let mut members = Vec::new();
    let mut unknown = Vec::new();
    for peer in &invite.peers {
        if peer.pub_key == own {
            continue;
        }
        if ctx.store.load_contact(&peer.pub_key)?.is_none() {
            unknown.push(peer.pub_key);
        }
        let mut incoming = Contact::placeholder(peer.pub_key);
        incoming.address = peer.address.clone();
        let contact = ctx.store.upsert_contact(incoming)?;
        members.push((peer.pub_key, contact.address.clone()));
        if unknown.contains(&peer.pub_key) {
            ctx.emit(SessionEvent::ContactUpdated(contact));
        }
    }
    if !members.iter().any(|(key, _)| *key == from) {
        warn!(channel = %topic.short(), from = %from.short(), "Invite sender is not a listed member");
    }

    if ctx.store.load_conversation(&topic)?.is_none() {
        ctx.store.save_conversation(&Conversation::channel(
            topic,
            invite.subject.clone(),
            members.iter().map(|(key, _)| *key).collect(),
            invite.dark,
        ))?;
    }

    let session = step(
        cancel,
        "join channel",
        join_topic(ctx, topic, TopicClass::Channel, members),
    )
    .await?;
    ctx.emit(SessionEvent::ConversationJoined {
        id: topic,
        kind: ConversationKind::Channel,
    });

    let address = if invite.dark {
        String::new()
    } else {
        ctx.transport.routing_address()
    };
    announce(&session, &ProtocolEvent::topic_joined(address, Some(profile)), cancel).await?;

    for key in unknown {
        match step(
            cancel,
            "request profile",
            session.send_to_peer(key, &ProtocolEvent::profile_request()),
        )
        .await
        {
            Ok(()) => {}
            Err(e @ ChatError::Cancelled(_)) => return Err(e),
            Err(e) => warn!(peer = %key.short(), error = %e, "Profile request failed"),
        }
    }

    info!(channel = %topic.short(), subject = %invite.subject, "Joined channel");
    Ok(topic)
}

/// Send the invite for channel `convo` again to every member we can reach
pub(crate) async fn resend_invites<T: Transport>(
    ctx: &Arc<SessionContext<T>>,
    convo: TopicId,
    cancel: &CancellationToken,
) -> ChatResult<usize> {
    let conversation = ctx
        .store
        .load_conversation(&convo)?
        .filter(Conversation::is_channel)
        .ok_or_else(|| ChatError::NotFound(format!("channel {}", convo.short())))?;

    let mut members = Vec::new();
    for key in &conversation.peers {
        match ctx.store.load_contact(key)? {
            Some(contact) => members.push(contact),
            None => debug!(peer = %key.short(), "Channel member without contact record"),
        }
    }

    let subject = conversation.subject.clone().unwrap_or_default();
    let invite = build_invite(ctx, convo, &subject, conversation.dark, &members);
    let sent = send_invites(ctx, &invite, &members, cancel).await?;
    info!(channel = %convo.short(), sent, "Channel invites resent");
    Ok(sent)
}

/// Close `convo`'s session and forget the conversation
pub(crate) fn leave_conversation<T: Transport>(
    ctx: &SessionContext<T>,
    convo: TopicId,
) -> ChatResult<()> {
    let session = ctx.registry.remove(&convo);
    if let Some(session) = &session {
        session.close();
    }
    let existed = ctx.store.delete_conversation(&convo)?;
    if session.is_none() && !existed {
        return Err(ChatError::NotFound(format!("conversation {}", convo.short())));
    }

    info!(topic = %convo.short(), "Left conversation");
    ctx.emit(SessionEvent::ConversationLeft(convo));
    Ok(())
}

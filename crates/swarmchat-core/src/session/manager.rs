//! Session manager: the one owner of everything a running client holds
//!
//! Constructed once at startup with a transport, a store and a
//! [`SessionConfig`]; torn down with [`SessionManager::shutdown`]. It owns
//! the nonce registry (inside the envelope codec), the topic registry and
//! the command task that joins channels on behalf of routers.
//!
//! # Example
//!
//! ```ignore
//! let network = MemoryNetwork::new();
//! let manager = SessionManager::new(
//!     Arc::new(network.transport()),
//!     Arc::new(MemoryStore::new()),
//!     SessionConfig::default(),
//! )?;
//! manager.start().await?;
//!
//! let mut events = manager.subscribe_events();
//! manager.request_contact(peer_key, &peer_address).await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{self, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handshake;
use super::router;
use super::{Command, SessionContext, SessionEvent, TopicRegistry};
use crate::config::SessionConfig;
use crate::error::{ChatError, ChatResult};
use crate::protocol::{ChannelInvitePayload, EnvelopeCodec, ProtocolEvent, TopicClass};
use crate::store::Store;
use crate::transport::Transport;
use crate::types::{
    ActionState, Contact, ContactRequest, Conversation, Message, MessageBlock, PeerKey, Profile,
    TopicId,
};

pub struct SessionManager<T: Transport> {
    ctx: Arc<SessionContext<T>>,
    commands_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    command_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl<T: Transport> SessionManager<T> {
    pub fn new(transport: Arc<T>, store: Arc<dyn Store>, config: SessionConfig) -> ChatResult<Self> {
        config.validate()?;

        let codec = Arc::new(EnvelopeCodec::new(
            config.nonce_capacity,
            config.nonce_window(),
        ));
        let (events, _) = broadcast::channel(config.event_channel_capacity);
        let (commands, commands_rx) = mpsc::unbounded_channel();

        Ok(Self {
            ctx: Arc::new(SessionContext {
                transport,
                store,
                codec,
                registry: TopicRegistry::new(),
                config,
                events,
                commands,
            }),
            commands_rx: Mutex::new(Some(commands_rx)),
            command_task: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Bring the session up.
    ///
    /// Records our address and key in the store, starts listening on our
    /// contact topic, rejoins every stored conversation and starts the
    /// command task. Fails if called twice.
    pub async fn start(&self) -> ChatResult<()> {
        let commands = self
            .commands_rx
            .lock()
            .take()
            .ok_or_else(|| ChatError::Precondition("Session already started".into()))?;

        let key = self.ctx.own_key();
        let address = self.ctx.transport.routing_address();
        self.ctx.store.save_address(&address)?;

        let profile = match self.ctx.store.load_profile()? {
            Some(mut profile) => {
                profile.id = key;
                profile
            }
            None => Profile::new(key),
        };
        self.ctx.store.save_profile(&profile)?;

        handshake::bootstrap_contact_topic(&self.ctx).await?;
        self.rejoin_conversations().await?;

        let task = tokio::spawn(command_loop(
            self.ctx.clone(),
            commands,
            self.shutdown.clone(),
        ));
        *self.command_task.lock() = Some(task);

        info!(key = %key.short(), "Session started");
        Ok(())
    }

    async fn rejoin_conversations(&self) -> ChatResult<()> {
        for conversation in self.ctx.store.list_conversations()? {
            let class = if conversation.is_channel() {
                TopicClass::Channel
            } else {
                TopicClass::Direct
            };
            let mut peers = Vec::with_capacity(conversation.peers.len());
            for key in &conversation.peers {
                let address = self
                    .ctx
                    .store
                    .load_contact(key)?
                    .map(|c| c.address)
                    .unwrap_or_default();
                peers.push((*key, address));
            }

            if let Err(e) = handshake::join_topic(&self.ctx, conversation.id, class, peers).await {
                warn!(topic = %conversation.id.short(), error = %e, "Failed to rejoin conversation");
            }
        }
        Ok(())
    }

    /// Stop the command task and close every topic session
    pub fn shutdown(&self) {
        let first = !self.shutdown.is_cancelled();
        self.shutdown.cancel();
        if let Some(task) = self.command_task.lock().take() {
            task.abort();
        }
        for session in self.ctx.registry.drain() {
            session.close();
        }
        if first {
            info!("Session shut down");
        }
    }

    pub fn public_key(&self) -> PeerKey {
        self.ctx.own_key()
    }

    pub fn routing_address(&self) -> String {
        self.ctx.transport.routing_address()
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.ctx.transport
    }

    pub fn config(&self) -> &SessionConfig {
        &self.ctx.config
    }

    /// Topic on which we accept contact requests
    pub fn contact_topic(&self) -> TopicId {
        handshake::contact_topic(&self.ctx, &self.ctx.own_key())
    }

    /// Receive every [`SessionEvent`] from now on
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.ctx.events.subscribe()
    }

    /// Topics with a live session
    pub fn topics(&self) -> Vec<TopicId> {
        self.ctx.registry.topics()
    }

    pub fn is_joined(&self, topic: &TopicId) -> bool {
        self.ctx.registry.contains(topic)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Profile
    // ═══════════════════════════════════════════════════════════════════════

    pub fn profile(&self) -> ChatResult<Option<Profile>> {
        self.ctx.store.load_profile()
    }

    /// Replace the local profile. The id is always our own key.
    pub fn set_profile(&self, mut profile: Profile) -> ChatResult<Profile> {
        profile.id = self.ctx.own_key();
        self.ctx.store.save_profile(&profile)?;
        debug!(name = ?profile.name, "Profile updated");
        Ok(profile)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Handshakes
    // ═══════════════════════════════════════════════════════════════════════

    /// Ask `key` to become a contact; returns the direct topic
    pub async fn request_contact(&self, key: PeerKey, address: &str) -> ChatResult<TopicId> {
        self.request_contact_with(key, address, &CancellationToken::new())
            .await
    }

    pub async fn request_contact_with(
        &self,
        key: PeerKey,
        address: &str,
        cancel: &CancellationToken,
    ) -> ChatResult<TopicId> {
        handshake::request_contact(&self.ctx, key, address, cancel).await
    }

    /// Accept `key`'s pending contact request; returns the direct topic
    pub async fn accept_contact(&self, key: PeerKey) -> ChatResult<TopicId> {
        self.accept_contact_with(key, &CancellationToken::new()).await
    }

    pub async fn accept_contact_with(
        &self,
        key: PeerKey,
        cancel: &CancellationToken,
    ) -> ChatResult<TopicId> {
        handshake::accept_contact(&self.ctx, key, cancel).await
    }

    pub fn decline_contact(&self, key: PeerKey) -> ChatResult<()> {
        handshake::decline_contact(&self.ctx, key)
    }

    /// Create a channel with `invitees`; returns the channel topic
    pub async fn create_channel(
        &self,
        subject: &str,
        invitees: Vec<PeerKey>,
        dark: bool,
    ) -> ChatResult<TopicId> {
        self.create_channel_with(subject, invitees, dark, &CancellationToken::new())
            .await
    }

    pub async fn create_channel_with(
        &self,
        subject: &str,
        invitees: Vec<PeerKey>,
        dark: bool,
        cancel: &CancellationToken,
    ) -> ChatResult<TopicId> {
        handshake::create_channel(&self.ctx, subject, invitees, dark, cancel).await
    }

    /// Join a channel from an invite obtained out of band
    pub async fn join_channel(
        &self,
        invite: ChannelInvitePayload,
        from: PeerKey,
    ) -> ChatResult<TopicId> {
        self.join_channel_with(invite, from, &CancellationToken::new())
            .await
    }

    pub async fn join_channel_with(
        &self,
        invite: ChannelInvitePayload,
        from: PeerKey,
        cancel: &CancellationToken,
    ) -> ChatResult<TopicId> {
        handshake::join_channel(&self.ctx, invite, from, cancel).await
    }

    /// Re-send a channel's invite to its members; returns how many were sent
    pub async fn resend_invites(&self, convo: TopicId) -> ChatResult<usize> {
        self.resend_invites_with(convo, &CancellationToken::new())
            .await
    }

    pub async fn resend_invites_with(
        &self,
        convo: TopicId,
        cancel: &CancellationToken,
    ) -> ChatResult<usize> {
        handshake::resend_invites(&self.ctx, convo, cancel).await
    }

    pub fn leave_conversation(&self, convo: TopicId) -> ChatResult<()> {
        handshake::leave_conversation(&self.ctx, convo)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Outbound actions
    // ═══════════════════════════════════════════════════════════════════════

    /// Append a message locally (read) and publish it to the conversation.
    ///
    /// Without a live session for `convo` this logs and does nothing.
    pub async fn send_message(&self, convo: TopicId, blocks: Vec<MessageBlock>) -> ChatResult<()> {
        let Some(session) = self.ctx.registry.get(&convo) else {
            warn!(topic = %convo.short(), "No session for conversation, message not sent");
            return Ok(());
        };

        let message = Message::user(self.ctx.own_key(), blocks.clone());
        router::append_and_emit(&self.ctx, convo, message, true)?;
        session
            .send_to_all(&ProtocolEvent::topic_message(blocks))
            .await?;
        Ok(())
    }

    pub async fn send_text(&self, convo: TopicId, text: &str) -> ChatResult<()> {
        self.send_message(convo, vec![MessageBlock::text(text)])
            .await
    }

    pub async fn set_typing(&self, convo: TopicId, typing: bool) -> ChatResult<()> {
        let Some(session) = self.ctx.registry.get(&convo) else {
            debug!(topic = %convo.short(), "No session for conversation, typing not sent");
            return Ok(());
        };
        session.send_to_all(&ProtocolEvent::typing(typing)).await?;
        Ok(())
    }

    /// Mark an action done locally and tell the conversation.
    ///
    /// Unknown or already-done actions, and actions whose conversation has
    /// no live session, are a logged no-op.
    pub async fn set_action_done(&self, id: &str) -> ChatResult<()> {
        let Some(action) = self.ctx.store.load_action(id)? else {
            warn!(action = %id, "Unknown action, nothing to mark done");
            return Ok(());
        };
        let convo = action.convo_id;
        let Some(session) = self.ctx.registry.get(&convo) else {
            warn!(action = %id, topic = %convo.short(), "No session for conversation, action left unchanged");
            return Ok(());
        };

        let own_key = self.ctx.own_key();
        let actor = self
            .ctx
            .store
            .load_profile()?
            .map(|p| p.display_name())
            .unwrap_or_else(|| own_key.short());
        if router::advance_action(&self.ctx, action, ActionState::Done, own_key, &actor, true)?
            .is_none()
        {
            debug!(action = %id, "Action already done");
            return Ok(());
        }

        session
            .send_to_all(&ProtocolEvent::action_state(id, ActionState::Done))
            .await?;
        Ok(())
    }

    /// Move the read pointer of `convo` forward; returns the new pointer
    pub fn update_pointer(&self, convo: TopicId, to: usize) -> ChatResult<usize> {
        self.ctx.store.advance_pointer(&convo, to)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════

    pub fn contact(&self, key: &PeerKey) -> ChatResult<Option<Contact>> {
        self.ctx.store.load_contact(key)
    }

    pub fn contacts(&self) -> ChatResult<Vec<Contact>> {
        self.ctx.store.list_contacts()
    }

    pub fn contact_requests(&self) -> ChatResult<Vec<ContactRequest>> {
        self.ctx.store.list_contact_requests()
    }

    pub fn conversation(&self, id: &TopicId) -> ChatResult<Option<Conversation>> {
        self.ctx.store.load_conversation(id)
    }

    pub fn conversations(&self) -> ChatResult<Vec<Conversation>> {
        self.ctx.store.list_conversations()
    }

    pub fn typing_peers(&self, convo: &TopicId) -> ChatResult<Vec<PeerKey>> {
        self.ctx.store.typing_peers(convo)
    }
}

impl<T: Transport> Drop for SessionManager<T> {
    fn drop(&mut self) {
        // Routers hold the context, so sessions must be closed explicitly
        self.shutdown();
    }
}

/// Run commands from routers until shutdown.
///
/// Each join runs as its own task, so a slow join does not hold up the
/// commands behind it. A second invite for a channel whose join is still
/// running is dropped.
async fn command_loop<T: Transport>(
    ctx: Arc<SessionContext<T>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
) {
    let mut joins: JoinSet<()> = JoinSet::new();
    let mut joining: HashMap<task::Id, TopicId> = HashMap::new();

    loop {
        let command = tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(finished) = joins.join_next_with_id(), if !joins.is_empty() => {
                let id = match finished {
                    Ok((id, ())) => id,
                    Err(e) => {
                        warn!(error = %e, "Join task failed");
                        e.id()
                    }
                };
                joining.remove(&id);
                continue;
            }
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            Command::JoinChannel { invite, from } => {
                let channel = invite.topic;
                if joining.values().any(|topic| *topic == channel) {
                    debug!(channel = %channel.short(), "Join already in progress");
                    continue;
                }

                let ctx = ctx.clone();
                let shutdown = shutdown.clone();
                let handle = joins.spawn(async move {
                    if let Err(e) = handshake::join_channel(&ctx, invite, from, &shutdown).await {
                        error!(
                            channel = %channel.short(),
                            from = %from.short(),
                            error = %e,
                            "Failed to join channel"
                        );
                    }
                });
                joining.insert(handle.id(), channel);
            }
        }
    }

    joins.shutdown().await;
    debug!("Command loop stopped");
}

//! iroh-gossip transport
//!
//! Each session topic maps 1:1 onto a gossip topic. Payloads are wrapped in
//! [`SealedFrame`]s addressed to a single recipient; every member of the
//! gossip swarm relays the frame but only the recipient can open it.
//!
//! ## Identity and addresses
//!
//! - The peer key is the iroh endpoint id (an ed25519 public key); the
//!   sealing keys are derived from the same secret.
//! - The routing address is a base64url-encoded [`RoutingAddress`] (endpoint
//!   id, relay URL, direct socket addresses). More direct addresses make a
//!   longer string, which the session layer treats as more specific.
//! - Registering a peer on a topic feeds its address to the static discovery
//!   provider and asks gossip to join that peer on the topic.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine;
use iroh::discovery::static_provider::StaticProvider;
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointAddr, EndpointId, PublicKey, RelayUrl, SecretKey};
use iroh_gossip::api::{Event, GossipReceiver, GossipSender};
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use iroh_gossip::proto::TopicId as GossipTopicId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::sealed::{FrameSealer, SealedFrame};
use super::{InboundMessage, Transport};
use crate::error::{ChatError, ChatResult};
use crate::types::{PeerKey, TopicId};

/// Gossip message size limit; channel invites with many members and rich
/// message blocks exceed the 4KB default.
const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Serializable form of an iroh `EndpointAddr`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingAddress {
    /// Endpoint public key (32 bytes)
    pub node_id: [u8; 32],
    /// Optional relay URL for NAT traversal
    pub relay_url: Option<String>,
    /// Direct socket addresses (e.g., "192.168.1.1:4433")
    pub direct_addresses: Vec<String>,
}

impl RoutingAddress {
    pub fn from_endpoint_addr(addr: &EndpointAddr) -> Self {
        Self {
            node_id: *addr.id.as_bytes(),
            relay_url: addr.relay_urls().next().map(|url| url.to_string()),
            direct_addresses: addr.ip_addrs().map(|addr| addr.to_string()).collect(),
        }
    }

    pub fn to_endpoint_addr(&self) -> ChatResult<EndpointAddr> {
        let public_key = PublicKey::from_bytes(&self.node_id)
            .map_err(|e| ChatError::Transport(format!("Invalid endpoint id: {}", e)))?;

        let mut addr = EndpointAddr::new(public_key);

        if let Some(ref relay) = self.relay_url {
            let relay_url: RelayUrl = relay
                .parse()
                .map_err(|e| ChatError::Transport(format!("Invalid relay URL: {}", e)))?;
            addr = addr.with_relay_url(relay_url);
        }

        for direct in &self.direct_addresses {
            let socket_addr: SocketAddr = direct
                .parse()
                .map_err(|e| ChatError::Transport(format!("Invalid socket address: {}", e)))?;
            addr = addr.with_ip_addr(socket_addr);
        }

        Ok(addr)
    }

    /// Wire form used as the session routing address
    pub fn encode(&self) -> ChatResult<String> {
        let bytes = postcard::to_allocvec(self)?;
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn decode(s: &str) -> ChatResult<Self> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(s.trim())
            .map_err(|e| ChatError::Transport(format!("Invalid routing address: {}", e)))?;
        Ok(postcard::from_bytes(&bytes)?)
    }
}

struct TopicState {
    sender: Arc<AsyncMutex<GossipSender>>,
    receiver: Option<GossipReceiver>,
    pump: Option<JoinHandle<()>>,
}

/// Handle for a subscribed gossip topic
pub struct IrohSubscription {
    topic: TopicId,
}

/// Session transport over iroh-gossip
pub struct IrohTransport {
    endpoint: Endpoint,
    gossip: Gossip,
    router: Router,
    /// Static discovery provider for out-of-band peer addresses
    static_provider: StaticProvider,
    sealer: Arc<FrameSealer>,
    topics: Mutex<HashMap<TopicId, TopicState>>,
    /// Held from the map lookup until a new topic is inserted
    subscribing: AsyncMutex<()>,
}

impl IrohTransport {
    /// Bind a new endpoint with a fresh identity
    pub async fn bind() -> ChatResult<Self> {
        Self::with_secret_key(None).await
    }

    /// Bind an endpoint with a specific secret key (persistent identity)
    pub async fn with_secret_key(secret_key: Option<SecretKey>) -> ChatResult<Self> {
        let secret_key = secret_key.unwrap_or_else(|| SecretKey::generate(&mut rand::rng()));
        let sealer = FrameSealer::from_seed(&secret_key.to_bytes());

        let static_provider = StaticProvider::new();

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![GOSSIP_ALPN.to_vec()])
            .discovery(static_provider.clone())
            .bind()
            .await
            .map_err(|e| ChatError::Transport(format!("Failed to bind endpoint: {}", e)))?;

        let endpoint_id = endpoint.id();
        info!(%endpoint_id, "Endpoint bound");

        let gossip = Gossip::builder()
            .max_message_size(MAX_MESSAGE_SIZE)
            .spawn(endpoint.clone());

        let router = Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, gossip.clone())
            .spawn();

        Ok(Self {
            endpoint,
            gossip,
            router,
            static_provider,
            sealer: Arc::new(sealer),
            topics: Mutex::new(HashMap::new()),
            subscribing: AsyncMutex::new(()),
        })
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    pub fn endpoint_addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// Make a peer's address known to iroh without DNS discovery
    pub fn add_peer_addr(&self, endpoint_addr: EndpointAddr) {
        debug!(peer = %endpoint_addr.id, "Adding peer address to static discovery");
        self.static_provider.add_endpoint_info(endpoint_addr);
    }

    fn topic_sender(&self, topic: &TopicId) -> Option<Arc<AsyncMutex<GossipSender>>> {
        self.topics.lock().get(topic).map(|t| t.sender.clone())
    }

    async fn join_peers(
        sender: Arc<AsyncMutex<GossipSender>>,
        bootstrap: Vec<EndpointId>,
    ) -> ChatResult<Arc<AsyncMutex<GossipSender>>> {
        if !bootstrap.is_empty() {
            sender
                .lock()
                .await
                .join_peers(bootstrap)
                .await
                .map_err(|e| ChatError::Transport(format!("Failed to join peers: {}", e)))?;
        }
        Ok(sender)
    }

    /// Subscribe to `topic` if needed and ask gossip to connect `bootstrap`.
    ///
    /// Concurrent callers for a new topic share a single gossip subscription.
    async fn ensure_topic(
        &self,
        topic: TopicId,
        bootstrap: Vec<EndpointId>,
    ) -> ChatResult<Arc<AsyncMutex<GossipSender>>> {
        if let Some(sender) = self.topic_sender(&topic) {
            return Self::join_peers(sender, bootstrap).await;
        }

        let guard = self.subscribing.lock().await;
        if let Some(sender) = self.topic_sender(&topic) {
            drop(guard);
            return Self::join_peers(sender, bootstrap).await;
        }

        info!(topic = %topic.short(), peers = bootstrap.len(), "Subscribing to gossip topic");
        let gossip_topic = self
            .gossip
            .subscribe(GossipTopicId::from_bytes(*topic.as_bytes()), bootstrap)
            .await
            .map_err(|e| ChatError::Transport(format!("Failed to subscribe: {}", e)))?;
        let (sender, receiver) = gossip_topic.split();

        let sender = Arc::new(AsyncMutex::new(sender));
        self.topics.lock().insert(
            topic,
            TopicState {
                sender: sender.clone(),
                receiver: Some(receiver),
                pump: None,
            },
        );
        Ok(sender)
    }

    /// Number of gossip topics currently subscribed
    pub fn topic_count(&self) -> usize {
        self.topics.lock().len()
    }

    /// Leave every topic and close the endpoint
    pub async fn shutdown(&self) {
        info!("Shutting down gossip transport");

        for (_, state) in self.topics.lock().drain() {
            if let Some(pump) = state.pump {
                pump.abort();
            }
        }

        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }
        self.endpoint.close().await;
    }
}

async fn pump_topic(
    topic: TopicId,
    mut receiver: GossipReceiver,
    sealer: Arc<FrameSealer>,
    tx: mpsc::UnboundedSender<InboundMessage>,
) {
    use n0_future::StreamExt;

    loop {
        match receiver.try_next().await {
            Ok(Some(Event::Received(msg))) => {
                let frame = match SealedFrame::from_bytes(&msg.content) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(topic = %topic.short(), error = %e, "Skipping non-frame gossip message");
                        continue;
                    }
                };
                match sealer.open(topic, &frame) {
                    Ok(Some((sender, data))) => {
                        if tx.send(InboundMessage { data, sender }).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(topic = %topic.short(), from = ?msg.delivered_from, error = %e, "Rejecting frame");
                    }
                }
            }
            Ok(Some(Event::NeighborUp(peer))) => {
                info!(topic = %topic.short(), %peer, "Neighbor joined");
            }
            Ok(Some(Event::NeighborDown(peer))) => {
                info!(topic = %topic.short(), %peer, "Neighbor left");
            }
            Ok(Some(Event::Lagged)) => {
                warn!(topic = %topic.short(), "Lagged behind on topic");
            }
            Ok(None) => {
                debug!(topic = %topic.short(), "Topic subscription closed");
                break;
            }
            Err(e) => {
                warn!(topic = %topic.short(), error = ?e, "Error receiving from topic");
                break;
            }
        }
    }
}

impl Transport for IrohTransport {
    type Subscription = IrohSubscription;

    fn public_key(&self) -> PeerKey {
        self.sealer.public_key()
    }

    fn routing_address(&self) -> String {
        match RoutingAddress::from_endpoint_addr(&self.endpoint.addr()).encode() {
            Ok(address) => address,
            Err(e) => {
                warn!(error = %e, "Failed to encode routing address");
                String::new()
            }
        }
    }

    async fn subscribe_topic(&self, topic: TopicId) -> ChatResult<IrohSubscription> {
        self.ensure_topic(topic, Vec::new()).await?;
        Ok(IrohSubscription { topic })
    }

    fn create_subscription(
        &self,
        subscription: &IrohSubscription,
    ) -> ChatResult<mpsc::UnboundedReceiver<InboundMessage>> {
        let topic = subscription.topic;
        let mut topics = self.topics.lock();
        let state = topics
            .get_mut(&topic)
            .ok_or_else(|| ChatError::Transport(format!("Not subscribed to {}", topic.short())))?;
        let receiver = state.receiver.take().ok_or_else(|| {
            ChatError::Transport("Subscription stream already created".into())
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        state.pump = Some(tokio::spawn(pump_topic(
            topic,
            receiver,
            self.sealer.clone(),
            tx,
        )));
        Ok(rx)
    }

    async fn register_peer_key(&self, topic: TopicId, peer: PeerKey, address: &str) -> ChatResult<()> {
        let endpoint_id = PublicKey::from_bytes(peer.as_bytes())
            .map_err(|e| ChatError::Transport(format!("Invalid peer key: {}", e)))?;

        if !address.is_empty() {
            match RoutingAddress::decode(address).and_then(|a| a.to_endpoint_addr()) {
                Ok(addr) if addr.id == endpoint_id => self.add_peer_addr(addr),
                Ok(addr) => {
                    warn!(peer = %peer.short(), announced = %addr.id, "Address belongs to another endpoint, ignoring");
                }
                Err(e) => warn!(peer = %peer.short(), error = %e, "Ignoring unusable address"),
            }
        }

        self.ensure_topic(topic, vec![endpoint_id]).await?;
        Ok(())
    }

    async fn send_asymmetric(&self, peer: PeerKey, topic: TopicId, payload: Vec<u8>) -> ChatResult<()> {
        let frame = self.sealer.seal(peer, topic, &payload)?.to_bytes()?;
        let sender = self.ensure_topic(topic, Vec::new()).await?;

        debug!(topic = %topic.short(), to = %peer.short(), len = frame.len(), "Broadcasting frame");
        let result = sender
            .lock()
            .await
            .broadcast(frame.into())
            .await
            .map_err(|e| ChatError::Transport(format!("Failed to broadcast: {}", e)));
        result
    }

    fn unsubscribe_topic(&self, topic: TopicId) {
        if let Some(state) = self.topics.lock().remove(&topic) {
            if let Some(pump) = state.pump {
                pump.abort();
            }
            info!(topic = %topic.short(), "Left gossip topic");
        }
    }
}

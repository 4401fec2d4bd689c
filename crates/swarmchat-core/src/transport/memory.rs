//! In-process loopback network
//!
//! Every [`MemoryTransport`] created from the same [`MemoryNetwork`] can reach
//! the others. Delivery follows the overlay contract the session layer is
//! written against: a payload reaches a peer only if that peer currently
//! has a live subscription on the topic, otherwise it is silently dropped.
//! The sender must have registered the recipient's key on the topic first.
//!
//! The network keeps a log of delivered payloads and can inject arbitrary
//! bytes, which tests use to replay envelopes and forge malformed input.
//! It can also refuse registrations for an address and hold subscriptions
//! to a topic open-ended, standing in for unreachable peers and slow joins.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

use super::{InboundMessage, Transport};
use crate::error::{ChatError, ChatResult};
use crate::types::{PeerKey, TopicId};

/// A payload that reached at least one subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub from: PeerKey,
    pub to: PeerKey,
    pub topic: TopicId,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct NetworkState {
    inboxes: HashMap<(PeerKey, TopicId), Vec<mpsc::UnboundedSender<InboundMessage>>>,
    deliveries: Vec<Delivery>,
    offline: HashSet<PeerKey>,
    refused: HashSet<String>,
    held: HashSet<TopicId>,
}

/// Shared medium connecting loopback transports
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new node with a random key
    pub fn transport(&self) -> MemoryTransport {
        let key = PeerKey::random();
        self.transport_with_address(format!("mem://{}", key.short()))
            .with_key(key)
    }

    /// Attach a new node announcing `address`
    pub fn transport_with_address(&self, address: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            key: PeerKey::random(),
            address: RwLock::new(address.into()),
            network: self.clone(),
            subscribed: Mutex::new(HashSet::new()),
            authorized: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver raw bytes to `to` on `topic` as if `sender` had sent them.
    ///
    /// Returns the number of live subscriptions reached.
    pub fn inject(&self, to: PeerKey, topic: TopicId, sender: PeerKey, data: Vec<u8>) -> usize {
        self.deliver(Delivery {
            from: sender,
            to,
            topic,
            data,
        })
    }

    /// Everything delivered so far, in order
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.state.lock().deliveries.clone()
    }

    /// Deliveries that reached `to` on `topic`
    pub fn deliveries_to(&self, to: PeerKey, topic: TopicId) -> Vec<Delivery> {
        self.state
            .lock()
            .deliveries
            .iter()
            .filter(|d| d.to == to && d.topic == topic)
            .cloned()
            .collect()
    }

    /// Take a node off the network (or bring it back)
    pub fn set_offline(&self, key: PeerKey, offline: bool) {
        let mut state = self.state.lock();
        if offline {
            state.offline.insert(key);
        } else {
            state.offline.remove(&key);
        }
    }

    /// Make registering any peer under `address` fail
    pub fn refuse_address(&self, address: impl Into<String>) {
        self.state.lock().refused.insert(address.into());
    }

    /// Keep subscriptions to `topic` pending until released
    pub fn hold_topic(&self, topic: TopicId, held: bool) {
        let mut state = self.state.lock();
        if held {
            state.held.insert(topic);
        } else {
            state.held.remove(&topic);
        }
    }

    fn is_refused(&self, address: &str) -> bool {
        self.state.lock().refused.contains(address)
    }

    fn is_held(&self, topic: &TopicId) -> bool {
        self.state.lock().held.contains(topic)
    }

    fn is_offline(&self, key: &PeerKey) -> bool {
        self.state.lock().offline.contains(key)
    }

    fn deliver(&self, delivery: Delivery) -> usize {
        let mut state = self.state.lock();
        if state.offline.contains(&delivery.to) {
            debug!(to = %delivery.to.short(), "Recipient offline, dropping");
            return 0;
        }

        let message = InboundMessage {
            data: delivery.data.clone(),
            sender: delivery.from,
        };
        let reached = match state.inboxes.get_mut(&(delivery.to, delivery.topic)) {
            Some(senders) => {
                senders.retain(|tx| tx.send(message.clone()).is_ok());
                senders.len()
            }
            None => 0,
        };

        if reached > 0 {
            state.deliveries.push(delivery);
        } else {
            debug!(
                to = %delivery.to.short(),
                topic = %delivery.topic.short(),
                "No subscriber on topic, dropping"
            );
        }
        reached
    }

    fn attach(&self, key: PeerKey, topic: TopicId, tx: mpsc::UnboundedSender<InboundMessage>) {
        self.state
            .lock()
            .inboxes
            .entry((key, topic))
            .or_default()
            .push(tx);
    }

    fn detach(&self, key: PeerKey, topic: TopicId) {
        self.state.lock().inboxes.remove(&(key, topic));
    }
}

/// Subscription handle; yields one inbound stream
pub struct MemorySubscription {
    topic: TopicId,
    consumed: AtomicBool,
}

/// One node on a [`MemoryNetwork`]
pub struct MemoryTransport {
    key: PeerKey,
    address: RwLock<String>,
    network: MemoryNetwork,
    subscribed: Mutex<HashSet<TopicId>>,
    authorized: Mutex<HashMap<TopicId, HashMap<PeerKey, String>>>,
}

impl MemoryTransport {
    fn with_key(mut self, key: PeerKey) -> Self {
        self.key = key;
        self
    }

    /// Change the announced routing address
    pub fn set_address(&self, address: impl Into<String>) {
        *self.address.write() = address.into();
    }

    /// Address `peer` was last registered with on `topic`
    pub fn registered_address(&self, topic: TopicId, peer: PeerKey) -> Option<String> {
        self.authorized
            .lock()
            .get(&topic)
            .and_then(|peers| peers.get(&peer).cloned())
    }

    pub fn is_subscribed(&self, topic: TopicId) -> bool {
        self.subscribed.lock().contains(&topic)
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl Transport for MemoryTransport {
    type Subscription = MemorySubscription;

    fn public_key(&self) -> PeerKey {
        self.key
    }

    fn routing_address(&self) -> String {
        self.address.read().clone()
    }

    async fn subscribe_topic(&self, topic: TopicId) -> ChatResult<MemorySubscription> {
        while self.network.is_held(&topic) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if self.network.is_offline(&self.key) {
            return Err(ChatError::Transport("Node is offline".into()));
        }
        self.subscribed.lock().insert(topic);
        debug!(topic = %topic.short(), "Subscribed");
        Ok(MemorySubscription {
            topic,
            consumed: AtomicBool::new(false),
        })
    }

    fn create_subscription(
        &self,
        subscription: &MemorySubscription,
    ) -> ChatResult<mpsc::UnboundedReceiver<InboundMessage>> {
        if subscription.consumed.swap(true, Ordering::SeqCst) {
            return Err(ChatError::Transport(
                "Subscription stream already created".into(),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.network.attach(self.key, subscription.topic, tx);
        Ok(rx)
    }

    async fn register_peer_key(&self, topic: TopicId, peer: PeerKey, address: &str) -> ChatResult<()> {
        if self.network.is_refused(address) {
            return Err(ChatError::Transport(format!(
                "Unreachable address for {}: {}",
                peer.short(),
                address
            )));
        }
        self.authorized
            .lock()
            .entry(topic)
            .or_default()
            .insert(peer, address.to_string());
        Ok(())
    }

    async fn send_asymmetric(&self, peer: PeerKey, topic: TopicId, payload: Vec<u8>) -> ChatResult<()> {
        if self.network.is_offline(&self.key) {
            return Err(ChatError::Transport("Node is offline".into()));
        }

        let authorized = self
            .authorized
            .lock()
            .get(&topic)
            .map(|peers| peers.contains_key(&peer))
            .unwrap_or(false);
        if !authorized {
            return Err(ChatError::Transport(format!(
                "Peer {} not registered on topic {}",
                peer.short(),
                topic.short()
            )));
        }

        self.network.deliver(Delivery {
            from: self.key,
            to: peer,
            topic,
            data: payload,
        });
        Ok(())
    }

    fn unsubscribe_topic(&self, topic: TopicId) {
        self.subscribed.lock().remove(&topic);
        self.network.detach(self.key, topic);
    }
}

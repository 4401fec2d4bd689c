//! One pub/sub topic and the peers we address on it
//!
//! A [`TopicSession`] owns the transport subscription for its topic. An
//! inbound pump task decodes every payload through the shared
//! [`EnvelopeCodec`] (so replays are dropped once, before fan-out) and
//! hands the surviving events to every subscriber over its own unbounded
//! channel. A slow subscriber delays only itself and never loses events.
//!
//! ```text
//! transport ──> pump (decode + dedup) ──> fan-out ──┬─> subscriber (router)
//!                                                   └─> subscriber (...)
//! ```
//!
//! Events that arrive before anyone listens are buffered and handed to the
//! first subscriber.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::ChatResult;
use crate::protocol::{EnvelopeCodec, ProtocolEvent};
use crate::transport::{InboundMessage, Transport};
use crate::types::{PeerKey, TopicId};

/// A decoded event together with where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedEvent {
    pub topic: TopicId,
    /// Sender as authenticated by the transport
    pub sender: PeerKey,
    pub event: ProtocolEvent,
}

/// Handle to a running subscriber.
///
/// Dropping the handle leaves the subscriber running; it stops on
/// [`Subscription::unsubscribe`] or when the session closes.
#[derive(Debug)]
pub struct Subscription {
    handle: AbortHandle,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.handle.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Subscriber channels, plus the backlog kept until the first one attaches
struct Fanout {
    subscribers: Vec<mpsc::UnboundedSender<ReceivedEvent>>,
    backlog: Option<Vec<ReceivedEvent>>,
}

impl Fanout {
    fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            backlog: Some(Vec::new()),
        }
    }

    fn publish(&mut self, event: ReceivedEvent) {
        if let Some(backlog) = self.backlog.as_mut() {
            backlog.push(event);
            return;
        }
        // No subscribers left is fine: nobody is listening on this topic now
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn attach(&mut self) -> mpsc::UnboundedReceiver<ReceivedEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in self.backlog.take().unwrap_or_default() {
            let _ = tx.send(event);
        }
        self.subscribers.push(tx);
        rx
    }
}

pub struct TopicSession<T: Transport> {
    topic: TopicId,
    transport: Arc<T>,
    codec: Arc<EnvelopeCodec>,
    /// Authorized recipients and the address they were registered with
    peers: RwLock<HashMap<PeerKey, String>>,
    fanout: Arc<Mutex<Fanout>>,
    tasks: Mutex<Vec<AbortHandle>>,
    closed: AtomicBool,
    _subscription: T::Subscription,
}

impl<T: Transport> TopicSession<T> {
    /// Subscribe to `topic` and start the inbound pump
    pub async fn create(
        transport: Arc<T>,
        codec: Arc<EnvelopeCodec>,
        topic: TopicId,
    ) -> ChatResult<Arc<Self>> {
        let subscription = transport.subscribe_topic(topic).await?;
        let inbound = match transport.create_subscription(&subscription) {
            Ok(inbound) => inbound,
            Err(e) => {
                transport.unsubscribe_topic(topic);
                return Err(e);
            }
        };

        let fanout = Arc::new(Mutex::new(Fanout::new()));
        let pump = tokio::spawn(pump_inbound(topic, codec.clone(), inbound, fanout.clone()));

        info!(topic = %topic.short(), "Topic session created");

        Ok(Arc::new(Self {
            topic,
            transport,
            codec,
            peers: RwLock::new(HashMap::new()),
            fanout,
            tasks: Mutex::new(vec![pump.abort_handle()]),
            closed: AtomicBool::new(false),
            _subscription: subscription,
        }))
    }

    pub fn topic(&self) -> TopicId {
        self.topic
    }

    /// Authorize `key` as a recipient, registering it with the transport.
    ///
    /// Registering again with a different address re-registers the key.
    pub async fn add_peer(&self, key: PeerKey, address: &str) -> ChatResult<()> {
        if key == self.transport.public_key() {
            return Ok(());
        }
        self.transport
            .register_peer_key(self.topic, key, address)
            .await?;
        self.peers.write().insert(key, address.to_string());
        debug!(topic = %self.topic.short(), peer = %key.short(), "Peer registered");
        Ok(())
    }

    pub fn has_peer(&self, key: &PeerKey) -> bool {
        self.peers.read().contains_key(key)
    }

    /// Address `key` was last registered with
    pub fn peer_address(&self, key: &PeerKey) -> Option<String> {
        self.peers.read().get(key).cloned()
    }

    pub fn peers(&self) -> Vec<PeerKey> {
        let mut peers: Vec<_> = self.peers.read().keys().copied().collect();
        peers.sort();
        peers
    }

    /// Send `event` to one peer, sealed for it alone
    pub async fn send_to_peer(&self, key: PeerKey, event: &ProtocolEvent) -> ChatResult<()> {
        let data = self.codec.encode(event)?;
        debug!(
            topic = %self.topic.short(),
            to = %key.short(),
            kind = event.kind(),
            "Sending event"
        );
        self.transport.send_asymmetric(key, self.topic, data).await
    }

    /// Send `event` to every registered peer, each under its own envelope.
    ///
    /// Returns how many peers it reached. Fails only if every peer failed;
    /// with no peers registered nothing is sent.
    pub async fn send_to_all(&self, event: &ProtocolEvent) -> ChatResult<usize> {
        let peers = self.peers();
        if peers.is_empty() {
            debug!(topic = %self.topic.short(), kind = event.kind(), "No peers registered, nothing sent");
            return Ok(0);
        }

        let mut delivered = 0;
        let mut last_error = None;
        for peer in peers {
            match self.send_to_peer(peer, event).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        topic = %self.topic.short(),
                        peer = %peer.short(),
                        kind = event.kind(),
                        error = %e,
                        "Send to peer failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if delivered == 0 => Err(e),
            _ => Ok(delivered),
        }
    }

    /// Raw receiver of decoded events.
    ///
    /// The first call also receives whatever arrived before anyone listened.
    pub fn events(&self) -> mpsc::UnboundedReceiver<ReceivedEvent> {
        self.fanout.lock().attach()
    }

    /// Run `handler` for every inbound event.
    ///
    /// Events are handled one at a time: the next is not taken until the
    /// previous handler future completes.
    pub fn subscribe<F, Fut>(&self, mut handler: F) -> Subscription
    where
        F: FnMut(ReceivedEvent) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.events();
        let topic = self.topic;

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler(event).await;
            }
            debug!(topic = %topic.short(), "Subscriber stopped");
        });

        let handle = task.abort_handle();
        self.tasks.lock().push(handle.clone());
        Subscription { handle }
    }

    /// Stop the pump and all subscribers and leave the topic.
    ///
    /// Runs once; later calls and the drop that follows do nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.transport.unsubscribe_topic(self.topic);
        info!(topic = %self.topic.short(), "Topic session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl<T: Transport> Drop for TopicSession<T> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn pump_inbound(
    topic: TopicId,
    codec: Arc<EnvelopeCodec>,
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    fanout: Arc<Mutex<Fanout>>,
) {
    while let Some(message) = inbound.recv().await {
        let Some(event) = codec.decode(&message.data) else {
            continue;
        };
        debug!(
            topic = %topic.short(),
            sender = %message.sender.short(),
            kind = event.kind(),
            "Inbound event"
        );
        fanout.lock().publish(ReceivedEvent {
            topic,
            sender: message.sender,
            event,
        });
    }
    debug!(topic = %topic.short(), "Inbound stream ended");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::transport::{MemoryNetwork, MemoryTransport};
    use crate::types::MessageBlock;

    const WAIT: Duration = Duration::from_secs(2);

    async fn session(
        transport: &Arc<MemoryTransport>,
        topic: TopicId,
    ) -> Arc<TopicSession<MemoryTransport>> {
        TopicSession::create(
            transport.clone(),
            Arc::new(EnvelopeCodec::default()),
            topic,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_to_all_reaches_each_peer() {
        let network = MemoryNetwork::new();
        let alice = Arc::new(network.transport());
        let bob = Arc::new(network.transport());
        let carol = Arc::new(network.transport());
        let topic = TopicId::random();

        let a = session(&alice, topic).await;
        let b = session(&bob, topic).await;
        let c = session(&carol, topic).await;
        a.add_peer(bob.public_key(), "").await.unwrap();
        a.add_peer(carol.public_key(), "").await.unwrap();

        let mut b_events = b.events();
        let mut c_events = c.events();

        let event = ProtocolEvent::topic_message(vec![MessageBlock::text("hi")]);
        assert_eq!(a.send_to_all(&event).await.unwrap(), 2);

        let got = timeout(WAIT, b_events.recv()).await.unwrap().unwrap();
        assert_eq!(got.sender, alice.public_key());
        assert_eq!(got.event, event);
        let got = timeout(WAIT, c_events.recv()).await.unwrap().unwrap();
        assert_eq!(got.topic, topic);

        // Each peer got its own envelope
        let deliveries = network.deliveries();
        assert_eq!(deliveries.len(), 2);
        assert_ne!(deliveries[0].data, deliveries[1].data);
    }

    #[tokio::test]
    async fn test_send_to_all_without_peers() {
        let network = MemoryNetwork::new();
        let alice = Arc::new(network.transport());
        let a = session(&alice, TopicId::random()).await;

        assert_eq!(a.send_to_all(&ProtocolEvent::typing(true)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_to_all_fails_only_when_every_peer_fails() {
        let network = MemoryNetwork::new();
        let alice = Arc::new(network.transport());
        let topic = TopicId::random();
        let a = session(&alice, topic).await;
        a.add_peer(PeerKey::random(), "").await.unwrap();

        network.set_offline(alice.public_key(), true);
        assert!(a.send_to_all(&ProtocolEvent::typing(true)).await.is_err());

        network.set_offline(alice.public_key(), false);
        assert_eq!(a.send_to_all(&ProtocolEvent::typing(true)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_first_subscriber_sees_buffered_events() {
        let network = MemoryNetwork::new();
        let alice = Arc::new(network.transport());
        let bob = Arc::new(network.transport());
        let topic = TopicId::random();

        let a = session(&alice, topic).await;
        let b = session(&bob, topic).await;
        a.add_peer(bob.public_key(), "").await.unwrap();

        a.send_to_all(&ProtocolEvent::typing(true)).await.unwrap();
        tokio::task::yield_now().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = b.subscribe(move |received| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(received.event);
            }
        });

        let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(got, ProtocolEvent::typing(true));
    }

    #[tokio::test]
    async fn test_duplicate_envelope_dropped_before_fanout() {
        let network = MemoryNetwork::new();
        let bob = Arc::new(network.transport());
        let topic = TopicId::random();
        let b = session(&bob, topic).await;
        let mut events = b.events();

        let data =
            EnvelopeCodec::encode_with_nonce(&ProtocolEvent::typing(true), "00aa00aa00aa00aa").unwrap();
        let sender = PeerKey::random();
        network.inject(bob.public_key(), topic, sender, data.clone());
        network.inject(bob.public_key(), topic, sender, data);
        network.inject(bob.public_key(), topic, sender, b"garbage".to_vec());

        let first = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(first.sender, sender);
        assert!(timeout(Duration::from_millis(100), events.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_close() {
        let network = MemoryNetwork::new();
        let bob = Arc::new(network.transport());
        let topic = TopicId::random();
        let b = session(&bob, topic).await;

        let sub = b.subscribe(|_| async {});
        assert!(sub.is_active());
        sub.unsubscribe();

        b.close();
        assert!(!bob.is_subscribed(topic));
        assert_eq!(
            network.inject(bob.public_key(), topic, PeerKey::random(), b"{}".to_vec()),
            0
        );
    }

    #[tokio::test]
    async fn test_add_peer_skips_self() {
        let network = MemoryNetwork::new();
        let alice = Arc::new(network.transport());
        let a = session(&alice, TopicId::random()).await;

        a.add_peer(alice.public_key(), "").await.unwrap();
        assert!(a.peers().is_empty());
    }

    #[tokio::test]
    async fn test_burst_reaches_slow_subscriber() {
        let network = MemoryNetwork::new();
        let bob = Arc::new(network.transport());
        let topic = TopicId::random();
        let b = session(&bob, topic).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = b.subscribe(move |received| {
            let tx = tx.clone();
            async move {
                tokio::task::yield_now().await;
                let _ = tx.send(received.event);
            }
        });

        let sender = PeerKey::random();
        for i in 0..200u32 {
            let event = ProtocolEvent::topic_message(vec![MessageBlock::text(format!("m{}", i))]);
            let data = EnvelopeCodec::encode_with_nonce(&event, &format!("{:016x}", i)).unwrap();
            network.inject(bob.public_key(), topic, sender, data);
        }

        for i in 0..200u32 {
            let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            assert_eq!(
                got,
                ProtocolEvent::topic_message(vec![MessageBlock::text(format!("m{}", i))])
            );
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_every_event() {
        let network = MemoryNetwork::new();
        let bob = Arc::new(network.transport());
        let topic = TopicId::random();
        let b = session(&bob, topic).await;
        let mut first = b.events();
        let mut second = b.events();

        let sender = PeerKey::random();
        for i in 0..50u32 {
            let data =
                EnvelopeCodec::encode_with_nonce(&ProtocolEvent::typing(i % 2 == 0), &format!("{:016x}", i))
                    .unwrap();
            network.inject(bob.public_key(), topic, sender, data);
        }

        for _ in 0..50 {
            timeout(WAIT, first.recv()).await.unwrap().unwrap();
            timeout(WAIT, second.recv()).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_drop_closes_session() {
        let network = MemoryNetwork::new();
        let bob = Arc::new(network.transport());
        let topic = TopicId::random();

        let b = session(&bob, topic).await;
        assert!(bob.is_subscribed(topic));

        drop(b);
        assert!(!bob.is_subscribed(topic));
    }

    #[tokio::test]
    async fn test_close_runs_once() {
        let network = MemoryNetwork::new();
        let bob = Arc::new(network.transport());
        let topic = TopicId::random();
        let b = session(&bob, topic).await;

        b.close();
        assert!(b.is_closed());

        // A new session on the same topic survives the old one going away
        let again = session(&bob, topic).await;
        b.close();
        drop(b);
        assert!(bob.is_subscribed(topic));
        assert!(!again.is_closed());
    }
}

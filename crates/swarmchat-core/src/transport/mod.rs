//! Pub/sub transport boundary
//!
//! The session layer never talks to the network directly. It needs a
//! topic-addressed overlay that can:
//!
//! - subscribe to a topic and hand back a stream of `{data, sender}`;
//! - authorize a peer's key on a topic (optionally with a routing address);
//! - deliver a payload to exactly one peer on a topic, encrypted for it.
//!
//! The `sender` attached to inbound messages is trusted: implementations must
//! only report a key whose owner demonstrably produced the payload.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryNetwork`] / [`MemoryTransport`]: in-process loopback, used by
//!   tests and the CLI demo
//! - [`IrohTransport`]: iroh-gossip topics with per-recipient sealed frames

use std::future::Future;

use tokio::sync::mpsc;

use crate::error::ChatResult;
use crate::types::{PeerKey, TopicId};

pub mod gossip;
pub mod memory;
pub mod sealed;

pub use gossip::IrohTransport;
pub use memory::{Delivery, MemoryNetwork, MemoryTransport};

/// A payload received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub data: Vec<u8>,
    /// Authenticated originator of `data`
    pub sender: PeerKey,
}

/// Topic-addressed, per-recipient encrypted overlay
pub trait Transport: Send + Sync + 'static {
    /// Handle for one topic subscription
    type Subscription: Send + Sync + 'static;

    /// Our own public key; peers address us by it
    fn public_key(&self) -> PeerKey;

    /// Our current routing address. Longer means more specific; empty means
    /// "discover me through the overlay".
    fn routing_address(&self) -> String;

    /// Derive a topic from a human-readable name
    fn string_to_topic(&self, name: &str) -> TopicId {
        TopicId::from_name(name)
    }

    /// Join a topic
    fn subscribe_topic(
        &self,
        topic: TopicId,
    ) -> impl Future<Output = ChatResult<Self::Subscription>> + Send;

    /// Start receiving on a subscription. Each subscription yields one stream.
    fn create_subscription(
        &self,
        subscription: &Self::Subscription,
    ) -> ChatResult<mpsc::UnboundedReceiver<InboundMessage>>;

    /// Authorize `peer` as a recipient on `topic`, optionally at `address`
    fn register_peer_key(
        &self,
        topic: TopicId,
        peer: PeerKey,
        address: &str,
    ) -> impl Future<Output = ChatResult<()>> + Send;

    /// Deliver `payload` on `topic` to `peer` only
    fn send_asymmetric(
        &self,
        peer: PeerKey,
        topic: TopicId,
        payload: Vec<u8>,
    ) -> impl Future<Output = ChatResult<()>> + Send;

    /// Leave a topic; inbound streams for it end
    fn unsubscribe_topic(&self, topic: TopicId);
}

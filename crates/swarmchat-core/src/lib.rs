//! Swarmchat Core Library
//!
//! Session and protocol layer for end-to-end encrypted chat over a
//! topic-addressed pub/sub overlay.
//!
//! ## Overview
//!
//! Peers meet on topics: a contact topic derived from each peer's key for
//! unsolicited requests, a random two-party topic per direct conversation,
//! and a random N-party topic per channel. Every payload is wrapped in a
//! nonce-tagged JSON envelope and delivered to one recipient at a time,
//! encrypted for that recipient by the transport.
//!
//! - **protocol**: envelope codec, replay registry, event kinds
//! - **session**: topic sessions, routing, contact and channel handshakes
//! - **transport**: the `Transport` trait plus loopback and iroh-gossip
//!   implementations
//! - **store**: the `Store` trait plus an in-memory implementation
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use swarmchat_core::{MemoryNetwork, MemoryStore, SessionConfig, SessionManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = MemoryNetwork::new();
//!     let alice = SessionManager::new(
//!         Arc::new(network.transport()),
//!         Arc::new(MemoryStore::new()),
//!         SessionConfig::default(),
//!     )?;
//!     alice.start().await?;
//!
//!     let topic = alice.request_contact(bob_key, &bob_address).await?;
//!     alice.send_text(topic, "hello bob").await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;

// Re-exports
pub use config::{LoggingConfig, SessionConfig};
pub use error::{ChatError, ChatResult};
pub use logging::init_logging;
pub use protocol::{EnvelopeCodec, ProtocolEvent, TopicClass};
pub use session::{
    contact_topic_name, ReceivedEvent, SessionEvent, SessionManager, Subscription, TopicRegistry,
    TopicSession,
};
pub use store::{MemoryStore, Store};
pub use transport::{IrohTransport, MemoryNetwork, MemoryTransport, Transport};
pub use types::*;

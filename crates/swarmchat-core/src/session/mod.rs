//! Session layer: topic sessions, routing and handshakes
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  SessionManager                                                  │
//! │  ├── SessionContext (shared with every router task)              │
//! │  │   ├── transport: Arc<T: Transport>                            │
//! │  │   ├── store: Arc<dyn Store>                                   │
//! │  │   ├── codec: EnvelopeCodec (nonce registry)                   │
//! │  │   ├── registry: TopicRegistry<TopicSession<T>>                │
//! │  │   └── events: broadcast::Sender<SessionEvent>                 │
//! │  └── command task                                                │
//! │      └── joins channels queued by routers                        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Routers run one per joined topic. They never join topics themselves;
//! a `CHANNEL_INVITE` is turned into a [`Command`] for the manager's
//! command task.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::config::SessionConfig;
use crate::protocol::{ChannelInvitePayload, EnvelopeCodec};
use crate::store::Store;
use crate::transport::Transport;
use crate::types::PeerKey;

pub mod events;
mod handshake;
mod manager;
pub mod registry;
mod router;
pub mod topic;

pub use events::SessionEvent;
pub use handshake::contact_topic_name;
pub use manager::SessionManager;
pub use registry::TopicRegistry;
pub use topic::{ReceivedEvent, Subscription, TopicSession};

/// Work a router hands to the manager's command task
#[derive(Debug)]
pub(crate) enum Command {
    JoinChannel {
        invite: ChannelInvitePayload,
        from: PeerKey,
    },
}

/// State shared by the manager, its routers and its command task
pub(crate) struct SessionContext<T: Transport> {
    pub transport: Arc<T>,
    pub store: Arc<dyn Store>,
    pub codec: Arc<EnvelopeCodec>,
    pub registry: TopicRegistry<TopicSession<T>>,
    pub config: SessionConfig,
    pub events: broadcast::Sender<SessionEvent>,
    pub commands: mpsc::UnboundedSender<Command>,
}

impl<T: Transport> SessionContext<T> {
    pub fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    pub fn own_key(&self) -> PeerKey {
        self.transport.public_key()
    }
}

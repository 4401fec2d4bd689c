//! Session configuration
//!
//! Every field has a default, so an empty JSON object (or no file at all)
//! yields a working configuration:
//!
//! ```json
//! {
//!   "nonce_capacity": 65536,
//!   "nonce_window_secs": 86400,
//!   "event_channel_capacity": 256,
//!   "contact_topic_prefix": "swarmchat:contact:",
//!   "logging": { "filter": "info", "logs_dir": "./logs", "instance": "alice" }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};
use crate::protocol::envelope::{DEFAULT_NONCE_CAPACITY, DEFAULT_NONCE_WINDOW};

/// Capacity of the session event broadcast. Topic sessions hand events to
/// their subscribers over unbounded channels and are not limited by it.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Prefix hashed together with a peer key to derive its contact topic
pub const CONTACT_TOPIC_PREFIX: &str = "swarmchat:contact:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of remembered envelope nonces
    pub nonce_capacity: usize,
    /// Seconds after which a remembered nonce is forgotten
    pub nonce_window_secs: u64,
    pub event_channel_capacity: usize,
    pub contact_topic_prefix: String,
    pub logging: LoggingConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            nonce_capacity: DEFAULT_NONCE_CAPACITY,
            nonce_window_secs: DEFAULT_NONCE_WINDOW.as_secs(),
            event_channel_capacity: EVENT_CHANNEL_CAPACITY,
            contact_topic_prefix: CONTACT_TOPIC_PREFIX.to_string(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> ChatResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| ChatError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the session cannot run with
    pub fn validate(&self) -> ChatResult<()> {
        if self.event_channel_capacity == 0 {
            return Err(ChatError::Config(
                "event_channel_capacity must be greater than zero".into(),
            ));
        }
        if self.nonce_window_secs == 0 {
            return Err(ChatError::Config(
                "nonce_window_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn nonce_window(&self) -> Duration {
        Duration::from_secs(self.nonce_window_secs)
    }
}

/// Logging setup consumed by [`crate::logging::init_logging`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Directory for JSONL log files; console only when unset
    pub logs_dir: Option<PathBuf>,
    /// Instance name stamped on every JSONL entry
    pub instance: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            logs_dir: None,
            instance: "swarmchat".to_string(),
        }
    }
}

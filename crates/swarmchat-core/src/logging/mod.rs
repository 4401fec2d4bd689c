//! Logging setup: console output plus optional per-instance JSONL files.
//!
//! ```text
//! logs/
//! ├── 2026-10-17_alice.jsonl
//! └── 2026-10-17_bob.jsonl
//! ```
//!
//! Running several sessions side by side (e.g. `swarmchat demo`) with
//! distinct instance names keeps their files apart; merge them with
//! [`read_entries`] or with jq:
//!
//! ```bash
//! cat logs/*.jsonl | jq -s 'sort_by(.ts)'
//! jq 'select(.level == "warn")' logs/*.jsonl
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

pub use entry::JsonLogEntry;
pub use layer::JsonlLayer;
pub use writer::{read_entries, InstanceLogWriter};

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ChatError, ChatResult};

/// Install the global subscriber described by `config`.
///
/// Console output goes to stderr. `RUST_LOG` takes precedence over
/// `config.filter`. Fails if a global
/// subscriber is already installed or the log directory is unusable.
pub fn init_logging(config: &LoggingConfig) -> ChatResult<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let jsonl = match &config.logs_dir {
        Some(dir) => Some(JsonlLayer::new(dir, &config.instance)?),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(jsonl)
        .try_init()
        .map_err(|e| ChatError::Config(format!("Logging already initialized: {}", e)))
}

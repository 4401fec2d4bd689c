//! One JSONL log record.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single log line.
///
/// Self-contained so that several session instances can append to their
/// own files and the files can later be merged by timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonLogEntry {
    /// RFC 3339 timestamp with milliseconds
    pub ts: String,
    /// trace, debug, info, warn or error
    pub level: String,
    /// Session instance name (e.g. "alice")
    pub instance: String,
    /// Module path, e.g. `swarmchat_core::session::router`
    pub target: String,
    pub msg: String,
    /// Structured fields recorded on the event (`topic`, `sender`, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
    /// Enclosing spans, root first, joined with " > "
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl JsonLogEntry {
    pub fn new(
        level: impl Into<String>,
        instance: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            instance: instance.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    /// Field value as a string, if present
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.as_ref()?.get(name)?.as_str()
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_line_shape() {
        let entry = JsonLogEntry::new("warn", "alice", "swarmchat_core::protocol", "Dropping duplicate envelope")
            .with_fields(serde_json::json!({ "nonce": "0011223344556677" }));

        let json = entry.to_json_line().unwrap();
        assert!(json.contains("\"level\":\"warn\""));
        assert!(json.contains("\"instance\":\"alice\""));
        assert!(!json.contains("\"span\""));

        let parsed = JsonLogEntry::from_json_line(&json).unwrap();
        assert_eq!(parsed.field_str("nonce"), Some("0011223344556677"));
    }
}

//! Profile and peer addressing types

use serde::{Deserialize, Serialize};

use super::PeerKey;

/// Public profile of a peer as exchanged on the wire
///
/// Only `id` is mandatory. A profile set up at startup carries nothing else
/// until the user fills in a display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Public key of the profile owner
    pub id: PeerKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

impl Profile {
    /// Profile carrying nothing but the key
    pub fn new(id: PeerKey) -> Self {
        Self {
            id,
            name: None,
            avatar: None,
            bio: None,
        }
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Overwrite fields that `other` carries; fields it lacks are kept.
    pub fn merge(&mut self, other: &Profile) {
        if other.name.is_some() {
            self.name.clone_from(&other.name);
        }
        if other.avatar.is_some() {
            self.avatar.clone_from(&other.avatar);
        }
        if other.bio.is_some() {
            self.bio.clone_from(&other.bio);
        }
    }

    /// Name for display, falling back to the short key
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.short())
    }
}

/// A channel member as listed in an invite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    #[serde(rename = "pubKey")]
    pub pub_key: PeerKey,
    /// Routing address; empty means rely on overlay discovery
    #[serde(default)]
    pub address: String,
}

impl PeerInfo {
    pub fn new(pub_key: PeerKey, address: impl Into<String>) -> Self {
        Self {
            pub_key,
            address: address.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_merge_keeps_missing_fields() {
        let key = PeerKey::random();
        let mut stored = Profile::new(key).with_name("alice");
        stored.bio = Some("hi".to_string());

        let update = Profile {
            id: key,
            name: None,
            avatar: Some("data:image/png".to_string()),
            bio: None,
        };
        stored.merge(&update);

        assert_eq!(stored.name.as_deref(), Some("alice"));
        assert_eq!(stored.bio.as_deref(), Some("hi"));
        assert_eq!(stored.avatar.as_deref(), Some("data:image/png"));
    }

    #[test]
    fn test_profile_wire_omits_empty_fields() {
        let profile = Profile::new(PeerKey::from_bytes([1; 32]));
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json, serde_json::json!({ "id": "01".repeat(32) }));
    }

    #[test]
    fn test_peer_info_uses_pub_key_field() {
        let info = PeerInfo::new(PeerKey::from_bytes([2; 32]), "");
        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("pubKey").is_some());

        let parsed: PeerInfo =
            serde_json::from_value(serde_json::json!({ "pubKey": "02".repeat(32) })).unwrap();
        assert_eq!(parsed.address, "");
    }
}

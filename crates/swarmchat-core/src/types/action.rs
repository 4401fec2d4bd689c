//! Interactive actions embedded in messages

use serde::{Deserialize, Serialize};

use super::TopicId;

/// Lifecycle of an action; only ever moves `PENDING -> DONE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionState {
    #[default]
    Pending,
    Done,
}

impl ActionState {
    /// Whether moving from `self` to `next` is a forward transition
    pub fn advances_to(self, next: ActionState) -> bool {
        matches!((self, next), (ActionState::Pending, ActionState::Done))
    }
}

/// Action payload as carried inside a message block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionData {
    pub id: String,
    #[serde(default)]
    pub state: ActionState,
    /// Presentation fields (label, kind, ...) passed through untouched
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl ActionData {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: ActionState::Pending,
            fields: serde_json::Map::new(),
        }
    }
}

/// Stored action, tied to the conversation it was posted in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: String,
    pub convo_id: TopicId,
    pub data: ActionData,
}

impl Action {
    pub fn new(convo_id: TopicId, data: ActionData) -> Self {
        Self {
            id: data.id.clone(),
            convo_id,
            data,
        }
    }

    pub fn state(&self) -> ActionState {
        self.data.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_pending_to_done_advances() {
        assert!(ActionState::Pending.advances_to(ActionState::Done));
        assert!(!ActionState::Done.advances_to(ActionState::Pending));
        assert!(!ActionState::Done.advances_to(ActionState::Done));
        assert!(!ActionState::Pending.advances_to(ActionState::Pending));
    }

    #[test]
    fn test_action_data_keeps_extra_fields() {
        let json = serde_json::json!({ "id": "a1", "label": "Approve" });
        let data: ActionData = serde_json::from_value(json).unwrap();
        assert_eq!(data.state, ActionState::Pending);
        assert_eq!(data.fields.get("label"), Some(&serde_json::json!("Approve")));
    }
}

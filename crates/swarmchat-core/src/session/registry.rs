//! Topic registry: one live session per topic

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::types::TopicId;

/// Map from topic id (keyed by its hex form) to the session serving it.
///
/// Insertion is last-write-wins; the replaced session is handed back so the
/// caller can close it. Nothing is evicted unless removed explicitly.
pub struct TopicRegistry<S> {
    sessions: RwLock<HashMap<String, Arc<S>>>,
}

impl<S> TopicRegistry<S> {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register `session` for `topic`, returning the one it replaced
    pub fn put(&self, topic: TopicId, session: Arc<S>) -> Option<Arc<S>> {
        let replaced = self.sessions.write().insert(topic.to_hex(), session);
        if replaced.is_some() {
            debug!(topic = %topic.short(), "Replaced topic session");
        }
        replaced
    }

    pub fn get(&self, topic: &TopicId) -> Option<Arc<S>> {
        self.sessions.read().get(&topic.to_hex()).cloned()
    }

    pub fn remove(&self, topic: &TopicId) -> Option<Arc<S>> {
        self.sessions.write().remove(&topic.to_hex())
    }

    pub fn contains(&self, topic: &TopicId) -> bool {
        self.sessions.read().contains_key(&topic.to_hex())
    }

    /// Topics with a live session, in no particular order
    pub fn topics(&self) -> Vec<TopicId> {
        self.sessions
            .read()
            .keys()
            .filter_map(|hex| TopicId::from_hex(hex).ok())
            .collect()
    }

    /// Remove and return every session
    pub fn drain(&self) -> Vec<Arc<S>> {
        self.sessions.write().drain().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl<S> Default for TopicRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let registry = TopicRegistry::new();
        let topic = TopicId::random();

        assert!(registry.get(&topic).is_none());
        assert!(registry.put(topic, Arc::new("first")).is_none());
        assert_eq!(registry.get(&topic).as_deref(), Some(&"first"));
        assert!(registry.contains(&topic));
    }

    #[test]
    fn test_last_write_wins() {
        let registry = TopicRegistry::new();
        let topic = TopicId::random();

        registry.put(topic, Arc::new(1));
        let replaced = registry.put(topic, Arc::new(2));

        assert_eq!(replaced.as_deref(), Some(&1));
        assert_eq!(registry.get(&topic).as_deref(), Some(&2));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_and_topics() {
        let registry = TopicRegistry::new();
        let a = TopicId::random();
        let b = TopicId::random();
        registry.put(a, Arc::new(()));
        registry.put(b, Arc::new(()));

        let mut topics = registry.topics();
        topics.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(topics, expected);

        assert!(registry.remove(&a).is_some());
        assert!(registry.remove(&a).is_none());
        assert_eq!(registry.topics(), vec![b]);
    }
}

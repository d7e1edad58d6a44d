use std::collections::HashSet;

use dashmap::DashMap;

/// Concurrent subscription index: topic → subscribers, plus back-references
/// per client so a closing connection cleans up in O(topics held).
///
/// The two maps are never locked at the same time; each mutation touches them
/// in separate steps, so concurrent subscribe/unsubscribe/remove calls cannot
/// deadlock.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    by_topic: DashMap<String, HashSet<String>>,
    by_client: DashMap<String, HashSet<String>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the client was newly added to the topic.
    pub fn subscribe(&self, client_id: &str, topic: &str) -> bool {
        let added = {
            let mut subscribers = self.by_topic.entry(topic.to_string()).or_default();
            subscribers.insert(client_id.to_string())
        };
        if added {
            self.by_client
                .entry(client_id.to_string())
                .or_default()
                .insert(topic.to_string());
        }
        added
    }

    /// Returns true if the client was subscribed.
    pub fn unsubscribe(&self, client_id: &str, topic: &str) -> bool {
        let removed = {
            let Some(mut subscribers) = self.by_topic.get_mut(topic) else {
                return false;
            };
            subscribers.remove(client_id)
        };
        self.by_topic.remove_if(topic, |_, subscribers| subscribers.is_empty());
        if removed
            && let Some(mut topics) = self.by_client.get_mut(client_id)
        {
            topics.remove(topic);
        }
        self.by_client.remove_if(client_id, |_, topics| topics.is_empty());
        removed
    }

    /// Drop every subscription the client holds; returns the topics it held.
    pub fn remove_client(&self, client_id: &str) -> Vec<String> {
        let topics: Vec<String> = self
            .by_client
            .remove(client_id)
            .map(|(_, topics)| topics.into_iter().collect())
            .unwrap_or_default();
        for topic in &topics {
            if let Some(mut subscribers) = self.by_topic.get_mut(topic) {
                subscribers.remove(client_id);
            }
            self.by_topic.remove_if(topic, |_, subscribers| subscribers.is_empty());
        }
        topics
    }

    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        self.by_topic
            .get(topic)
            .map(|subscribers| subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<String> {
        self.by_topic.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.by_topic.contains_key(topic)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.by_topic
            .get(topic)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_is_idempotent() {
        let index = SubscriptionIndex::new();
        assert!(index.subscribe("c1", "room:a"));
        assert!(!index.subscribe("c1", "room:a"));
        assert_eq!(index.subscriber_count("room:a"), 1);
    }

    #[test]
    fn unsubscribe_of_non_member_is_soft() {
        let index = SubscriptionIndex::new();
        assert!(!index.unsubscribe("c1", "room:a"));
        index.subscribe("c1", "room:a");
        assert!(index.unsubscribe("c1", "room:a"));
        assert!(!index.has_topic("room:a"));
    }

    #[test]
    fn remove_client_clears_back_references() {
        let index = SubscriptionIndex::new();
        index.subscribe("c1", "room:a");
        index.subscribe("c1", "room:b");
        index.subscribe("c2", "room:a");

        let mut held = index.remove_client("c1");
        held.sort();
        assert_eq!(held, vec!["room:a", "room:b"]);
        assert_eq!(index.subscribers("room:a"), vec!["c2".to_string()]);
        assert!(!index.has_topic("room:b"));
        assert!(index.remove_client("c1").is_empty());
    }

    #[test]
    fn empty_topics_are_dropped() {
        let index = SubscriptionIndex::new();
        index.subscribe("c1", "room:a");
        index.unsubscribe("c1", "room:a");
        assert!(index.topics().is_empty());
    }
}

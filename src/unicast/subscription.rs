//! Subscriber bookkeeping for publish/subscribe.

use std::collections::HashMap;
use std::sync::RwLock;

/// Stores which endpoint addresses want which message types. Keys are wire
/// type names, so subscriptions survive process restarts on durable
/// implementations.
pub trait SubscriptionStorage: Send + Sync {
    fn subscribe(&self, subscriber: &str, message_types: &[String]);

    fn unsubscribe(&self, subscriber: &str, message_types: &[String]);

    /// Every subscriber interested in at least one of the given types,
    /// each address at most once, in a deterministic order.
    fn subscribers_for(&self, message_types: &[String]) -> Vec<String>;
}

/// In-memory [`SubscriptionStorage`]; sufficient for single-process hosting
/// and tests.
#[derive(Default)]
pub struct InMemorySubscriptionStorage {
    // type name -> subscriber addresses, in subscription order.
    subscriptions: RwLock<HashMap<String, Vec<String>>>,
}

impl InMemorySubscriptionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubscriptionStorage for InMemorySubscriptionStorage {
    fn subscribe(&self, subscriber: &str, message_types: &[String]) {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        for message_type in message_types {
            let subscribers = subscriptions.entry(message_type.clone()).or_default();
            if !subscribers.iter().any(|s| s == subscriber) {
                subscribers.push(subscriber.to_string());
            }
        }
    }

    fn unsubscribe(&self, subscriber: &str, message_types: &[String]) {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        for message_type in message_types {
            if let Some(subscribers) = subscriptions.get_mut(message_type) {
                subscribers.retain(|s| s != subscriber);
            }
        }
    }

    fn subscribers_for(&self, message_types: &[String]) -> Vec<String> {
        let subscriptions = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
        let mut result = Vec::new();
        for message_type in message_types {
            if let Some(subscribers) = subscriptions.get(message_type) {
                for subscriber in subscribers {
                    if !result.contains(subscriber) {
                        result.push(subscriber.clone());
                    }
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn subscribe_is_idempotent_per_subscriber_and_type() {
        let storage = InMemorySubscriptionStorage::new();
        storage.subscribe("a", &types(&["OrderPlaced"]));
        storage.subscribe("a", &types(&["OrderPlaced"]));
        storage.subscribe("b", &types(&["OrderPlaced"]));

        assert_eq!(storage.subscribers_for(&types(&["OrderPlaced"])), ["a", "b"]);
    }

    #[test]
    fn subscribers_are_deduplicated_across_types() {
        let storage = InMemorySubscriptionStorage::new();
        storage.subscribe("a", &types(&["OrderPlaced", "OrderShipped"]));
        storage.subscribe("b", &types(&["OrderShipped"]));

        assert_eq!(
            storage.subscribers_for(&types(&["OrderPlaced", "OrderShipped"])),
            ["a", "b"]
        );
    }

    #[test]
    fn unsubscribe_removes_only_the_named_types() {
        let storage = InMemorySubscriptionStorage::new();
        storage.subscribe("a", &types(&["OrderPlaced", "OrderShipped"]));
        storage.unsubscribe("a", &types(&["OrderPlaced"]));

        assert!(storage.subscribers_for(&types(&["OrderPlaced"])).is_empty());
        assert_eq!(storage.subscribers_for(&types(&["OrderShipped"])), ["a"]);
    }
}

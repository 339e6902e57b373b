//! Live subscription registry.
//!
//! Maps topics (user or group identities) to the connections currently
//! interested in them. Fan-out reads are topic-keyed and far more frequent
//! than mutation, so the registry keeps per-topic subscriber sets; a
//! reverse index exists only to make disconnect cleanup total.

use std::collections::HashMap;
use std::sync::Arc;

use courier_protocol::{Message, MessageId};
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// A logical delivery channel: a user identity or a group identity.
pub type Topic = String;

/// Unique identifier for one live connection.
pub type ConnectionId = String;

/// Cursor stored between `subscribe` and the store-clock snapshot that
/// completes a join. Suppresses live pushes until the real cursor lands;
/// everything suppressed is covered by the backlog read.
pub const PENDING_CURSOR: MessageId = MessageId::MAX;

/// An event pushed to a live connection.
#[derive(Debug, Clone)]
pub enum PushEvent {
    /// A committed message, shared across all recipients.
    Message(Arc<Message>),
    /// An ephemeral signal (e.g. typing). Never persisted, lost silently.
    Signal {
        /// Topic the signal is scoped to.
        topic: Topic,
        /// Originating identity.
        from: String,
        /// Opaque payload.
        payload: Value,
    },
}

/// Sender half of a connection's outbound queue.
pub type PushSender = mpsc::UnboundedSender<PushEvent>;

/// Point-in-time view of one subscriber of a topic.
#[derive(Debug, Clone)]
pub struct Subscriber {
    /// The subscribed connection.
    pub connection_id: ConnectionId,
    /// Its outbound queue.
    pub sender: PushSender,
    /// Join cursor: live pushes with `id <= cursor` are suppressed because
    /// the backlog read covers them.
    pub cursor: MessageId,
}

/// Registry statistics.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Number of topics with at least one subscriber.
    pub topic_count: usize,
    /// Number of registered connections.
    pub connection_count: usize,
    /// Total number of (topic, connection) subscriptions.
    pub total_subscriptions: usize,
}

/// Concurrent topic → subscriber map.
///
/// All operations are safe under concurrent invocation from many sessions;
/// `subscribers_of` is a snapshot and callers must tolerate subscribers
/// added or removed after it is taken.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    /// Topic → (connection → join cursor).
    topics: DashMap<Topic, HashMap<ConnectionId, MessageId>>,
    /// Connection → outbound sender.
    connections: DashMap<ConnectionId, PushSender>,
    /// Connection → topics it is subscribed to.
    subscriptions: DashMap<ConnectionId, DashSet<Topic>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            topic_count: self.topics.len(),
            connection_count: self.connections.len(),
            total_subscriptions: self.subscriptions.iter().map(|s| s.len()).sum(),
        }
    }

    /// Register a connection's outbound sender. Must be called before the
    /// connection subscribes to any topic.
    pub fn register(&self, connection_id: impl Into<ConnectionId>, sender: PushSender) {
        let conn_id = connection_id.into();
        if self.connections.insert(conn_id.clone(), sender).is_some() {
            warn!(connection = %conn_id, "Replaced sender for already-registered connection");
        }
        debug!(connection = %conn_id, "Connection registered");
    }

    /// Subscribe a connection to a topic with a pending cursor.
    ///
    /// Idempotent: subscribing an already-subscribed connection is a no-op
    /// that keeps the existing cursor. Returns `true` if the subscription
    /// was newly added.
    pub fn subscribe(&self, topic: &str, connection_id: &str) -> bool {
        if !self.connections.contains_key(connection_id) {
            warn!(topic = %topic, connection = %connection_id, "Subscribe from unregistered connection ignored");
            return false;
        }

        let mut entry = self.topics.entry(topic.to_string()).or_default();
        let added = match entry.get(connection_id) {
            Some(_) => false,
            None => {
                entry.insert(connection_id.to_string(), PENDING_CURSOR);
                true
            }
        };
        drop(entry);

        if added {
            self.subscriptions
                .entry(connection_id.to_string())
                .or_default()
                .insert(topic.to_string());
            debug!(topic = %topic, connection = %connection_id, "Subscribed");
        }
        added
    }

    /// Complete a join by replacing a pending cursor with the store-clock
    /// snapshot. Returns the cursor actually in effect (an earlier join's
    /// cursor wins over a racing duplicate).
    pub fn resolve_cursor(
        &self,
        topic: &str,
        connection_id: &str,
        cursor: MessageId,
    ) -> MessageId {
        if let Some(mut entry) = self.topics.get_mut(topic) {
            if let Some(stored) = entry.get_mut(connection_id) {
                if *stored == PENDING_CURSOR {
                    *stored = cursor;
                }
                return *stored;
            }
        }
        cursor
    }

    /// The join cursor recorded for a subscription, if any.
    #[must_use]
    pub fn cursor_of(&self, topic: &str, connection_id: &str) -> Option<MessageId> {
        self.topics
            .get(topic)
            .and_then(|subs| subs.get(connection_id).copied())
    }

    /// Unsubscribe a connection from a topic.
    ///
    /// Idempotent: removing an absent subscription is a no-op. Returns
    /// `true` if a subscription was removed.
    pub fn unsubscribe(&self, topic: &str, connection_id: &str) -> bool {
        let removed = match self.topics.get_mut(topic) {
            Some(mut entry) => entry.remove(connection_id).is_some(),
            None => false,
        };

        if removed {
            if let Some(topics) = self.subscriptions.get(connection_id) {
                topics.remove(topic);
            }
            self.remove_topic_if_empty(topic);
            debug!(topic = %topic, connection = %connection_id, "Unsubscribed");
        }
        removed
    }

    /// Remove a connection from every topic it was subscribed to and drop
    /// its sender. Called once on disconnect; cleanup is total.
    pub fn drop_connection(&self, connection_id: &str) {
        self.connections.remove(connection_id);

        if let Some((_, topics)) = self.subscriptions.remove(connection_id) {
            for topic in topics.iter() {
                if let Some(mut entry) = self.topics.get_mut(topic.as_str()) {
                    entry.remove(connection_id);
                }
                self.remove_topic_if_empty(topic.as_str());
            }
        }

        debug!(connection = %connection_id, "Connection dropped from all topics");
    }

    /// Remove every subscriber of a topic (a deleted group stops existing
    /// as a delivery target immediately).
    pub fn drop_topic(&self, topic: &str) {
        if let Some((_, subs)) = self.topics.remove(topic) {
            for connection_id in subs.keys() {
                if let Some(topics) = self.subscriptions.get(connection_id) {
                    topics.remove(topic);
                }
            }
            debug!(topic = %topic, subscribers = subs.len(), "Topic dropped");
        }
    }

    /// Snapshot the current subscribers of a topic.
    #[must_use]
    pub fn subscribers_of(&self, topic: &str) -> Vec<Subscriber> {
        let Some(subs) = self.topics.get(topic) else {
            return Vec::new();
        };

        subs.iter()
            .filter_map(|(connection_id, cursor)| {
                let sender = self.connections.get(connection_id)?.clone();
                Some(Subscriber {
                    connection_id: connection_id.clone(),
                    sender,
                    cursor: *cursor,
                })
            })
            .collect()
    }

    /// Whether a connection is subscribed to a topic.
    #[must_use]
    pub fn is_subscribed(&self, topic: &str, connection_id: &str) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|subs| subs.contains_key(connection_id))
    }

    /// The topics a connection is subscribed to.
    #[must_use]
    pub fn topics_of(&self, connection_id: &str) -> Vec<Topic> {
        self.subscriptions
            .get(connection_id)
            .map(|topics| topics.iter().map(|t| t.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of topics a connection is subscribed to.
    #[must_use]
    pub fn subscription_count(&self, connection_id: &str) -> usize {
        self.subscriptions
            .get(connection_id)
            .map(|topics| topics.len())
            .unwrap_or(0)
    }

    fn remove_topic_if_empty(&self, topic: &str) {
        if self.topics.remove_if(topic, |_, subs| subs.is_empty()).is_some() {
            trace!(topic = %topic, "Removed empty topic");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered(registry: &SubscriptionRegistry, id: &str) -> mpsc::UnboundedReceiver<PushEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(id, tx);
        rx
    }

    #[test]
    fn test_subscribe_idempotent() {
        let registry = SubscriptionRegistry::new();
        let _rx = registered(&registry, "c1");

        assert!(registry.subscribe("alice", "c1"));
        registry.resolve_cursor("alice", "c1", 7);

        // Second subscribe is a no-op that keeps the original cursor.
        assert!(!registry.subscribe("alice", "c1"));
        assert_eq!(registry.cursor_of("alice", "c1"), Some(7));
        assert_eq!(registry.subscribers_of("alice").len(), 1);
    }

    #[test]
    fn test_unsubscribe_absent_is_noop() {
        let registry = SubscriptionRegistry::new();
        let _rx = registered(&registry, "c1");

        assert!(!registry.unsubscribe("alice", "c1"));
        registry.subscribe("alice", "c1");
        assert!(registry.unsubscribe("alice", "c1"));
        assert!(!registry.unsubscribe("alice", "c1"));
    }

    #[test]
    fn test_unregistered_connection_cannot_subscribe() {
        let registry = SubscriptionRegistry::new();
        assert!(!registry.subscribe("alice", "ghost"));
        assert!(registry.subscribers_of("alice").is_empty());
    }

    #[test]
    fn test_drop_connection_is_total() {
        let registry = SubscriptionRegistry::new();
        let _rx1 = registered(&registry, "c1");
        let _rx2 = registered(&registry, "c2");

        registry.subscribe("alice", "c1");
        registry.subscribe("g1", "c1");
        registry.subscribe("g1", "c2");

        registry.drop_connection("c1");

        assert!(!registry.is_subscribed("alice", "c1"));
        assert!(!registry.is_subscribed("g1", "c1"));
        assert!(registry.is_subscribed("g1", "c2"));
        assert!(registry.topics_of("c1").is_empty());
        // The now-empty user topic is gone entirely.
        assert_eq!(registry.stats().topic_count, 1);
    }

    #[test]
    fn test_drop_topic() {
        let registry = SubscriptionRegistry::new();
        let _rx1 = registered(&registry, "c1");
        let _rx2 = registered(&registry, "c2");

        registry.subscribe("g1", "c1");
        registry.subscribe("g1", "c2");
        registry.subscribe("alice", "c1");

        registry.drop_topic("g1");

        assert!(registry.subscribers_of("g1").is_empty());
        assert_eq!(registry.topics_of("c1"), vec!["alice".to_string()]);
        assert!(registry.topics_of("c2").is_empty());
    }

    #[test]
    fn test_snapshot_excludes_dropped_senders() {
        let registry = SubscriptionRegistry::new();
        let _rx1 = registered(&registry, "c1");
        let _rx2 = registered(&registry, "c2");

        registry.subscribe("g1", "c1");
        registry.subscribe("g1", "c2");
        registry.drop_connection("c2");

        let snapshot = registry.subscribers_of("g1");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].connection_id, "c1");
    }

    #[test]
    fn test_stats() {
        let registry = SubscriptionRegistry::new();
        let _rx1 = registered(&registry, "c1");
        let _rx2 = registered(&registry, "c2");

        registry.subscribe("alice", "c1");
        registry.subscribe("g1", "c1");
        registry.subscribe("g1", "c2");

        let stats = registry.stats();
        assert_eq!(stats.topic_count, 2);
        assert_eq!(stats.connection_count, 2);
        assert_eq!(stats.total_subscriptions, 3);
    }
}

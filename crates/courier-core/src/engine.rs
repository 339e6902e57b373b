//! The fan-out engine.
//!
//! Single entry point the session layer depends on: validates a
//! submission, commits it through the message store, resolves the live
//! delivery target set, and pushes the committed record to each handle.
//! Pushes are non-blocking sends on per-connection queues, so a stalled
//! session never delays the submitter's acknowledgment or other
//! recipients.

use std::collections::HashSet;
use std::sync::Arc;

use courier_protocol::{Message, MessageId};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace};

use crate::membership::{MembershipError, MembershipRegistry};
use crate::store::{ConversationKey, MessageDraft, MessageStore, StoreError, MAX_TEXT_CHARS};
use crate::subscriptions::{
    ConnectionId, PushEvent, PushSender, Subscriber, SubscriptionRegistry, PENDING_CURSOR,
};

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or missing field, rejected before persistence.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Unresolvable group id, rejected before persistence.
    #[error("Group not found: {0}")]
    GroupNotFound(String),

    /// Store failure. A `ValidationFailed` here is an internal fault: the
    /// engine validates before it appends.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The result of a successful submission.
///
/// Delivery counts are observational: a submission succeeds once the
/// message is committed, even with zero live recipients.
#[derive(Debug, Clone)]
pub struct Submission {
    /// The durably committed message.
    pub message: Message,
    /// Connections the message was pushed to.
    pub delivered_to: Vec<ConnectionId>,
    /// Handles whose push failed (session died mid-delivery).
    pub failed_deliveries: usize,
}

/// The message delivery and fan-out engine.
///
/// Registries and store are injected and shared; the engine owns no
/// global state and can be cloned cheaply behind an `Arc` by the server.
pub struct Engine {
    store: Arc<dyn MessageStore>,
    membership: Arc<dyn MembershipRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
}

impl Engine {
    /// Create an engine over the given services.
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageStore>,
        membership: Arc<dyn MembershipRegistry>,
        subscriptions: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            store,
            membership,
            subscriptions,
        }
    }

    /// The subscription registry, shared with the session layer.
    #[must_use]
    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    /// Submit a direct message.
    ///
    /// The delivery target set is the union of the recipient's and the
    /// sender's subscribers, so every device of both parties stays in
    /// sync.
    ///
    /// # Errors
    ///
    /// `EngineError::InvalidArgument` for empty `from`/`to`/`text` or
    /// oversized text; store failures are fatal to the submission.
    pub async fn submit_direct(
        &self,
        from: &str,
        to: &str,
        text: &str,
    ) -> Result<Submission, EngineError> {
        if from.is_empty() {
            return Err(EngineError::InvalidArgument("from must not be empty"));
        }
        if to.is_empty() {
            return Err(EngineError::InvalidArgument("to must not be empty"));
        }
        validate_text(text)?;

        let message = self.store.append(MessageDraft::direct(from, to, text)).await?;

        let mut targets = self.subscriptions.subscribers_of(to);
        if from != to {
            targets.extend(self.subscriptions.subscribers_of(from));
        }

        Ok(self.deliver(message, targets))
    }

    /// Submit a group message.
    ///
    /// The group must resolve through the membership registry; delivery
    /// targets are the group topic's current subscribers, not the member
    /// list. A member who never joined the topic catches up via history.
    ///
    /// # Errors
    ///
    /// `EngineError::InvalidArgument` for empty fields or oversized text,
    /// `EngineError::GroupNotFound` for an unresolvable group; both are
    /// rejected before persistence.
    pub async fn submit_group(
        &self,
        group_id: &str,
        from: &str,
        text: &str,
    ) -> Result<Submission, EngineError> {
        if group_id.is_empty() {
            return Err(EngineError::InvalidArgument("group_id must not be empty"));
        }
        if from.is_empty() {
            return Err(EngineError::InvalidArgument("from must not be empty"));
        }
        validate_text(text)?;

        let members = self
            .membership
            .members_of(group_id)
            .await
            .map_err(|e| match e {
                MembershipError::NotFound(g) => EngineError::GroupNotFound(g),
                MembershipError::Invalid(m) => EngineError::InvalidArgument(m),
            })?;
        trace!(group = %group_id, members = members.len(), "Group resolved");

        let message = self.store.append(MessageDraft::group(group_id, from, text)).await?;
        let targets = self.subscriptions.subscribers_of(group_id);

        Ok(self.deliver(message, targets))
    }

    /// Conversation history, ascending by assignment order.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn history(
        &self,
        conversation: &ConversationKey,
        since: Option<u64>,
    ) -> Result<Vec<Message>, EngineError> {
        let messages = match conversation {
            ConversationKey::Direct(u1, u2) => self.store.list_direct(u1, u2, since).await?,
            ConversationKey::Group(group_id) => self.store.list_group(group_id, since).await?,
        };
        Ok(messages)
    }

    /// History bounded above by a join cursor: the reconciliation read a
    /// session performs right after `join`. Everything at or below the
    /// cursor comes from here; everything above it arrives live.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn backlog(
        &self,
        conversation: &ConversationKey,
        since: Option<u64>,
        cursor: MessageId,
    ) -> Result<Vec<Message>, EngineError> {
        let mut messages = self.history(conversation, since).await?;
        messages.retain(|m| m.id <= cursor);
        Ok(messages)
    }

    /// Register a connection's outbound queue. Must precede any `join`
    /// for that connection.
    pub fn connect(&self, connection_id: impl Into<ConnectionId>, sender: PushSender) {
        self.subscriptions.register(connection_id, sender);
    }

    /// Subscribe a connection to a topic and return the backlog cursor.
    ///
    /// The subscription is recorded before the cursor is snapshotted, so a
    /// message racing the join is either suppressed live (id at or below
    /// the cursor, covered by `backlog`) or pushed live (above it, beyond
    /// the backlog bound): never both, never neither. Re-joining keeps
    /// the original cursor.
    pub async fn join(&self, topic: &str, connection_id: &str) -> MessageId {
        if let Some(cursor) = self.subscriptions.cursor_of(topic, connection_id) {
            if cursor != PENDING_CURSOR {
                return cursor;
            }
        }
        self.subscriptions.subscribe(topic, connection_id);
        let head = self.store.head().await;
        self.subscriptions.resolve_cursor(topic, connection_id, head)
    }

    /// Unsubscribe a connection from a topic. Idempotent.
    pub fn leave(&self, topic: &str, connection_id: &str) -> bool {
        self.subscriptions.unsubscribe(topic, connection_id)
    }

    /// Remove a connection from every topic. Called once per disconnect.
    pub fn on_disconnect(&self, connection_id: &str) {
        self.subscriptions.drop_connection(connection_id);
    }

    /// Forward an ephemeral signal (e.g. a typing indicator) to the
    /// topic's current subscribers, excluding the originating connection.
    /// Fire-and-forget: not persisted, not retried, lost silently.
    /// Returns the number of handles signaled.
    pub fn signal(
        &self,
        topic: &str,
        from: &str,
        origin: Option<&str>,
        payload: Value,
    ) -> usize {
        let mut sent = 0;
        for sub in self.subscriptions.subscribers_of(topic) {
            if origin == Some(sub.connection_id.as_str()) {
                continue;
            }
            let event = PushEvent::Signal {
                topic: topic.to_string(),
                from: from.to_string(),
                payload: payload.clone(),
            };
            if sub.sender.send(event).is_ok() {
                sent += 1;
            }
        }
        trace!(topic = %topic, sent, "Signal forwarded");
        sent
    }

    /// Push a committed message to a snapshot of target handles.
    ///
    /// Per-handle failures are isolated: they are counted and logged,
    /// never surfaced as an operation failure, because persistence has
    /// already succeeded.
    fn deliver(&self, message: Message, targets: Vec<Subscriber>) -> Submission {
        let shared = Arc::new(message.clone());
        let mut seen: HashSet<ConnectionId> = HashSet::new();
        let mut delivered_to = Vec::new();
        let mut failed_deliveries = 0;

        for sub in targets {
            if !seen.insert(sub.connection_id.clone()) {
                continue;
            }
            if message.id <= sub.cursor {
                trace!(
                    connection = %sub.connection_id,
                    id = message.id,
                    cursor = sub.cursor,
                    "Push suppressed at or below join cursor"
                );
                continue;
            }
            if sub.sender.send(PushEvent::Message(Arc::clone(&shared))).is_ok() {
                delivered_to.push(sub.connection_id);
            } else {
                failed_deliveries += 1;
                debug!(connection = %sub.connection_id, id = message.id, "Delivery failed: session gone");
            }
        }

        debug!(
            id = message.id,
            recipients = delivered_to.len(),
            failed = failed_deliveries,
            "Message fanned out"
        );

        Submission {
            message,
            delivered_to,
            failed_deliveries,
        }
    }

    /// Live connections currently subscribed to a topic. Exposed for the
    /// membership write path, which must propagate member changes into
    /// subscription state.
    #[must_use]
    pub fn connections_on(&self, topic: &str) -> Vec<ConnectionId> {
        self.subscriptions
            .subscribers_of(topic)
            .into_iter()
            .map(|s| s.connection_id)
            .collect()
    }

    /// Drop a topic entirely (a deleted group stops being a delivery
    /// target immediately, for every subscriber).
    pub fn drop_topic(&self, topic: &str) {
        self.subscriptions.drop_topic(topic);
    }
}

fn validate_text(text: &str) -> Result<(), EngineError> {
    if text.is_empty() {
        return Err(EngineError::InvalidArgument("text must not be empty"));
    }
    if text.chars().count() > MAX_TEXT_CHARS {
        return Err(EngineError::InvalidArgument("text too long"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MemoryMembership;
    use crate::store::MemoryStore;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Fixture {
        engine: Engine,
        membership: Arc<MemoryMembership>,
    }

    fn fixture() -> Fixture {
        let membership = Arc::new(MemoryMembership::new());
        let engine = Engine::new(
            Arc::new(MemoryStore::new()),
            membership.clone(),
            Arc::new(SubscriptionRegistry::new()),
        );
        Fixture { engine, membership }
    }

    fn session(engine: &Engine, id: &str) -> mpsc::UnboundedReceiver<PushEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        engine.connect(id, tx);
        rx
    }

    fn drain_messages(rx: &mut mpsc::UnboundedReceiver<PushEvent>) -> Vec<Arc<Message>> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PushEvent::Message(m) = event {
                out.push(m);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_direct_submit_without_subscribers() {
        let f = fixture();

        let submission = f.engine.submit_direct("alice", "bob", "hi").await.unwrap();
        assert!(submission.delivered_to.is_empty());
        assert_eq!(submission.failed_deliveries, 0);
        assert!(submission.message.id > 0);
        assert_eq!(submission.message.text, "hi");

        let ab = f
            .engine
            .history(&ConversationKey::direct("alice", "bob"), None)
            .await
            .unwrap();
        let ba = f
            .engine
            .history(&ConversationKey::direct("bob", "alice"), None)
            .await
            .unwrap();
        assert_eq!(ab.len(), 1);
        assert_eq!(ab, ba);
    }

    #[tokio::test]
    async fn test_direct_delivery_with_sender_echo() {
        let f = fixture();
        let mut bob_rx = session(&f.engine, "bob-phone");
        let mut alice1_rx = session(&f.engine, "alice-phone");
        let mut alice2_rx = session(&f.engine, "alice-laptop");

        f.engine.join("bob", "bob-phone").await;
        f.engine.join("alice", "alice-phone").await;
        f.engine.join("alice", "alice-laptop").await;

        let submission = f.engine.submit_direct("alice", "bob", "hi").await.unwrap();
        assert_eq!(submission.delivered_to.len(), 3);

        for rx in [&mut bob_rx, &mut alice1_rx, &mut alice2_rx] {
            let got = drain_messages(rx);
            assert_eq!(got.len(), 1);
            assert_eq!(got[0].text, "hi");
        }
    }

    #[tokio::test]
    async fn test_self_message_delivered_once_per_device() {
        let f = fixture();
        let mut rx = session(&f.engine, "alice-phone");
        f.engine.join("alice", "alice-phone").await;

        let submission = f.engine.submit_direct("alice", "alice", "note").await.unwrap();
        assert_eq!(submission.delivered_to, vec!["alice-phone".to_string()]);
        assert_eq!(drain_messages(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_group_delivery_targets_topic_subscribers() {
        let f = fixture();
        let group = f
            .membership
            .create_group("team", None, &["alice".to_string(), "bob".to_string()])
            .unwrap();

        // Alice's session joined the group topic; Bob is a member but his
        // session never joined.
        let mut alice_rx = session(&f.engine, "alice-phone");
        let mut bob_rx = session(&f.engine, "bob-phone");
        f.engine.join(&group.id, "alice-phone").await;
        f.engine.join("bob", "bob-phone").await;

        let submission = f.engine.submit_group(&group.id, "bob", "hello").await.unwrap();
        assert_eq!(submission.delivered_to, vec!["alice-phone".to_string()]);

        assert_eq!(drain_messages(&mut alice_rx).len(), 1);
        assert!(drain_messages(&mut bob_rx).is_empty());

        // Bob reconciles through history instead.
        let log = f
            .engine
            .history(&ConversationKey::group(&group.id), None)
            .await
            .unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].from, "bob");
    }

    #[tokio::test]
    async fn test_group_not_found() {
        let f = fixture();
        assert!(matches!(
            f.engine.submit_group("nope", "alice", "hi").await,
            Err(EngineError::GroupNotFound(_))
        ));

        // Rejected before persistence.
        let log = f
            .engine
            .history(&ConversationKey::group("nope"), None)
            .await
            .unwrap();
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let f = fixture();

        for (from, to, text) in [
            ("", "bob", "hi"),
            ("alice", "", "hi"),
            ("alice", "bob", ""),
        ] {
            assert!(matches!(
                f.engine.submit_direct(from, to, text).await,
                Err(EngineError::InvalidArgument(_))
            ));
        }

        let long = "x".repeat(MAX_TEXT_CHARS + 1);
        assert!(matches!(
            f.engine.submit_direct("alice", "bob", &long).await,
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            f.engine.submit_group("", "alice", "hi").await,
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_join_backlog_live_exactly_once() {
        let f = fixture();
        let group = f
            .membership
            .create_group("team", None, &["alice".to_string()])
            .unwrap();

        // Committed before the join: backlog only.
        let before = f.engine.submit_group(&group.id, "alice", "early").await.unwrap();

        let mut rx = session(&f.engine, "c1");
        let cursor = f.engine.join(&group.id, "c1").await;
        assert!(cursor >= before.message.id);

        let backlog = f
            .engine
            .backlog(&ConversationKey::group(&group.id), None, cursor)
            .await
            .unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].text, "early");

        // Committed after the join: live only.
        let after = f.engine.submit_group(&group.id, "alice", "late").await.unwrap();
        assert!(after.message.id > cursor);

        let live = drain_messages(&mut rx);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].text, "late");

        let backlog_again = f
            .engine
            .backlog(&ConversationKey::group(&group.id), None, cursor)
            .await
            .unwrap();
        assert_eq!(backlog_again.len(), 1, "live message must stay out of the backlog bound");
    }

    #[tokio::test]
    async fn test_push_suppressed_below_cursor() {
        let f = fixture();
        let mut rx = session(&f.engine, "c1");

        // A join whose cursor sits above everything the store will assign.
        f.engine.subscriptions().subscribe("alice", "c1");
        f.engine
            .subscriptions()
            .resolve_cursor("alice", "c1", MessageId::MAX - 1);

        let submission = f.engine.submit_direct("bob", "alice", "hi").await.unwrap();
        assert!(submission.delivered_to.is_empty());
        assert!(drain_messages(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_rejoin_keeps_cursor() {
        let f = fixture();
        let _rx = session(&f.engine, "c1");

        let first = f.engine.join("g1", "c1").await;
        f.engine.submit_direct("alice", "bob", "between").await.unwrap();
        let second = f.engine.join("g1", "c1").await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_disconnect_cleanup() {
        let f = fixture();
        let mut rx = session(&f.engine, "c1");
        f.engine.join("alice", "c1").await;
        f.engine.join("g1", "c1").await;

        f.engine.on_disconnect("c1");

        assert!(f.engine.connections_on("alice").is_empty());
        assert!(f.engine.connections_on("g1").is_empty());

        let submission = f.engine.submit_direct("bob", "alice", "hi").await.unwrap();
        assert!(submission.delivered_to.is_empty());
        assert!(drain_messages(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_dead_handle_counted_not_fatal() {
        let f = fixture();
        let rx = session(&f.engine, "c1");
        f.engine.join("alice", "c1").await;
        drop(rx);

        let submission = f.engine.submit_direct("bob", "alice", "hi").await.unwrap();
        assert!(submission.delivered_to.is_empty());
        assert_eq!(submission.failed_deliveries, 1);

        // Persistence succeeded regardless.
        let log = f
            .engine
            .history(&ConversationKey::direct("alice", "bob"), None)
            .await
            .unwrap();
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_signal_excludes_origin() {
        let f = fixture();
        let mut rx1 = session(&f.engine, "c1");
        let mut rx2 = session(&f.engine, "c2");
        f.engine.join("g1", "c1").await;
        f.engine.join("g1", "c2").await;

        let sent = f
            .engine
            .signal("g1", "alice", Some("c1"), json!({"typing": true}));
        assert_eq!(sent, 1);

        assert!(rx1.try_recv().is_err());
        match rx2.try_recv().unwrap() {
            PushEvent::Signal { topic, from, payload } => {
                assert_eq!(topic, "g1");
                assert_eq!(from, "alice");
                assert_eq!(payload["typing"], true);
            }
            other => panic!("Expected signal, got {other:?}"),
        }

        // Signals to an empty topic vanish silently.
        assert_eq!(f.engine.signal("empty", "alice", None, json!({})), 0);
    }

    #[tokio::test]
    async fn test_racing_submissions_ordered_by_store() {
        let f = fixture();
        let engine = Arc::new(f.engine);

        let mut handles = Vec::new();
        for i in 0..20 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine
                    .submit_direct("alice", "bob", &format!("m{i}"))
                    .await
                    .unwrap()
                    .message
            }));
        }
        let mut committed = Vec::new();
        for h in handles {
            committed.push(h.await.unwrap());
        }

        let log = engine
            .history(&ConversationKey::direct("alice", "bob"), None)
            .await
            .unwrap();
        assert_eq!(log.len(), 20);
        assert!(log.windows(2).all(|w| w[0].id < w[1].id));

        // The eventual order is exactly the assigned-id order.
        committed.sort_by_key(|m| m.id);
        assert_eq!(log, committed);
    }
}

//! Durable message store.
//!
//! The store owns id and timestamp assignment: callers hand in a
//! [`MessageDraft`] and get back the committed [`Message`]. Within one
//! store instance ids are strictly increasing, so id order is the
//! authoritative order for racing submissions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use courier_protocol::{Message, MessageId, Target};
use dashmap::DashMap;
use thiserror::Error;
use tracing::trace;

/// Maximum message text length in Unicode code points.
pub const MAX_TEXT_CHARS: usize = 1000;

/// Low bits of a message id reserved for the per-millisecond sequence.
const SEQ_BITS: u32 = 20;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The draft violates a store invariant.
    #[error("Validation failed: {0}")]
    ValidationFailed(&'static str),

    /// The backing persistence layer failed.
    #[error("Storage error: {0}")]
    Io(String),
}

/// Conversation identity: the storage and lookup key for a message.
///
/// Direct pairs are ordered on construction so `(u1, u2)` and `(u2, u1)`
/// resolve to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    /// Unordered pair of user identities, stored lexicographically.
    Direct(String, String),
    /// Group identity.
    Group(String),
}

impl ConversationKey {
    /// Key for a direct conversation, symmetric in its arguments.
    #[must_use]
    pub fn direct(u1: impl Into<String>, u2: impl Into<String>) -> Self {
        let (a, b) = (u1.into(), u2.into());
        if a <= b {
            ConversationKey::Direct(a, b)
        } else {
            ConversationKey::Direct(b, a)
        }
    }

    /// Key for a group conversation.
    #[must_use]
    pub fn group(group_id: impl Into<String>) -> Self {
        ConversationKey::Group(group_id.into())
    }

    /// The key a committed message belongs to.
    #[must_use]
    pub fn of(message: &Message) -> Self {
        match &message.target {
            Target::Direct { to } => ConversationKey::direct(message.from.clone(), to.clone()),
            Target::Group { group_id } => ConversationKey::Group(group_id.clone()),
        }
    }
}

/// A message submission before the store has committed it.
///
/// Carries no id or timestamp; the store assigns both.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    /// Sender identity.
    pub from: String,
    /// Addressing, tagged by kind.
    pub target: Target,
    /// Message text.
    pub text: String,
}

impl MessageDraft {
    /// Draft a direct message.
    #[must_use]
    pub fn direct(
        from: impl Into<String>,
        to: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            target: Target::direct(to),
            text: text.into(),
        }
    }

    /// Draft a group message.
    #[must_use]
    pub fn group(
        group_id: impl Into<String>,
        from: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            target: Target::group(group_id),
            text: text.into(),
        }
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.from.is_empty() {
            return Err(StoreError::ValidationFailed("sender must not be empty"));
        }
        let target_id = match &self.target {
            Target::Direct { to } => to,
            Target::Group { group_id } => group_id,
        };
        if target_id.is_empty() {
            return Err(StoreError::ValidationFailed("target must not be empty"));
        }
        if self.text.is_empty() {
            return Err(StoreError::ValidationFailed("text must not be empty"));
        }
        if self.text.chars().count() > MAX_TEXT_CHARS {
            return Err(StoreError::ValidationFailed("text too long"));
        }
        Ok(())
    }
}

/// The message store contract.
///
/// `append` must be atomic per message and writes must be visible to
/// subsequent reads from any caller. No update or delete is exposed;
/// committed messages are immutable.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Assign id and timestamp, persist atomically, return the committed
    /// record.
    ///
    /// # Errors
    ///
    /// `StoreError::ValidationFailed` if the draft violates an invariant.
    async fn append(&self, draft: MessageDraft) -> Result<Message, StoreError>;

    /// Direct history between two users, ascending by assignment order.
    /// Symmetric in `u1`/`u2`. `since` keeps only messages created strictly
    /// after the given timestamp.
    async fn list_direct(
        &self,
        u1: &str,
        u2: &str,
        since: Option<u64>,
    ) -> Result<Vec<Message>, StoreError>;

    /// Group history, ascending by assignment order.
    async fn list_group(
        &self,
        group_id: &str,
        since: Option<u64>,
    ) -> Result<Vec<Message>, StoreError>;

    /// The last assigned message id (0 if nothing has been committed).
    /// Used as the backlog cursor at join time.
    async fn head(&self) -> MessageId;
}

/// In-memory message store.
///
/// One append-only log per conversation, sharded by a concurrent map. The
/// id assigner packs milliseconds into the upper bits and clamps against
/// the previous id, so ids stay strictly increasing even when the clock
/// stalls within a millisecond or steps backwards.
#[derive(Debug, Default)]
pub struct MemoryStore {
    conversations: DashMap<ConversationKey, Vec<Message>>,
    last_id: AtomicU64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn assign(&self) -> MessageId {
        loop {
            let last = self.last_id.load(Ordering::SeqCst);
            let candidate = (now_millis() << SEQ_BITS).max(last + 1);
            if self
                .last_id
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return candidate;
            }
        }
    }

    fn list(&self, key: &ConversationKey, since: Option<u64>) -> Vec<Message> {
        let Some(log) = self.conversations.get(key) else {
            return Vec::new();
        };
        match since {
            None => log.clone(),
            Some(t) => log.iter().filter(|m| m.created_at > t).cloned().collect(),
        }
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(&self, draft: MessageDraft) -> Result<Message, StoreError> {
        draft.validate()?;

        let key = match &draft.target {
            Target::Direct { to } => ConversationKey::direct(draft.from.clone(), to.clone()),
            Target::Group { group_id } => ConversationKey::Group(group_id.clone()),
        };

        // Assign under the conversation's shard lock so the per-conversation
        // log stays in id order.
        let mut log = self.conversations.entry(key).or_default();
        let id = self.assign();
        let message = Message {
            id,
            target: draft.target,
            from: draft.from,
            text: draft.text,
            created_at: id >> SEQ_BITS,
        };
        log.push(message.clone());

        trace!(id = message.id, from = %message.from, "Committed message");
        Ok(message)
    }

    async fn list_direct(
        &self,
        u1: &str,
        u2: &str,
        since: Option<u64>,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(self.list(&ConversationKey::direct(u1, u2), since))
    }

    async fn list_group(
        &self,
        group_id: &str,
        since: Option<u64>,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(self.list(&ConversationKey::group(group_id), since))
    }

    async fn head(&self) -> MessageId {
        self.last_id.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_conversation_key_symmetry() {
        assert_eq!(
            ConversationKey::direct("alice", "bob"),
            ConversationKey::direct("bob", "alice")
        );
        assert_ne!(
            ConversationKey::direct("alice", "bob"),
            ConversationKey::group("alice")
        );
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_ids() {
        let store = MemoryStore::new();

        let m1 = store
            .append(MessageDraft::direct("alice", "bob", "1"))
            .await
            .unwrap();
        let m2 = store
            .append(MessageDraft::direct("alice", "bob", "2"))
            .await
            .unwrap();

        assert!(m2.id > m1.id);
        assert!(m2.created_at >= m1.created_at);
        assert_eq!(store.head().await, m2.id);
    }

    #[tokio::test]
    async fn test_direct_history_symmetric() {
        let store = MemoryStore::new();
        store
            .append(MessageDraft::direct("alice", "bob", "hi"))
            .await
            .unwrap();
        store
            .append(MessageDraft::direct("bob", "alice", "hello"))
            .await
            .unwrap();

        let ab = store.list_direct("alice", "bob", None).await.unwrap();
        let ba = store.list_direct("bob", "alice", None).await.unwrap();
        assert_eq!(ab.len(), 2);
        assert_eq!(ab, ba);
    }

    #[tokio::test]
    async fn test_group_history_ascending() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .append(MessageDraft::group("g1", "alice", format!("msg {i}")))
                .await
                .unwrap();
        }

        let log = store.list_group("g1", None).await.unwrap();
        assert_eq!(log.len(), 5);
        assert!(log.windows(2).all(|w| w[0].id < w[1].id));
        assert!(log.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[tokio::test]
    async fn test_since_filter() {
        let store = MemoryStore::new();
        let first = store
            .append(MessageDraft::group("g1", "alice", "old"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store
            .append(MessageDraft::group("g1", "alice", "new"))
            .await
            .unwrap();
        assert!(second.created_at > first.created_at);

        let recent = store
            .list_group("g1", Some(first.created_at))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].text, "new");
    }

    #[tokio::test]
    async fn test_validation() {
        let store = MemoryStore::new();

        for draft in [
            MessageDraft::direct("", "bob", "hi"),
            MessageDraft::direct("alice", "", "hi"),
            MessageDraft::direct("alice", "bob", ""),
            MessageDraft::group("", "alice", "hi"),
            MessageDraft::direct("alice", "bob", "x".repeat(MAX_TEXT_CHARS + 1)),
        ] {
            assert!(matches!(
                store.append(draft).await,
                Err(StoreError::ValidationFailed(_))
            ));
        }

        // Exactly at the cap is fine.
        assert!(store
            .append(MessageDraft::direct("alice", "bob", "x".repeat(MAX_TEXT_CHARS)))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_appends_ordered_by_id() {
        let store = Arc::new(MemoryStore::new());

        let mut handles = Vec::new();
        for i in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .append(MessageDraft::direct("alice", "bob", format!("m{i}")))
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let log = store.list_direct("alice", "bob", None).await.unwrap();
        assert_eq!(log.len(), 50);
        // The log order is the assignment order, regardless of task
        // interleaving.
        assert!(log.windows(2).all(|w| w[0].id < w[1].id));
    }
}

//! The committed message record and conversation references.
//!
//! A [`Message`] is the unit the whole system revolves around: the store
//! assigns its `id` and `created_at`, and every live push delivers the full
//! record as one logical unit.

use serde::{Deserialize, Serialize};

/// A unique, store-assigned message identifier.
///
/// Ids are strictly increasing within a store instance, so id order is
/// assignment order.
pub type MessageId = u64;

/// Where a message is addressed.
///
/// The variant carries only the field valid for its kind, so a message can
/// never have both a direct recipient and a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Target {
    /// One-to-one message to a single user identity.
    Direct {
        /// Recipient identity.
        to: String,
    },
    /// Message to a named group.
    Group {
        /// Group identity.
        group_id: String,
    },
}

impl Target {
    /// Create a direct target.
    #[must_use]
    pub fn direct(to: impl Into<String>) -> Self {
        Target::Direct { to: to.into() }
    }

    /// Create a group target.
    #[must_use]
    pub fn group(group_id: impl Into<String>) -> Self {
        Target::Group {
            group_id: group_id.into(),
        }
    }

    /// The recipient identity, if this is a direct target.
    #[must_use]
    pub fn direct_to(&self) -> Option<&str> {
        match self {
            Target::Direct { to } => Some(to),
            Target::Group { .. } => None,
        }
    }

    /// The group identity, if this is a group target.
    #[must_use]
    pub fn group_id(&self) -> Option<&str> {
        match self {
            Target::Direct { .. } => None,
            Target::Group { group_id } => Some(group_id),
        }
    }
}

/// A durably committed message.
///
/// Immutable once persisted. `id` and `created_at` are assigned by the
/// store and never trusted from the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Store-assigned ordering key.
    pub id: MessageId,
    /// Addressing, tagged by kind.
    #[serde(flatten)]
    pub target: Target,
    /// Sender identity.
    pub from: String,
    /// UTF-8 payload.
    pub text: String,
    /// Store-assigned Unix timestamp in milliseconds.
    pub created_at: u64,
}

impl Message {
    /// Whether this is a direct message.
    #[must_use]
    pub fn is_direct(&self) -> bool {
        matches!(self.target, Target::Direct { .. })
    }

    /// Whether this is a group message.
    #[must_use]
    pub fn is_group(&self) -> bool {
        matches!(self.target, Target::Group { .. })
    }
}

/// A client-side reference to a conversation, used for history requests.
///
/// A direct reference names the counterpart only; the session's own
/// identity supplies the other half of the pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ConversationRef {
    /// Direct conversation with another user.
    Direct {
        /// The other participant.
        with: String,
    },
    /// Group conversation.
    Group {
        /// Group identity.
        group_id: String,
    },
}

//! Group membership registry.
//!
//! The fan-out engine only ever reads membership (through
//! [`MembershipRegistry`]); the write path lives with the collaborator that
//! owns group lifecycle. [`MemoryMembership`] carries both sides for a
//! single-process deployment.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Maximum number of members in a group. Extra members supplied at
/// creation are truncated, not rejected.
pub const MAX_GROUP_MEMBERS: usize = 10;

/// Counter mixed into generated group ids so two creations in the same
/// nanosecond stay distinct.
static GROUP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Membership errors.
#[derive(Debug, Error)]
pub enum MembershipError {
    /// No group with the given id.
    #[error("Group not found: {0}")]
    NotFound(String),

    /// Rejected group mutation.
    #[error("Invalid group: {0}")]
    Invalid(&'static str),
}

/// A named group and its current member set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    /// Group identity, also the delivery topic.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Member identities, deduplicated, in insertion order.
    pub members: Vec<String>,
    /// Creator identity, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// Unix timestamp in milliseconds.
    pub created_at: u64,
}

impl Group {
    /// Whether the given identity is a member.
    #[must_use]
    pub fn has_member(&self, user: &str) -> bool {
        self.members.iter().any(|m| m == user)
    }
}

/// Read-side membership contract consumed by the fan-out engine.
///
/// Caller obligation: whatever owns the write path must propagate every
/// membership change into the subscription registry (subscribe the live
/// connections of an added member, unsubscribe a removed member's, drop
/// the topic of a deleted group) so delivery tracks membership without
/// requiring a reconnect.
#[async_trait]
pub trait MembershipRegistry: Send + Sync {
    /// The current member set of a group.
    ///
    /// # Errors
    ///
    /// `MembershipError::NotFound` if the group does not exist.
    async fn members_of(&self, group_id: &str) -> Result<HashSet<String>, MembershipError>;
}

/// In-memory membership registry with the collaborator write path.
#[derive(Debug, Default)]
pub struct MemoryMembership {
    groups: DashMap<String, Group>,
}

fn generate_group_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let counter = GROUP_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("grp_{:x}", nanos.wrapping_add(counter))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl MemoryMembership {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a group from a raw member list: members are trimmed,
    /// deduplicated, and truncated to [`MAX_GROUP_MEMBERS`].
    ///
    /// # Errors
    ///
    /// `MembershipError::Invalid` if the name is empty or no usable member
    /// remains after cleaning.
    pub fn create_group(
        &self,
        name: &str,
        created_by: Option<String>,
        members: &[String],
    ) -> Result<Group, MembershipError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MembershipError::Invalid("name must not be empty"));
        }

        let mut seen = HashSet::new();
        let cleaned: Vec<String> = members
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty() && seen.insert(m.clone()))
            .take(MAX_GROUP_MEMBERS)
            .collect();

        if cleaned.is_empty() {
            return Err(MembershipError::Invalid("at least 1 member required"));
        }

        let group = Group {
            id: generate_group_id(),
            name: name.to_string(),
            members: cleaned,
            created_by,
            created_at: now_millis(),
        };

        info!(group = %group.id, name = %group.name, members = group.members.len(), "Group created");
        self.groups.insert(group.id.clone(), group.clone());
        Ok(group)
    }

    /// Delete a group, returning its final state.
    ///
    /// # Errors
    ///
    /// `MembershipError::NotFound` if the group does not exist.
    pub fn delete_group(&self, group_id: &str) -> Result<Group, MembershipError> {
        match self.groups.remove(group_id) {
            Some((_, group)) => {
                info!(group = %group_id, "Group deleted");
                Ok(group)
            }
            None => Err(MembershipError::NotFound(group_id.to_string())),
        }
    }

    /// Add a member to a group. Returns `false` if already a member.
    ///
    /// # Errors
    ///
    /// `MembershipError::NotFound` if the group does not exist;
    /// `MembershipError::Invalid` if the group is full or the identity is
    /// empty.
    pub fn add_member(&self, group_id: &str, user: &str) -> Result<bool, MembershipError> {
        let user = user.trim();
        if user.is_empty() {
            return Err(MembershipError::Invalid("member must not be empty"));
        }

        let mut group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| MembershipError::NotFound(group_id.to_string()))?;

        if group.has_member(user) {
            return Ok(false);
        }
        if group.members.len() >= MAX_GROUP_MEMBERS {
            return Err(MembershipError::Invalid("group is full"));
        }

        group.members.push(user.to_string());
        debug!(group = %group_id, user = %user, "Member added");
        Ok(true)
    }

    /// Remove a member from a group. Returns `false` if not a member.
    ///
    /// # Errors
    ///
    /// `MembershipError::NotFound` if the group does not exist.
    pub fn remove_member(&self, group_id: &str, user: &str) -> Result<bool, MembershipError> {
        let mut group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| MembershipError::NotFound(group_id.to_string()))?;

        let before = group.members.len();
        group.members.retain(|m| m != user);
        let removed = group.members.len() < before;
        if removed {
            debug!(group = %group_id, user = %user, "Member removed");
        }
        Ok(removed)
    }

    /// Look up a group by id.
    #[must_use]
    pub fn get(&self, group_id: &str) -> Option<Group> {
        self.groups.get(group_id).map(|g| g.clone())
    }

    /// All groups, newest first; optionally only those containing `member`.
    #[must_use]
    pub fn list_groups(&self, member: Option<&str>) -> Vec<Group> {
        let mut groups: Vec<Group> = self
            .groups
            .iter()
            .filter(|g| member.map_or(true, |m| g.has_member(m)))
            .map(|g| g.clone())
            .collect();
        groups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        groups
    }
}

#[async_trait]
impl MembershipRegistry for MemoryMembership {
    async fn members_of(&self, group_id: &str) -> Result<HashSet<String>, MembershipError> {
        self.groups
            .get(group_id)
            .map(|g| g.members.iter().cloned().collect())
            .ok_or_else(|| MembershipError::NotFound(group_id.to_string()))
    }
}

//! # courier-core
//!
//! The message delivery and fan-out engine for Courier.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **MessageStore** - Durable append-only conversation log with
//!   store-assigned ids and timestamps
//! - **MembershipRegistry** - Authoritative group → member mapping,
//!   read-only from the engine's side
//! - **SubscriptionRegistry** - Live topic → connection mapping with join
//!   cursors for backlog reconciliation
//! - **Engine** - The orchestrator: validate, commit, resolve targets,
//!   fan out
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌───────────────┐
//! │   Session   │────▶│   Engine    │────▶│ MessageStore  │
//! └─────────────┘     └─────────────┘     └───────────────┘
//!                        │         │
//!                        ▼         ▼
//!            ┌──────────────┐   ┌──────────────────────┐
//!            │  Membership  │   │ SubscriptionRegistry │
//!            └──────────────┘   └──────────────────────┘
//! ```

pub mod engine;
pub mod membership;
pub mod store;
pub mod subscriptions;

pub use courier_protocol::{Message, MessageId, Target};
pub use engine::{Engine, EngineError, Submission};
pub use membership::{Group, MembershipError, MembershipRegistry, MemoryMembership};
pub use store::{ConversationKey, MemoryStore, MessageDraft, MessageStore, StoreError};
pub use subscriptions::{
    ConnectionId, PushEvent, PushSender, RegistryStats, Subscriber, SubscriptionRegistry, Topic,
};

//! # courier-protocol
//!
//! Wire protocol definitions for the Courier message delivery engine.
//!
//! This crate defines the binary protocol spoken between Courier clients
//! and servers: the committed message record, frame types, the
//! length-prefixed MessagePack codec, and version negotiation.
//!
//! ## Frame Types
//!
//! - `Hello` / `Welcome` - Session handshake binding an identity
//! - `Join` / `Leave` - Topic subscription for live delivery
//! - `SendDirect` / `SendGroup` / `Sent` - Message submission and its
//!   acknowledgment carrying the committed record
//! - `Deliver` - Live push of a committed message
//! - `History` / `Backlog` - Conversation catch-up
//! - `Signal` - Ephemeral, best-effort events (typing indicators)
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, Frame};
//!
//! let frame = Frame::send_direct(1, "bob", "Hello, Bob!");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod message;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{Frame, FrameType};
pub use message::{ConversationRef, Message, MessageId, Target};
pub use version::{Version, PROTOCOL_VERSION};

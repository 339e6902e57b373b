//! Frame types for the Courier protocol.
//!
//! Frames are the unit of exchange between a client session and the server.
//! Each frame is serialized with MessagePack and carried behind a length
//! prefix (see [`crate::codec`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{ConversationRef, Message, MessageId};

/// Error codes carried by [`Frame::Error`].
pub mod code {
    /// Malformed or unexpected frame.
    pub const BAD_FRAME: u16 = 1001;
    /// Missing or invalid argument.
    pub const INVALID_ARGUMENT: u16 = 1002;
    /// Unknown group or conversation.
    pub const NOT_FOUND: u16 = 1003;
    /// Incompatible protocol version.
    pub const INCOMPATIBLE_VERSION: u16 = 1004;
    /// Subscription limit reached.
    pub const LIMIT_EXCEEDED: u16 = 1005;
    /// Internal server fault.
    pub const INTERNAL: u16 = 1006;
}

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Hello = 0x01,
    Welcome = 0x02,
    Join = 0x03,
    Joined = 0x04,
    Leave = 0x05,
    SendDirect = 0x06,
    SendGroup = 0x07,
    Sent = 0x08,
    Deliver = 0x09,
    History = 0x0A,
    Backlog = 0x0B,
    Signal = 0x0C,
    Ack = 0x0D,
    Error = 0x0E,
    Ping = 0x0F,
    Pong = 0x10,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Hello),
            0x02 => Ok(FrameType::Welcome),
            0x03 => Ok(FrameType::Join),
            0x04 => Ok(FrameType::Joined),
            0x05 => Ok(FrameType::Leave),
            0x06 => Ok(FrameType::SendDirect),
            0x07 => Ok(FrameType::SendGroup),
            0x08 => Ok(FrameType::Sent),
            0x09 => Ok(FrameType::Deliver),
            0x0A => Ok(FrameType::History),
            0x0B => Ok(FrameType::Backlog),
            0x0C => Ok(FrameType::Signal),
            0x0D => Ok(FrameType::Ack),
            0x0E => Ok(FrameType::Error),
            0x0F => Ok(FrameType::Ping),
            0x10 => Ok(FrameType::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// A protocol frame.
///
/// Client-originated frames carry a request `id` where the client expects a
/// correlated response; server pushes (`Deliver`, `Signal`) carry none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Session handshake. The identity string is trusted as given; the
    /// engine never authenticates.
    #[serde(rename = "hello")]
    Hello {
        /// Protocol major version the client speaks.
        version: u8,
        /// Identity to bind this session to.
        identity: String,
    },

    /// Handshake accepted.
    #[serde(rename = "welcome")]
    Welcome {
        /// Unique connection identifier.
        connection_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Subscribe this session to a topic (a user or group identity).
    #[serde(rename = "join")]
    Join {
        /// Request ID for acknowledgment.
        id: u64,
        /// Topic to join.
        topic: String,
    },

    /// Join accepted, with the backlog cursor snapshotted at join time.
    #[serde(rename = "joined")]
    Joined {
        /// ID of the join request.
        id: u64,
        /// Last message id assigned before the join; backlog reads up to
        /// this cursor, live pushes start after it.
        cursor: MessageId,
    },

    /// Unsubscribe this session from a topic.
    #[serde(rename = "leave")]
    Leave {
        /// Request ID for acknowledgment.
        id: u64,
        /// Topic to leave.
        topic: String,
    },

    /// Submit a direct message.
    #[serde(rename = "send_direct")]
    SendDirect {
        /// Request ID for acknowledgment.
        id: u64,
        /// Recipient identity.
        to: String,
        /// Message text.
        text: String,
    },

    /// Submit a group message.
    #[serde(rename = "send_group")]
    SendGroup {
        /// Request ID for acknowledgment.
        id: u64,
        /// Group identity.
        group_id: String,
        /// Message text.
        text: String,
    },

    /// Submission acknowledged: carries the durably committed record.
    #[serde(rename = "sent")]
    Sent {
        /// ID of the send request.
        id: u64,
        /// The committed message with store-assigned id and timestamp.
        message: Message,
    },

    /// Live push of a committed message to a subscriber.
    #[serde(rename = "deliver")]
    Deliver {
        /// The full committed record.
        message: Message,
    },

    /// Request conversation history.
    #[serde(rename = "history")]
    History {
        /// Request ID.
        id: u64,
        /// Which conversation to read.
        conversation: ConversationRef,
        /// Only messages created strictly after this timestamp.
        #[serde(skip_serializing_if = "Option::is_none")]
        since: Option<u64>,
        /// Only messages with id at or below this cursor (backlog
        /// reconciliation after a join).
        #[serde(skip_serializing_if = "Option::is_none")]
        until: Option<MessageId>,
    },

    /// History response, ascending by assignment order.
    #[serde(rename = "backlog")]
    Backlog {
        /// ID of the history request.
        id: u64,
        /// Messages in assignment order.
        messages: Vec<Message>,
    },

    /// Ephemeral signal (e.g. a typing indicator). Never persisted,
    /// delivered best-effort, lost silently.
    #[serde(rename = "signal")]
    Signal {
        /// Topic the signal is scoped to.
        topic: String,
        /// Originating identity; filled in by the server on forward.
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        /// Opaque signal payload.
        payload: Value,
    },

    /// Generic acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code (see [`code`]).
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Optional timestamp echoed back in the pong.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from the ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Hello { .. } => FrameType::Hello,
            Frame::Welcome { .. } => FrameType::Welcome,
            Frame::Join { .. } => FrameType::Join,
            Frame::Joined { .. } => FrameType::Joined,
            Frame::Leave { .. } => FrameType::Leave,
            Frame::SendDirect { .. } => FrameType::SendDirect,
            Frame::SendGroup { .. } => FrameType::SendGroup,
            Frame::Sent { .. } => FrameType::Sent,
            Frame::Deliver { .. } => FrameType::Deliver,
            Frame::History { .. } => FrameType::History,
            Frame::Backlog { .. } => FrameType::Backlog,
            Frame::Signal { .. } => FrameType::Signal,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Create a new Hello frame.
    #[must_use]
    pub fn hello(version: u8, identity: impl Into<String>) -> Self {
        Frame::Hello {
            version,
            identity: identity.into(),
        }
    }

    /// Create a new Welcome frame.
    #[must_use]
    pub fn welcome(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        Frame::Welcome {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create a new Join frame.
    #[must_use]
    pub fn join(id: u64, topic: impl Into<String>) -> Self {
        Frame::Join {
            id,
            topic: topic.into(),
        }
    }

    /// Create a new Joined frame.
    #[must_use]
    pub fn joined(id: u64, cursor: MessageId) -> Self {
        Frame::Joined { id, cursor }
    }

    /// Create a new Leave frame.
    #[must_use]
    pub fn leave(id: u64, topic: impl Into<String>) -> Self {
        Frame::Leave {
            id,
            topic: topic.into(),
        }
    }

    /// Create a new SendDirect frame.
    #[must_use]
    pub fn send_direct(id: u64, to: impl Into<String>, text: impl Into<String>) -> Self {
        Frame::SendDirect {
            id,
            to: to.into(),
            text: text.into(),
        }
    }

    /// Create a new SendGroup frame.
    #[must_use]
    pub fn send_group(id: u64, group_id: impl Into<String>, text: impl Into<String>) -> Self {
        Frame::SendGroup {
            id,
            group_id: group_id.into(),
            text: text.into(),
        }
    }

    /// Create a new Sent frame.
    #[must_use]
    pub fn sent(id: u64, message: Message) -> Self {
        Frame::Sent { id, message }
    }

    /// Create a new Deliver frame.
    #[must_use]
    pub fn deliver(message: Message) -> Self {
        Frame::Deliver { message }
    }

    /// Create a new Backlog frame.
    #[must_use]
    pub fn backlog(id: u64, messages: Vec<Message>) -> Self {
        Frame::Backlog { id, messages }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}

//! Domain types shared by every node in a relaychat cluster.
//!
//! # Design Pattern: Newtype
//!
//! `MessageId` is a single-field tuple struct wrapping a `String`. It has
//! zero runtime cost but keeps a message id from being accidentally passed
//! where a plain username or content string is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A globally unique identifier for a message, generated at the node that
/// first created the message (UUID v4).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps an existing id string (e.g. one read back from the log or
    /// received from a peer).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh, collision-resistant id for a message originating
    /// at this node.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read-state of a message. Transitions are monotone: `Unread -> Read`,
/// never back (invariant I3, spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Unread,
    Read,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Unread => "unread",
            Status::Read => "read",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "unread" => Some(Status::Unread),
            "read" => Some(Status::Read),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single chat message. Immutable except for `status` (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: String,
    pub recipient: String,
    pub content: String,
    /// Seconds since epoch. Monotonic only within one node (spec §3) —
    /// never treat this as a global clock.
    pub timestamp: f64,
    pub status: Status,
}

impl Message {
    /// Creates a newly-originated message with a fresh id.
    pub fn new(sender: impl Into<String>, recipient: impl Into<String>, content: impl Into<String>, timestamp: f64, status: Status) -> Self {
        Self {
            id: MessageId::generate(),
            sender: sender.into(),
            recipient: recipient.into(),
            content: content.into(),
            timestamp,
            status,
        }
    }
}

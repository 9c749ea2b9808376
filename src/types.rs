//! Core types for update distribution.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default capacity of a subscriber's delivery buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 10;

/// One state change of a resource, as seen by subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub resource_id: String,
    pub changed_count: i64,
    pub message: String,
}

impl UpdateEvent {
    pub fn new(
        resource_id: impl Into<String>,
        changed_count: i64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            changed_count,
            message: message.into(),
        }
    }

    /// Binary encoding used as the durable log record value.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decode a durable log record value.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Unique identifier for a subscription within one broker.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Action carried by a session control message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Subscribe,
    Update,
}

impl Action {
    /// Parse a wire action. Unknown actions yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "subscribe" => Some(Action::Subscribe),
            "update" => Some(Action::Update),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Subscribe => "subscribe",
            Action::Update => "update",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-to-server session message.
///
/// The action stays a raw string on the wire so that unknown actions can be
/// received and ignored instead of failing the session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub resource_id: String,
    pub action: String,
}

impl ControlMessage {
    pub fn new(resource_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            action: action.into(),
        }
    }

    pub fn subscribe(resource_id: impl Into<String>) -> Self {
        Self::new(resource_id, Action::Subscribe.as_str())
    }

    pub fn update(resource_id: impl Into<String>) -> Self {
        Self::new(resource_id, Action::Update.as_str())
    }

    pub fn action(&self) -> Option<Action> {
        Action::parse(&self.action)
    }
}

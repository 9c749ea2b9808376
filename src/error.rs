//! Error types for update distribution.

use thiserror::Error;

/// Main error type for broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("No configured node is reachable: {}", nodes.join(","))]
    Unreachable { nodes: Vec<String> },

    #[error("Log transport error: {0}")]
    Log(#[from] LogError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation deadline exceeded")]
    DeadlineExceeded,

    #[error("Broker is closed")]
    Closed,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<rmp_serde::encode::Error> for BrokerError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for BrokerError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        BrokerError::Deserialization(e.to_string())
    }
}

/// Errors raised by a log transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    #[error("Unknown topic or partition: {0}")]
    UnknownTopic(String),

    #[error("Topic already exists: {0}")]
    TopicExists(String),

    #[error("Node unreachable: {0}")]
    Unreachable(String),

    #[error("Log closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Errors that end a client session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Client disconnected")]
    Disconnected,

    #[error("Session transport error: {0}")]
    Transport(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Codec(e.to_string())
    }
}

impl From<tokio_util::codec::LinesCodecError> for SessionError {
    fn from(e: tokio_util::codec::LinesCodecError) -> Self {
        match e {
            tokio_util::codec::LinesCodecError::Io(io) => SessionError::Io(io),
            other => SessionError::Codec(other.to_string()),
        }
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

//! Broker and server configuration.
//!
//! Read once at startup from the process environment. `from_lookup` takes any
//! key lookup so tests never mutate the real environment.

use crate::error::{BrokerError, Result};
use crate::types::DEFAULT_BUFFER_CAPACITY;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

pub const ENV_BACKEND: &str = "COMMUNICATION_METHOD";
pub const ENV_NODES: &str = "KAFKA_BROKERS";
pub const ENV_TOPIC_PREFIX: &str = "KAFKA_TOPIC_PREFIX";
pub const ENV_BUFFER_CAPACITY: &str = "UPDATES_BUFFER_CAPACITY";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "KAFKA_CONNECT_TIMEOUT_MS";
pub const ENV_PARTITIONS: &str = "KAFKA_PARTITIONS";
pub const ENV_LISTEN_ADDR: &str = "LISTEN_ADDR";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "LOG_FORMAT";

/// Which broker backend to build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    InProcess,
    Durable,
}

impl BackendKind {
    /// `kafka` and `durable` select the durable backend; anything else,
    /// including an empty value, selects the in-process one.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "kafka" | "durable" => BackendKind::Durable,
            _ => BackendKind::InProcess,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::InProcess => "in_process",
            BackendKind::Durable => "durable",
        }
    }
}

/// Broker configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub backend: BackendKind,

    /// Durable backend node addresses (`host:port`).
    pub nodes: Vec<String>,

    /// Prefix of the shared topic name.
    pub topic_prefix: String,

    /// Delivery buffer capacity per subscriber.
    pub buffer_capacity: usize,

    /// Upper bound for reaching the durable backend at startup.
    pub connect_timeout: Duration,

    /// Partition count used when provisioning the topic.
    pub partitions: i32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::InProcess,
            nodes: vec!["localhost:9092".to_string()],
            topic_prefix: "issue-tracker".to_string(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            connect_timeout: Duration::from_secs(5),
            partitions: 1,
        }
    }
}

impl BrokerConfig {
    /// An in-process configuration with defaults.
    pub fn in_process() -> Self {
        Self::default()
    }

    /// A durable configuration for the given nodes.
    pub fn durable<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            backend: BackendKind::Durable,
            nodes: nodes.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(backend) = get(ENV_BACKEND) {
            config.backend = BackendKind::parse(&backend);
        }
        if let Some(nodes) = get(ENV_NODES) {
            config.nodes = nodes
                .split(',')
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect();
        }
        if let Some(prefix) = get(ENV_TOPIC_PREFIX) {
            config.topic_prefix = prefix.trim().to_string();
        }
        if let Some(capacity) = get(ENV_BUFFER_CAPACITY) {
            config.buffer_capacity = parse_number(ENV_BUFFER_CAPACITY, &capacity)?;
        }
        if let Some(ms) = get(ENV_CONNECT_TIMEOUT_MS) {
            config.connect_timeout = Duration::from_millis(parse_number(ENV_CONNECT_TIMEOUT_MS, &ms)?);
        }
        if let Some(partitions) = get(ENV_PARTITIONS) {
            config.partitions = parse_number(ENV_PARTITIONS, &partitions)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(BrokerError::Config("buffer capacity must be at least 1".into()));
        }
        if self.backend == BackendKind::Durable {
            if self.nodes.is_empty() {
                return Err(BrokerError::Config("durable backend needs at least one node".into()));
            }
            if self.partitions < 1 {
                return Err(BrokerError::Config("partition count must be at least 1".into()));
            }
        }
        Ok(())
    }

    /// Name of the shared topic.
    pub fn topic(&self) -> String {
        format!("{}.projects", self.topic_prefix)
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| BrokerError::Config(format!("{key}: not a valid number: {value}")))
}

/// Settings for the session server binary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub log_level: String,
    pub log_format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7070".to_string(),
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str, default: String| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
        };
        Self {
            listen_addr: get(ENV_LISTEN_ADDR, defaults.listen_addr),
            log_level: get(ENV_LOG_LEVEL, defaults.log_level),
            log_format: get(ENV_LOG_FORMAT, defaults.log_format),
        }
    }
}

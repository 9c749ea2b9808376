//! Append-only log transports for the durable broker.
//!
//! A transport stores keyed records in named topics and hands out readers
//! bound to a consumer group. Readers in the same group share one position and
//! compete for records; readers in different groups each see every record.
//!
//! - [`KafkaLog`]: a Kafka cluster reached through a node list
//! - [`MemoryLog`]: the same model held in process memory

mod kafka;
mod memory;

pub use kafka::KafkaLog;
pub use memory::MemoryLog;

use crate::error::LogError;
use async_trait::async_trait;

/// One keyed record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl LogRecord {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// What a reader consumes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReaderSpec {
    pub topic: String,
    /// Key the reader is interested in. Transports may use it to pick the
    /// partition; readers still return every record of that partition.
    pub key: Vec<u8>,
    pub group: String,
}

#[async_trait]
pub trait LogTransport: Send + Sync {
    /// Fails with [`LogError::TopicExists`] when the topic is already there.
    async fn create_topic(&self, topic: &str) -> Result<(), LogError>;

    /// Fails with [`LogError::UnknownTopic`] when the topic does not exist.
    async fn append(&self, topic: &str, record: LogRecord) -> Result<(), LogError>;

    /// Reader positioned at the group's current offset; new groups start at
    /// the end of the log.
    async fn open_reader(&self, spec: ReaderSpec) -> Result<Box<dyn LogReader>, LogError>;

    async fn close(&self) -> Result<(), LogError>;
}

#[async_trait]
pub trait LogReader: Send {
    /// Waits for the next record. [`LogError::Closed`] is terminal.
    async fn next_record(&mut self) -> Result<LogRecord, LogError>;

    async fn close(&mut self);
}

/// Partition a key maps to. Stable for a given key and partition count.
pub fn partition_for(key: &[u8], partitions: i32) -> i32 {
    let partitions = partitions.max(1) as u32;
    (crc32fast::hash(key) % partitions) as i32
}

//! Kafka log transport.

use super::{partition_for, LogReader, LogRecord, LogTransport, ReaderSpec};
use crate::error::{BrokerError, LogError};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use rskafka::client::consumer::{StartOffset, StreamConsumerBuilder};
use rskafka::client::partition::{Compression, PartitionClient, UnknownTopicHandling};
use rskafka::client::{Client, ClientBuilder};
use rskafka::record::{Record, RecordAndOffset};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Broker-side timeout for topic creation.
const CREATE_TOPIC_TIMEOUT_MS: i32 = 5_000;

/// Longest a fetch waits on the broker before returning empty.
const FETCH_MAX_WAIT_MS: i32 = 500;

/// Translate a client error, keeping the two conditions the broker reacts to.
fn classify(topic: &str, err: rskafka::client::error::Error) -> LogError {
    let detail = format!("{err:?}");
    if detail.contains("UnknownTopicOrPartition") {
        LogError::UnknownTopic(topic.to_string())
    } else if detail.contains("TopicAlreadyExists") {
        LogError::TopicExists(topic.to_string())
    } else {
        LogError::Transport(err.to_string())
    }
}

/// Returns the first node that accepts a TCP connection.
async fn probe(nodes: &[String], timeout: Duration) -> Option<String> {
    for node in nodes {
        info!(node = %node, "attempting to reach log node");
        match tokio::time::timeout(timeout, TcpStream::connect(node.as_str())).await {
            Ok(Ok(_)) => return Some(node.clone()),
            Ok(Err(e)) => warn!(node = %node, error = %e, "could not reach log node"),
            Err(_) => warn!(node = %node, ?timeout, "timed out reaching log node"),
        }
    }
    None
}

/// Topics on a Kafka cluster.
///
/// Records go to the partition their key hashes to, so a reader only follows
/// the one partition its resource lives in. Readers track their own position
/// from the moment they open, starting at the latest offset.
pub struct KafkaLog {
    client: Client,
    partitions: i32,
    producers: Mutex<HashMap<(String, i32), Arc<PartitionClient>>>,
    closed: AtomicBool,
}

impl KafkaLog {
    /// Connect through the first reachable node in `nodes`.
    ///
    /// Fails with [`BrokerError::Unreachable`] when no node accepts a
    /// connection within `timeout`.
    pub async fn connect(
        nodes: &[String],
        partitions: i32,
        timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let unreachable = || BrokerError::Unreachable {
            nodes: nodes.to_vec(),
        };

        let first = probe(nodes, timeout).await.ok_or_else(unreachable)?;
        let mut bootstrap = vec![first.clone()];
        bootstrap.extend(nodes.iter().filter(|n| **n != first).cloned());

        let client = tokio::time::timeout(timeout, ClientBuilder::new(bootstrap).build())
            .await
            .map_err(|_| unreachable())?
            .map_err(|e| BrokerError::Log(LogError::Unreachable(e.to_string())))?;

        info!(node = %first, partitions, "connected to log cluster");
        Ok(Self {
            client,
            partitions: partitions.max(1),
            producers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    async fn partition_client(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<Arc<PartitionClient>, LogError> {
        let key = (topic.to_string(), partition);
        let cached = self.producers.lock().get(&key).cloned();
        if let Some(client) = cached {
            return Ok(client);
        }

        let client = self
            .client
            .partition_client(topic.to_string(), partition, UnknownTopicHandling::Error)
            .await
            .map_err(|e| classify(topic, e))?;
        let client = Arc::new(client);
        self.producers.lock().insert(key, Arc::clone(&client));
        Ok(client)
    }

    fn ensure_open(&self) -> Result<(), LogError> {
        if self.closed.load(Ordering::Acquire) {
            Err(LogError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LogTransport for KafkaLog {
    async fn create_topic(&self, topic: &str) -> Result<(), LogError> {
        self.ensure_open()?;
        let controller = self
            .client
            .controller_client()
            .map_err(|e| classify(topic, e))?;
        controller
            .create_topic(topic, self.partitions, 1, CREATE_TOPIC_TIMEOUT_MS)
            .await
            .map_err(|e| classify(topic, e))
    }

    async fn append(&self, topic: &str, record: LogRecord) -> Result<(), LogError> {
        self.ensure_open()?;
        let partition = partition_for(&record.key, self.partitions);
        let client = self.partition_client(topic, partition).await?;

        let record = Record {
            key: Some(record.key),
            value: Some(record.value),
            headers: BTreeMap::new(),
            timestamp: Utc::now(),
        };
        match client.produce(vec![record], Compression::NoCompression).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = classify(topic, e);
                if matches!(err, LogError::UnknownTopic(_)) {
                    self.producers.lock().remove(&(topic.to_string(), partition));
                }
                Err(err)
            }
        }
    }

    async fn open_reader(&self, spec: ReaderSpec) -> Result<Box<dyn LogReader>, LogError> {
        self.ensure_open()?;
        let partition = partition_for(&spec.key, self.partitions);
        let client = self.partition_client(&spec.topic, partition).await?;
        let stream = StreamConsumerBuilder::new(client, StartOffset::Latest)
            .with_max_wait_ms(FETCH_MAX_WAIT_MS)
            .build()
            .boxed();

        debug!(topic = %spec.topic, partition, group = %spec.group, "opened log reader");
        Ok(Box::new(KafkaReader {
            topic: spec.topic,
            stream: Some(stream),
        }))
    }

    async fn close(&self) -> Result<(), LogError> {
        self.closed.store(true, Ordering::Release);
        self.producers.lock().clear();
        Ok(())
    }
}

type RecordStream =
    BoxStream<'static, Result<(RecordAndOffset, i64), rskafka::client::error::Error>>;

struct KafkaReader {
    topic: String,
    stream: Option<RecordStream>,
}

#[async_trait]
impl LogReader for KafkaReader {
    async fn next_record(&mut self) -> Result<LogRecord, LogError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(LogError::Closed);
        };
        match stream.next().await {
            Some(Ok((record, _high_watermark))) => Ok(LogRecord {
                key: record.record.key.unwrap_or_default(),
                value: record.record.value.unwrap_or_default(),
            }),
            Some(Err(e)) => Err(classify(&self.topic, e)),
            None => Err(LogError::Closed),
        }
    }

    async fn close(&mut self) {
        self.stream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_reachable_node() {
        let nodes = vec!["127.0.0.1:1".to_string()];
        let result = KafkaLog::connect(&nodes, 1, Duration::from_millis(500)).await;
        match result {
            Err(BrokerError::Unreachable { nodes: tried }) => assert_eq!(tried, nodes),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connected to a closed port"),
        }
    }
}

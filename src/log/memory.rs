//! Log transport held in process memory.

use super::{LogReader, LogRecord, LogTransport, ReaderSpec};
use crate::error::LogError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// A consumer group with at least one open reader.
struct Group {
    /// Offset of the next record to hand out.
    offset: usize,
    members: usize,
}

struct Topic {
    /// Tells a recreated topic apart from the one a reader opened.
    epoch: u64,
    records: Vec<LogRecord>,
    groups: HashMap<String, Group>,
    /// Carries the record count; readers wait on it.
    len_tx: watch::Sender<usize>,
}

impl Topic {
    fn new(epoch: u64) -> Self {
        let (len_tx, _) = watch::channel(0);
        Self {
            epoch,
            records: Vec::new(),
            groups: HashMap::new(),
            len_tx,
        }
    }
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Topic>,
    epochs: u64,
    failing_appends: usize,
    fail_creates: bool,
    closed: bool,
}

impl State {
    fn insert_topic(&mut self, name: &str) {
        self.epochs += 1;
        self.topics.insert(name.to_string(), Topic::new(self.epochs));
    }

    /// The topic `name`, unless it was deleted since `epoch`.
    fn topic_at(&mut self, name: &str, epoch: u64) -> Option<&mut Topic> {
        self.topics.get_mut(name).filter(|t| t.epoch == epoch)
    }
}

struct Shared {
    state: Mutex<State>,
    auto_create: bool,
    appends: AtomicUsize,
    creates: AtomicUsize,
}

impl Shared {
    fn take_next(
        &self,
        topic: &str,
        epoch: u64,
        group: &str,
    ) -> Result<Option<LogRecord>, LogError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(LogError::Closed);
        }
        let Some(topic) = state.topic_at(topic, epoch) else {
            return Err(LogError::Closed);
        };
        let Some(group) = topic.groups.get_mut(group) else {
            return Err(LogError::Closed);
        };
        match topic.records.get(group.offset) {
            Some(record) => {
                group.offset += 1;
                Ok(Some(record.clone()))
            }
            None => Ok(None),
        }
    }

    /// Forget a group's offset once its last reader is gone.
    fn leave(&self, topic: &str, epoch: u64, group: &str) {
        let mut state = self.state.lock();
        let Some(topic) = state.topic_at(topic, epoch) else {
            return;
        };
        if let Some(g) = topic.groups.get_mut(group) {
            g.members -= 1;
            if g.members == 0 {
                topic.groups.remove(group);
            }
        }
    }
}

/// In-memory topics with consumer groups.
///
/// Readers of one group compete for records; separate groups each see every
/// record. A group exists while it has open readers and starts at the end of
/// the topic, so records appended while nobody in the group was reading are
/// never handed out.
///
/// Cloning shares the same log, so several brokers can stand in for separate
/// processes attached to one cluster. Fault injection covers the paths a real
/// cluster exercises: missing topics, refused topic creation and failed
/// writes.
#[derive(Clone)]
pub struct MemoryLog {
    shared: Arc<Shared>,
}

impl MemoryLog {
    /// Appends to a missing topic create it.
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Appends to a missing topic fail with [`LogError::UnknownTopic`].
    pub fn without_auto_create() -> Self {
        Self::build(false)
    }

    fn build(auto_create: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                auto_create,
                appends: AtomicUsize::new(0),
                creates: AtomicUsize::new(0),
            }),
        }
    }

    /// The next `n` appends fail with a transport error.
    pub fn fail_next_appends(&self, n: usize) {
        self.shared.state.lock().failing_appends = n;
    }

    /// While set, topic creation fails as if no node answered.
    pub fn set_fail_creates(&self, fail: bool) {
        self.shared.state.lock().fail_creates = fail;
    }

    /// Delete a topic, as an operator might. Open readers see it closed.
    pub fn delete_topic(&self, topic: &str) -> bool {
        self.shared.state.lock().topics.remove(topic).is_some()
    }

    pub fn topic_exists(&self, topic: &str) -> bool {
        self.shared.state.lock().topics.contains_key(topic)
    }

    pub fn records(&self, topic: &str) -> Vec<LogRecord> {
        self.shared
            .state
            .lock()
            .topics
            .get(topic)
            .map(|t| t.records.clone())
            .unwrap_or_default()
    }

    /// Append attempts, successful or not.
    pub fn append_count(&self) -> usize {
        self.shared.appends.load(Ordering::SeqCst)
    }

    /// Topic creation attempts, successful or not.
    pub fn create_count(&self) -> usize {
        self.shared.creates.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogTransport for MemoryLog {
    async fn create_topic(&self, topic: &str) -> Result<(), LogError> {
        self.shared.creates.fetch_add(1, Ordering::SeqCst);
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(LogError::Closed);
        }
        if state.fail_creates {
            return Err(LogError::Unreachable("topic creation refused".into()));
        }
        if state.topics.contains_key(topic) {
            return Err(LogError::TopicExists(topic.to_string()));
        }
        state.insert_topic(topic);
        Ok(())
    }

    async fn append(&self, topic: &str, record: LogRecord) -> Result<(), LogError> {
        self.shared.appends.fetch_add(1, Ordering::SeqCst);
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(LogError::Closed);
        }
        if state.failing_appends > 0 {
            state.failing_appends -= 1;
            return Err(LogError::Transport("write failed".into()));
        }
        if !state.topics.contains_key(topic) {
            if !self.shared.auto_create {
                return Err(LogError::UnknownTopic(topic.to_string()));
            }
            state.insert_topic(topic);
        }
        if let Some(t) = state.topics.get_mut(topic) {
            t.records.push(record);
            t.len_tx.send_replace(t.records.len());
        }
        Ok(())
    }

    async fn open_reader(&self, spec: ReaderSpec) -> Result<Box<dyn LogReader>, LogError> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(LogError::Closed);
        }
        if !state.topics.contains_key(&spec.topic) {
            if !self.shared.auto_create {
                return Err(LogError::UnknownTopic(spec.topic));
            }
            state.insert_topic(&spec.topic);
        }
        let topic = state
            .topics
            .get_mut(&spec.topic)
            .ok_or_else(|| LogError::UnknownTopic(spec.topic.clone()))?;
        let len = topic.records.len();
        let epoch = topic.epoch;
        topic
            .groups
            .entry(spec.group.clone())
            .or_insert(Group {
                offset: len,
                members: 0,
            })
            .members += 1;
        let changes = topic.len_tx.subscribe();

        Ok(Box::new(MemoryReader {
            shared: Arc::clone(&self.shared),
            topic: spec.topic,
            epoch,
            group: spec.group,
            changes,
            closed: false,
        }))
    }

    async fn close(&self) -> Result<(), LogError> {
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.topics.clear();
        Ok(())
    }
}

struct MemoryReader {
    shared: Arc<Shared>,
    topic: String,
    epoch: u64,
    group: String,
    changes: watch::Receiver<usize>,
    closed: bool,
}

impl MemoryReader {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.leave(&self.topic, self.epoch, &self.group);
        }
    }
}

impl Drop for MemoryReader {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl LogReader for MemoryReader {
    async fn next_record(&mut self) -> Result<LogRecord, LogError> {
        loop {
            if self.closed {
                return Err(LogError::Closed);
            }
            // Mark the current length seen before looking, so an append that
            // lands after the check still wakes us.
            self.changes.borrow_and_update();
            if let Some(record) = self.shared.take_next(&self.topic, self.epoch, &self.group)? {
                return Ok(record);
            }
            if self.changes.changed().await.is_err() {
                return Err(LogError::Closed);
            }
        }
    }

    async fn close(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(group: &str) -> ReaderSpec {
        ReaderSpec {
            topic: "t.projects".into(),
            key: b"p1".to_vec(),
            group: group.into(),
        }
    }

    async fn next(reader: &mut Box<dyn LogReader>) -> LogRecord {
        tokio::time::timeout(Duration::from_secs(1), reader.next_record())
            .await
            .expect("reader timed out")
            .unwrap()
    }

    #[tokio::test]
    async fn test_missing_topic_without_auto_create() {
        let log = MemoryLog::without_auto_create();
        let result = log.append("t.projects", LogRecord::new("p1", "v")).await;
        assert_eq!(result, Err(LogError::UnknownTopic("t.projects".into())));

        log.create_topic("t.projects").await.unwrap();
        assert_eq!(
            log.create_topic("t.projects").await,
            Err(LogError::TopicExists("t.projects".into()))
        );
        log.append("t.projects", LogRecord::new("p1", "v")).await.unwrap();
        assert_eq!(log.records("t.projects").len(), 1);
    }

    #[tokio::test]
    async fn test_new_group_starts_at_end() {
        let log = MemoryLog::new();
        log.append("t.projects", LogRecord::new("p1", "old")).await.unwrap();

        let mut reader = log.open_reader(spec("g1")).await.unwrap();
        log.append("t.projects", LogRecord::new("p1", "new")).await.unwrap();

        assert_eq!(next(&mut reader).await.value, b"new".to_vec());
    }

    #[tokio::test]
    async fn test_groups_broadcast_and_members_compete() {
        let log = MemoryLog::new();
        let mut a1 = log.open_reader(spec("a")).await.unwrap();
        let mut a2 = log.open_reader(spec("a")).await.unwrap();
        let mut b = log.open_reader(spec("b")).await.unwrap();

        log.append("t.projects", LogRecord::new("p1", "1")).await.unwrap();
        log.append("t.projects", LogRecord::new("p1", "2")).await.unwrap();

        // Group "b" sees everything.
        assert_eq!(next(&mut b).await.value, b"1".to_vec());
        assert_eq!(next(&mut b).await.value, b"2".to_vec());

        // Group "a" members split the records between them.
        let first = next(&mut a1).await;
        let second = next(&mut a2).await;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_group_restarts_at_end_after_last_reader_leaves() {
        let log = MemoryLog::new();
        let mut first = log.open_reader(spec("g")).await.unwrap();
        let mut other = log.open_reader(spec("g")).await.unwrap();
        other.close().await;

        // One member left, so the group keeps its place.
        log.append("t.projects", LogRecord::new("p1", "1")).await.unwrap();
        assert_eq!(next(&mut first).await.value, b"1".to_vec());
        first.close().await;

        log.append("t.projects", LogRecord::new("p1", "missed")).await.unwrap();
        let mut again = log.open_reader(spec("g")).await.unwrap();
        log.append("t.projects", LogRecord::new("p1", "2")).await.unwrap();
        assert_eq!(next(&mut again).await.value, b"2".to_vec());
    }

    #[tokio::test]
    async fn test_deleted_topic_closes_readers() {
        let log = MemoryLog::new();
        let mut reader = log.open_reader(spec("g")).await.unwrap();
        assert!(log.delete_topic("t.projects"));
        log.append("t.projects", LogRecord::new("p1", "x")).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), reader.next_record())
            .await
            .unwrap();
        assert_eq!(result, Err(LogError::Closed));
    }

    #[tokio::test]
    async fn test_reader_waits_for_append() {
        let log = MemoryLog::new();
        let mut reader = log.open_reader(spec("g")).await.unwrap();

        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer
                .append("t.projects", LogRecord::new("p1", "late"))
                .await
                .unwrap();
        });

        assert_eq!(next(&mut reader).await.value, b"late".to_vec());
    }

    #[tokio::test]
    async fn test_close_wakes_readers() {
        let log = MemoryLog::new();
        let mut reader = log.open_reader(spec("g")).await.unwrap();

        let closer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close().await.unwrap();
        });

        let result = tokio::time::timeout(Duration::from_secs(1), reader.next_record())
            .await
            .unwrap();
        assert_eq!(result, Err(LogError::Closed));
    }

    #[tokio::test]
    async fn test_injected_append_failures() {
        let log = MemoryLog::new();
        log.fail_next_appends(1);
        assert!(matches!(
            log.append("t.projects", LogRecord::new("p1", "x")).await,
            Err(LogError::Transport(_))
        ));
        log.append("t.projects", LogRecord::new("p1", "x")).await.unwrap();
        assert_eq!(log.append_count(), 2);
    }
}

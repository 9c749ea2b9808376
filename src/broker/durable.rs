//! Log-backed broker for multi-instance deployments.
//!
//! All instances write to one shared topic, keyed by resource id. Locally, the
//! broker keeps one consumption entry per subscribed resource:
//!
//! ```text
//! publish(p1, ev) ──► append(topic, key=p1) ──► shared log
//!                                                   │
//!            ┌──────────────────────────────────────┘
//!            ▼
//!   consumption loop (p1) ── key != p1 ─► skip
//!            │
//!            └─► SubscriberSet(p1) ─try_send─► mailbox 1..N
//! ```
//!
//! ## Rules
//! - Exactly one reader and loop per resource id per broker
//! - The entry is created on the first local subscribe and removed, with its
//!   loop cancelled, when the last local subscriber leaves
//! - A loop that ends on its own (reader closed) retires its entry, closing
//!   its subscribers' channels; the next subscribe opens a fresh reader
//! - Entries carry a generation; a loop only ever delivers into its own
//! - A write or a reader open that hits a missing topic provisions it and
//!   retries once
//! - `close` cancels every loop, waits for them, closes every channel and
//!   then the transport
//!
//! ## Consumer groups
//! Each broker instance gets its own id, and the group for a resource is
//! `<prefix>-project-<resource>-<instance>`. Every process subscribed to a
//! resource therefore sees every event for it, the same way local subscribers
//! do.

use super::{Broker, SubscriberSet, Subscription};
use crate::config::{BackendKind, BrokerConfig};
use crate::context::Context;
use crate::error::{BrokerError, LogError, Result};
use crate::log::{LogReader, LogRecord, LogTransport, ReaderSpec};
use crate::types::{SubscriptionId, UpdateEvent};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

/// Pause after a failed read before trying again.
const READ_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Settings for a [`DurableBroker`].
#[derive(Clone, Debug)]
pub struct DurableOptions {
    pub topic: String,
    pub group_prefix: String,
    pub instance_id: String,
    pub buffer_capacity: usize,
}

impl DurableOptions {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            topic: config.topic(),
            group_prefix: config.topic_prefix.clone(),
            instance_id: generate_instance_id(),
            buffer_capacity: config.buffer_capacity,
        }
    }

    /// Pin the instance id, e.g. to resume under a known group.
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn group_for(&self, resource_id: &str) -> String {
        format!(
            "{}-project-{}-{}",
            self.group_prefix, resource_id, self.instance_id
        )
    }
}

impl Default for DurableOptions {
    fn default() -> Self {
        Self::from_config(&BrokerConfig::default())
    }
}

fn generate_instance_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!(
        "{}-{:x}-{}",
        std::process::id(),
        nanos,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Local state for one subscribed resource.
struct Consumption {
    subscribers: SubscriberSet,
    /// Stops this resource's loop only.
    cancel: CancellationToken,
    generation: u64,
}

#[derive(Default)]
struct Entries {
    resources: HashMap<String, Consumption>,
    closed: bool,
}

struct Shared {
    log: Arc<dyn LogTransport>,
    options: DurableOptions,
    entries: RwLock<Entries>,
    next_id: AtomicU64,
    next_generation: AtomicU64,
    /// Parent of every loop's token.
    shutdown: CancellationToken,
    loops: TaskTracker,
}

impl Shared {
    async fn provision(&self) -> std::result::Result<(), LogError> {
        match self.log.create_topic(&self.options.topic).await {
            Ok(()) => {
                info!(topic = %self.options.topic, "created topic");
                Ok(())
            }
            Err(LogError::TopicExists(_)) => {
                debug!(topic = %self.options.topic, "topic already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn write(&self, resource_id: &str, record: LogRecord) -> Result<()> {
        let topic = &self.options.topic;
        match self.log.append(topic, record.clone()).await {
            Ok(()) => {
                trace!(topic = %topic, resource_id, "published");
                Ok(())
            }
            Err(LogError::UnknownTopic(_)) => {
                warn!(topic = %topic, resource_id, "topic missing, provisioning before retry");
                self.provision().await?;
                self.log.append(topic, record).await?;
                info!(topic = %topic, resource_id, "published after provisioning topic");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn open_reader(&self, cx: &Context, spec: ReaderSpec) -> Result<Box<dyn LogReader>> {
        match cx.run(self.log.open_reader(spec.clone())).await? {
            Err(LogError::UnknownTopic(_)) => {
                warn!(topic = %spec.topic, "topic missing, provisioning before opening reader");
                cx.run(self.provision()).await??;
                Ok(cx.run(self.log.open_reader(spec)).await??)
            }
            opened => Ok(opened?),
        }
    }

    /// Fan `event` out to the entry of `generation`, if it is still current.
    fn distribute(&self, resource_id: &str, generation: u64, event: &UpdateEvent) {
        let outcome = {
            let entries = self.entries.read();
            match entries.resources.get(resource_id) {
                Some(entry) if entry.generation == generation => entry.subscribers.fan_out(event),
                _ => return,
            }
        };
        if outcome.dropped > 0 {
            debug!(
                resource_id,
                dropped = outcome.dropped,
                "subscriber mailbox full, event dropped"
            );
        }
        if !outcome.disconnected.is_empty() {
            self.remove(resource_id, &outcome.disconnected);
        }
    }

    /// Remove subscribers; tear down the entry once it is empty.
    fn remove(&self, resource_id: &str, ids: &[SubscriptionId]) -> usize {
        let (removed, retired) = {
            let mut entries = self.entries.write();
            let Some(entry) = entries.resources.get_mut(resource_id) else {
                return 0;
            };
            let removed = ids.iter().filter(|id| entry.subscribers.remove(**id)).count();
            let retired = if entry.subscribers.is_empty() {
                entries.resources.remove(resource_id)
            } else {
                None
            };
            (removed, retired)
        };
        if let Some(entry) = retired {
            entry.cancel.cancel();
            info!(resource_id, "last local subscriber left, stopping reader");
        }
        removed
    }

    /// Drop the entry of `generation` after its loop ended on its own.
    /// Dropping it closes every subscriber's channel.
    fn retire(&self, resource_id: &str, generation: u64) {
        let retired = {
            let mut entries = self.entries.write();
            match entries.resources.entry(resource_id.to_string()) {
                Entry::Occupied(occupied) if occupied.get().generation == generation => {
                    Some(occupied.remove())
                }
                _ => None,
            }
        };
        if let Some(entry) = retired {
            entry.cancel.cancel();
            warn!(
                resource_id,
                subscribers = entry.subscribers.len(),
                "log reader ended, closing subscriptions"
            );
        }
    }
}

async fn consume(
    shared: Arc<Shared>,
    resource_id: String,
    mut reader: Box<dyn LogReader>,
    cancel: CancellationToken,
    generation: u64,
) {
    debug!(resource_id = %resource_id, generation, "consumption loop started");
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = reader.next_record() => next,
        };
        match next {
            Ok(record) => {
                if record.key != resource_id.as_bytes() {
                    continue;
                }
                match UpdateEvent::decode(&record.value) {
                    Ok(event) => shared.distribute(&resource_id, generation, &event),
                    Err(e) => warn!(resource_id = %resource_id, error = %e, "skipping undecodable record"),
                }
            }
            Err(LogError::Closed) => {
                debug!(resource_id = %resource_id, "log reader closed");
                break;
            }
            Err(e) => {
                warn!(resource_id = %resource_id, error = %e, "log read failed");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(READ_RETRY_DELAY) => {}
                }
            }
        }
    }
    if !cancel.is_cancelled() {
        shared.retire(&resource_id, generation);
    }
    reader.close().await;
    debug!(resource_id = %resource_id, generation, "consumption loop stopped");
}

/// Broker that distributes events through a shared log.
pub struct DurableBroker {
    shared: Arc<Shared>,
}

impl DurableBroker {
    /// Build a broker over `log` and try to provision its topic.
    ///
    /// Provisioning failure is logged, not returned; publishing provisions
    /// lazily when it meets a missing topic.
    pub async fn start(log: Arc<dyn LogTransport>, options: DurableOptions) -> Self {
        let shared = Arc::new(Shared {
            log,
            options,
            entries: RwLock::new(Entries::default()),
            next_id: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            loops: TaskTracker::new(),
        });

        if let Err(e) = shared.provision().await {
            warn!(
                topic = %shared.options.topic,
                error = %e,
                "could not create topic, will retry when publishing"
            );
        }
        info!(
            topic = %shared.options.topic,
            instance = %shared.options.instance_id,
            "durable broker started"
        );
        Self { shared }
    }

    pub fn options(&self) -> &DurableOptions {
        &self.shared.options
    }

    pub fn subscriber_count(&self, resource_id: &str) -> usize {
        self.shared
            .entries
            .read()
            .resources
            .get(resource_id)
            .map_or(0, |e| e.subscribers.len())
    }

    /// Resources with a live reader.
    pub fn active_readers(&self) -> usize {
        self.shared.entries.read().resources.len()
    }

    /// Consumption loops that have not exited yet, including cancelled ones
    /// still winding down.
    pub fn running_loops(&self) -> usize {
        self.shared.loops.len()
    }
}

#[async_trait]
impl Broker for DurableBroker {
    async fn publish(&self, cx: &Context, resource_id: &str, event: UpdateEvent) -> Result<()> {
        cx.check()?;
        if self.shared.entries.read().closed {
            return Err(BrokerError::Closed);
        }

        let record = LogRecord::new(resource_id.as_bytes(), event.encode()?);
        let write = cx.run(self.shared.write(resource_id, record));
        tokio::select! {
            biased;
            _ = self.shared.shutdown.cancelled() => Err(BrokerError::Closed),
            result = write => result?,
        }
    }

    async fn subscribe(&self, cx: &Context, resource_id: &str) -> Result<Subscription> {
        cx.check()?;
        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, subscription) =
            Subscription::channel(id, resource_id, self.shared.options.buffer_capacity);

        {
            let mut entries = self.shared.entries.write();
            if entries.closed {
                return Err(BrokerError::Closed);
            }
            if let Some(entry) = entries.resources.get_mut(resource_id) {
                entry.subscribers.insert(id, sender);
                debug!(
                    resource_id,
                    subscription = %id,
                    total = entry.subscribers.len(),
                    "added subscriber"
                );
                return Ok(subscription);
            }
        }

        // First local subscriber: open a reader without holding the lock.
        let spec = ReaderSpec {
            topic: self.shared.options.topic.clone(),
            key: resource_id.as_bytes().to_vec(),
            group: self.shared.options.group_for(resource_id),
        };
        let group = spec.group.clone();
        let reader = self.shared.open_reader(cx, spec).await?;

        let spare = {
            let mut entries = self.shared.entries.write();
            if entries.closed {
                Err(reader)
            } else {
                match entries.resources.entry(resource_id.to_string()) {
                    Entry::Occupied(mut occupied) => {
                        // Another subscriber won the race; join its entry.
                        occupied.get_mut().subscribers.insert(id, sender);
                        Ok(Some(reader))
                    }
                    Entry::Vacant(vacant) => {
                        let cancel = self.shared.shutdown.child_token();
                        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
                        let mut subscribers = SubscriberSet::new();
                        subscribers.insert(id, sender);
                        vacant.insert(Consumption {
                            subscribers,
                            cancel: cancel.clone(),
                            generation,
                        });
                        self.shared.loops.spawn(consume(
                            Arc::clone(&self.shared),
                            resource_id.to_string(),
                            reader,
                            cancel,
                            generation,
                        ));
                        Ok(None)
                    }
                }
            }
        };

        match spare {
            Ok(None) => {
                info!(resource_id, group = %group, "created log reader for resource");
                Ok(subscription)
            }
            Ok(Some(mut extra)) => {
                extra.close().await;
                Ok(subscription)
            }
            Err(mut unused) => {
                unused.close().await;
                Err(BrokerError::Closed)
            }
        }
    }

    async fn unsubscribe(
        &self,
        _cx: &Context,
        resource_id: &str,
        id: SubscriptionId,
    ) -> Result<()> {
        if self.shared.remove(resource_id, &[id]) > 0 {
            debug!(resource_id, subscription = %id, "removed subscriber");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let resources = {
            let mut entries = self.shared.entries.write();
            if entries.closed {
                return Ok(());
            }
            entries.closed = true;
            std::mem::take(&mut entries.resources)
        };

        self.shared.shutdown.cancel();
        let closed: usize = resources
            .into_values()
            .map(|entry| entry.subscribers.close())
            .sum();

        self.shared.loops.close();
        self.shared.loops.wait().await;

        self.shared.log.close().await?;
        info!(closed, topic = %self.shared.options.topic, "durable broker closed");
        Ok(())
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Durable
    }
}

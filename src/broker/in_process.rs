//! Single-process broker.

use super::{Broker, SubscriberSet, Subscription};
use crate::config::BackendKind;
use crate::context::Context;
use crate::error::{BrokerError, Result};
use crate::types::{SubscriptionId, UpdateEvent, DEFAULT_BUFFER_CAPACITY};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace};

#[derive(Default)]
struct Registry {
    /// Resource id -> subscribers. Empty sets are removed.
    resources: HashMap<String, SubscriberSet>,
    closed: bool,
}

/// Fans events out to subscriber channels held in memory.
///
/// Publishes take the read lock, membership changes take the write lock.
/// Nothing runs in the background.
pub struct InProcessBroker {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
    capacity: usize,
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    /// Broker whose subscriber mailboxes hold `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    pub fn subscriber_count(&self, resource_id: &str) -> usize {
        self.registry
            .read()
            .resources
            .get(resource_id)
            .map_or(0, SubscriberSet::len)
    }

    /// Number of resources with at least one subscriber.
    pub fn resource_count(&self) -> usize {
        self.registry.read().resources.len()
    }

    fn remove(&self, resource_id: &str, ids: &[SubscriptionId]) -> usize {
        let mut registry = self.registry.write();
        let Some(set) = registry.resources.get_mut(resource_id) else {
            return 0;
        };
        let removed = ids.iter().filter(|id| set.remove(**id)).count();
        if set.is_empty() {
            registry.resources.remove(resource_id);
        }
        removed
    }
}

impl Default for InProcessBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InProcessBroker {
    async fn publish(&self, cx: &Context, resource_id: &str, event: UpdateEvent) -> Result<()> {
        cx.check()?;

        let outcome = {
            let registry = self.registry.read();
            if registry.closed {
                return Err(BrokerError::Closed);
            }
            match registry.resources.get(resource_id) {
                Some(set) => set.fan_out(&event),
                None => {
                    trace!(resource_id, "no subscribers");
                    return Ok(());
                }
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
            let pruned = self.remove(resource_id, &outcome.disconnected);
            debug!(resource_id, pruned, "pruned subscribers whose receiver is gone");
        }
        Ok(())
    }

    async fn subscribe(&self, cx: &Context, resource_id: &str) -> Result<Subscription> {
        cx.check()?;

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, subscription) = Subscription::channel(id, resource_id, self.capacity);

        let mut registry = self.registry.write();
        if registry.closed {
            return Err(BrokerError::Closed);
        }
        let set = registry
            .resources
            .entry(resource_id.to_string())
            .or_default();
        set.insert(id, sender);
        debug!(
            resource_id,
            subscription = %id,
            total = set.len(),
            "added subscriber"
        );
        Ok(subscription)
    }

    async fn unsubscribe(
        &self,
        _cx: &Context,
        resource_id: &str,
        id: SubscriptionId,
    ) -> Result<()> {
        if self.remove(resource_id, &[id]) > 0 {
            debug!(resource_id, subscription = %id, "removed subscriber");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let resources = {
            let mut registry = self.registry.write();
            registry.closed = true;
            std::mem::take(&mut registry.resources)
        };
        let closed: usize = resources.into_values().map(SubscriberSet::close).sum();
        info!(closed, "in-process broker closed");
        Ok(())
    }

    fn backend(&self) -> BackendKind {
        BackendKind::InProcess
    }
}

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Where a session reads a resource's current state when asked to refresh it.
#[async_trait]
pub trait ResourceStates: Send + Sync {
    /// The resource's current changed count, or `None` if it is unknown.
    async fn changed_count(&self, resource_id: &str) -> Option<i64>;
}

/// Counts held in memory.
#[derive(Debug, Default)]
pub struct MemoryStates {
    counts: RwLock<HashMap<String, i64>>,
}

impl MemoryStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, resource_id: impl Into<String>, count: i64) {
        self.counts.write().insert(resource_id.into(), count);
    }

    /// Add one to the count, starting from zero. Returns the new count.
    pub fn increment(&self, resource_id: &str) -> i64 {
        let mut counts = self.counts.write();
        let count = counts.entry(resource_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn remove(&self, resource_id: &str) -> Option<i64> {
        self.counts.write().remove(resource_id)
    }

    pub fn get(&self, resource_id: &str) -> Option<i64> {
        self.counts.read().get(resource_id).copied()
    }
}

#[async_trait]
impl ResourceStates for MemoryStates {
    async fn changed_count(&self, resource_id: &str) -> Option<i64> {
        self.get(resource_id)
    }
}

//! Fire-and-forget publishing for services that mutate resources.

use super::Broker;
use crate::context::Context;
use crate::types::UpdateEvent;
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Publishes change events on behalf of a mutating service.
///
/// The mutation has already happened when a notification is sent, so a
/// failed publish is logged and swallowed.
#[derive(Clone)]
pub struct UpdateNotifier {
    broker: Arc<dyn Broker>,
    timeout: Duration,
}

impl UpdateNotifier {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            timeout: DEFAULT_NOTIFY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn notify(&self, resource_id: &str, changed_count: i64, message: impl Into<String>) {
        let event = UpdateEvent::new(resource_id, changed_count, message);
        let cx = Context::background().with_timeout(self.timeout);
        match self.broker.publish(&cx, resource_id, event).await {
            Ok(()) => trace!(resource_id, changed_count, "notified subscribers"),
            Err(e) => warn!(resource_id, error = %e, "failed to publish update"),
        }
    }

    /// An issue was added to a project that now holds `issue_count` issues.
    pub async fn issue_added(&self, project_id: &str, issue_id: &str, issue_count: i64) {
        self.notify(
            project_id,
            issue_count,
            format!("Issue {issue_id} added to project {project_id}"),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InProcessBroker;

    #[tokio::test]
    async fn test_issue_added_event() {
        let broker = Arc::new(InProcessBroker::new());
        let cx = Context::background();
        let mut sub = broker.subscribe(&cx, "p1").await.unwrap();

        let notifier = UpdateNotifier::new(broker.clone());
        notifier.issue_added("p1", "i1", 3).await;

        assert_eq!(
            sub.try_recv().unwrap(),
            UpdateEvent::new("p1", 3, "Issue i1 added to project p1")
        );
    }

    #[tokio::test]
    async fn test_failure_is_swallowed() {
        let broker = Arc::new(InProcessBroker::new());
        broker.close().await.unwrap();

        UpdateNotifier::new(broker).notify("p1", 1, "ignored").await;
    }
}

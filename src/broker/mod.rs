//! Publish/subscribe brokers for project updates.
//!
//! Every backend implements [`Broker`]:
//! - [`InProcessBroker`]: single-process fan-out, no background tasks
//! - [`DurableBroker`]: events travel through a shared append-only log and are
//!   fanned out locally by one consumption loop per subscribed resource
//!
//! Backends are built by [`factory::connect`] from a
//! [`BrokerConfig`](crate::config::BrokerConfig); nothing else constructs one
//! for production use.
//!
//! Delivery is best effort. Each subscription owns a bounded mailbox and a
//! publish never waits for a slow subscriber: when the mailbox is full the
//! event is dropped for that subscriber only. Per subscriber, events arrive in
//! publish order.
//!
//! # Example
//!
//! ```ignore
//! let broker = factory::connect(&BrokerConfig::in_process()).await?;
//! let cx = Context::background();
//!
//! let mut sub = broker.subscribe(&cx, "p1").await?;
//! broker.publish(&cx, "p1", UpdateEvent::new("p1", 3, "issue i1 added")).await?;
//!
//! while let Some(event) = sub.recv().await {
//!     println!("{event:?}");
//! }
//! ```

pub mod durable;
pub mod factory;
mod in_process;
mod notifier;
mod subscribers;

pub use durable::{DurableBroker, DurableOptions};
pub use in_process::InProcessBroker;
pub use notifier::UpdateNotifier;
pub use subscribers::{FanOut, SubscriberSet};

use crate::config::BackendKind;
use crate::context::Context;
use crate::error::Result;
use crate::types::{SubscriptionId, UpdateEvent};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Operations every backend provides.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Hand `event` to every current subscriber of `resource_id`.
    async fn publish(&self, cx: &Context, resource_id: &str, event: UpdateEvent) -> Result<()>;

    /// Register interest in `resource_id`.
    async fn subscribe(&self, cx: &Context, resource_id: &str) -> Result<Subscription>;

    /// Remove a subscription. Unknown or already removed ids are not an error.
    async fn unsubscribe(&self, cx: &Context, resource_id: &str, id: SubscriptionId)
        -> Result<()>;

    /// Release every backend resource and close every subscriber channel.
    async fn close(&self) -> Result<()>;

    fn backend(&self) -> BackendKind;
}

/// Receiving end of one subscription.
///
/// The channel closes once the backend drops its sender, which happens on
/// unsubscribe and on close.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    resource_id: String,
    receiver: mpsc::Receiver<UpdateEvent>,
}

impl Subscription {
    pub(crate) fn channel(
        id: SubscriptionId,
        resource_id: &str,
        capacity: usize,
    ) -> (mpsc::Sender<UpdateEvent>, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let subscription = Self {
            id,
            resource_id: resource_id.to_string(),
            receiver,
        };
        (sender, subscription)
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Next event, or `None` once the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<UpdateEvent> {
        self.receiver.recv().await
    }

    /// Next buffered event without waiting.
    pub fn try_recv(&mut self) -> std::result::Result<UpdateEvent, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<UpdateEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }
}

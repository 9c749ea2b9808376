//! Subscriber set for one resource.

use crate::types::{SubscriptionId, UpdateEvent};
use std::collections::BTreeMap;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Outcome of one fan-out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    /// Events dropped because a mailbox was full.
    pub dropped: usize,
    /// Subscribers whose receiver is gone.
    pub disconnected: Vec<SubscriptionId>,
}

/// Delivery channels registered for one resource.
///
/// Not synchronized; the owning backend guards it with its lock.
#[derive(Debug, Default)]
pub struct SubscriberSet {
    senders: BTreeMap<SubscriptionId, mpsc::Sender<UpdateEvent>>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: SubscriptionId, sender: mpsc::Sender<UpdateEvent>) {
        self.senders.insert(id, sender);
    }

    /// Drops the sender, which closes that subscriber's channel.
    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        self.senders.remove(&id).is_some()
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.senders.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Non-blocking send to every subscriber.
    pub fn fan_out(&self, event: &UpdateEvent) -> FanOut {
        let mut outcome = FanOut::default();
        for (id, sender) in &self.senders {
            match sender.try_send(event.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(TrySendError::Full(_)) => outcome.dropped += 1,
                Err(TrySendError::Closed(_)) => outcome.disconnected.push(*id),
            }
        }
        outcome
    }

    /// Close every channel. Returns how many were closed.
    pub fn close(self) -> usize {
        self.senders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Subscription;

    fn event(n: i64) -> UpdateEvent {
        UpdateEvent::new("p1", n, format!("event {n}"))
    }

    #[test]
    fn test_fan_out_reaches_all() {
        let mut set = SubscriberSet::new();
        let (tx1, mut sub1) = Subscription::channel(SubscriptionId(1), "p1", 4);
        let (tx2, mut sub2) = Subscription::channel(SubscriptionId(2), "p1", 4);
        set.insert(SubscriptionId(1), tx1);
        set.insert(SubscriptionId(2), tx2);

        let outcome = set.fan_out(&event(1));
        assert_eq!(outcome.delivered, 2);
        assert_eq!(sub1.try_recv().unwrap(), event(1));
        assert_eq!(sub2.try_recv().unwrap(), event(1));
    }

    #[test]
    fn test_full_mailbox_drops_for_that_subscriber_only() {
        let mut set = SubscriberSet::new();
        let (slow_tx, mut slow) = Subscription::channel(SubscriptionId(1), "p1", 1);
        let (fast_tx, mut fast) = Subscription::channel(SubscriptionId(2), "p1", 8);
        set.insert(SubscriptionId(1), slow_tx);
        set.insert(SubscriptionId(2), fast_tx);

        set.fan_out(&event(1));
        let outcome = set.fan_out(&event(2));
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.dropped, 1);

        assert_eq!(slow.drain(), vec![event(1)]);
        assert_eq!(fast.drain(), vec![event(1), event(2)]);
    }

    #[test]
    fn test_dropped_receiver_reported() {
        let mut set = SubscriberSet::new();
        let (tx, sub) = Subscription::channel(SubscriptionId(7), "p1", 4);
        set.insert(SubscriptionId(7), tx);
        drop(sub);

        let outcome = set.fan_out(&event(1));
        assert_eq!(outcome.disconnected, vec![SubscriptionId(7)]);
    }

    #[test]
    fn test_remove_closes_channel() {
        let mut set = SubscriberSet::new();
        let (tx, mut sub) = Subscription::channel(SubscriptionId(1), "p1", 4);
        set.insert(SubscriptionId(1), tx);

        assert!(set.remove(SubscriptionId(1)));
        assert!(!set.remove(SubscriptionId(1)));
        assert!(matches!(
            sub.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}

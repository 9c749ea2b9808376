//! Property tests for per-subscriber delivery order.

use proptest::prelude::*;
use updatecast::{Broker, Context, InProcessBroker, UpdateEvent};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    /// With room for every event, a subscriber sees exactly the publish sequence.
    #[test]
    fn prop_delivery_preserves_publish_order(counts in prop::collection::vec(any::<i64>(), 0..64)) {
        let received = runtime().block_on(async {
            let broker = InProcessBroker::with_capacity(64);
            let cx = Context::background();
            let mut sub = broker.subscribe(&cx, "p1").await.unwrap();
            for &count in &counts {
                broker.publish(&cx, "p1", UpdateEvent::new("p1", count, "")).await.unwrap();
            }
            sub.drain()
        });

        let observed: Vec<i64> = received.iter().map(|e| e.changed_count).collect();
        prop_assert_eq!(observed, counts);
    }

    /// An undrained mailbox keeps the oldest events, in order, and drops the rest.
    #[test]
    fn prop_full_mailbox_keeps_prefix(capacity in 1usize..16, published in 0usize..48) {
        let received = runtime().block_on(async {
            let broker = InProcessBroker::with_capacity(capacity);
            let cx = Context::background();
            let mut sub = broker.subscribe(&cx, "p1").await.unwrap();
            for n in 0..published {
                broker.publish(&cx, "p1", UpdateEvent::new("p1", n as i64, "")).await.unwrap();
            }
            sub.drain()
        });

        let observed: Vec<i64> = received.iter().map(|e| e.changed_count).collect();
        let expected: Vec<i64> = (0..published.min(capacity) as i64).collect();
        prop_assert_eq!(observed, expected);
    }

    /// Events for one resource never reach another resource's subscriber.
    #[test]
    fn prop_resources_are_isolated(targets in prop::collection::vec(0u8..3, 0..32)) {
        let (a, b) = runtime().block_on(async {
            let broker = InProcessBroker::with_capacity(64);
            let cx = Context::background();
            let mut a = broker.subscribe(&cx, "a").await.unwrap();
            let mut b = broker.subscribe(&cx, "b").await.unwrap();
            for (i, target) in targets.iter().enumerate() {
                let resource = ["a", "b", "c"][*target as usize];
                broker.publish(&cx, resource, UpdateEvent::new(resource, i as i64, "")).await.unwrap();
            }
            (a.drain(), b.drain())
        });

        prop_assert!(a.iter().all(|e| e.resource_id == "a"));
        prop_assert!(b.iter().all(|e| e.resource_id == "b"));
        prop_assert_eq!(a.len(), targets.iter().filter(|t| **t == 0).count());
        prop_assert_eq!(b.len(), targets.iter().filter(|t| **t == 1).count());
    }
}

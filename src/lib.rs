//! # updatecast
//!
//! Per-project update distribution. A service that changes a project
//! publishes an [`UpdateEvent`]; every client session subscribed to that
//! project receives it.
//!
//! ## Core Concepts
//!
//! - **Broker**: publish/subscribe keyed by resource id, either in-process or
//!   through a shared Kafka log so several server instances see each other's
//!   events
//! - **Subscription**: a bounded mailbox; a full mailbox drops events for that
//!   subscriber instead of slowing the publisher
//! - **Session**: one client connection driven by a [`StreamCoordinator`],
//!   holding at most one subscription at a time
//!
//! ## Example
//!
//! ```ignore
//! use updatecast::{broker, BrokerConfig, Context, UpdateEvent, UpdateNotifier};
//!
//! let broker = broker::factory::connect(&BrokerConfig::from_env()?).await?;
//! let cx = Context::background();
//!
//! let mut sub = broker.subscribe(&cx, "p1").await?;
//!
//! // Elsewhere, after a mutation:
//! UpdateNotifier::new(broker.clone()).issue_added("p1", "i1", 3).await;
//!
//! assert_eq!(sub.recv().await.unwrap().changed_count, 3);
//! ```

pub mod broker;
pub mod config;
pub mod context;
pub mod error;
pub mod log;
pub mod logging;
pub mod server;
pub mod session;
pub mod signals;
pub mod types;

// Re-exports
pub use broker::{Broker, DurableBroker, InProcessBroker, Subscription, UpdateNotifier};
pub use config::{BackendKind, BrokerConfig, ServerConfig};
pub use context::Context;
pub use error::{BrokerError, LogError, Result, SessionError};
pub use server::Server;
pub use session::{MemoryStates, ResourceStates, SessionSink, StreamCoordinator};
pub use types::{ControlMessage, SubscriptionId, UpdateEvent, DEFAULT_BUFFER_CAPACITY};

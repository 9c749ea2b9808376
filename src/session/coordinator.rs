//! Per-session subscription state machine.
//!
//! ```text
//!            subscribe(A)              subscribe(B)
//!   Idle ───────────────► Subscribed(A) ──────────► Subscribed(B)
//!    │                          │       (A released first)
//!    └──────────┬───────────────┘
//!               ▼   cancel / stream end / send failure / channel closed
//!             Closed
//! ```
//!
//! The coordinator owns at most one subscription. Whatever ends the session,
//! that subscription is released exactly once.

use super::{ResourceStates, SessionSink};
use crate::broker::{Broker, Subscription};
use crate::context::Context;
use crate::error::SessionError;
use crate::types::{Action, ControlMessage, UpdateEvent};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

enum SessionState {
    Idle,
    Subscribed(Subscription),
    Closed,
}

impl SessionState {
    fn resource_id(&self) -> Option<&str> {
        match self {
            SessionState::Subscribed(sub) => Some(sub.resource_id()),
            _ => None,
        }
    }
}

/// One wake-up of the session loop.
enum Step {
    Cancelled,
    Control(Option<Result<ControlMessage, SessionError>>),
    Event(Option<UpdateEvent>),
}

/// Relays broker events to one client and applies its control messages.
#[derive(Clone)]
pub struct StreamCoordinator {
    broker: Arc<dyn Broker>,
    states: Arc<dyn ResourceStates>,
    publish_timeout: Duration,
}

impl StreamCoordinator {
    pub fn new(broker: Arc<dyn Broker>, states: Arc<dyn ResourceStates>) -> Self {
        Self {
            broker,
            states,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    /// Bound for publishes and releases the session performs itself.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Run a session until it ends.
    ///
    /// Returns `Ok` when the client closes its stream, the subscription
    /// channel closes, or `cx` is cancelled. Returns the error when the
    /// control stream fails, a send to the client fails, or subscribing fails.
    pub async fn run<S, K>(
        &self,
        cx: &Context,
        mut incoming: S,
        sink: &mut K,
    ) -> Result<(), SessionError>
    where
        S: Stream<Item = Result<ControlMessage, SessionError>> + Send + Unpin,
        K: SessionSink + ?Sized,
    {
        let mut state = SessionState::Idle;
        let result = self.drive(cx, &mut incoming, sink, &mut state).await;
        self.teardown(&mut state, SessionState::Closed).await;
        match &result {
            Ok(()) => debug!("session ended"),
            Err(e) => info!(error = %e, "session ended with error"),
        }
        result
    }

    async fn drive<S, K>(
        &self,
        cx: &Context,
        incoming: &mut S,
        sink: &mut K,
        state: &mut SessionState,
    ) -> Result<(), SessionError>
    where
        S: Stream<Item = Result<ControlMessage, SessionError>> + Send + Unpin,
        K: SessionSink + ?Sized,
    {
        loop {
            let step = match state {
                SessionState::Subscribed(sub) => tokio::select! {
                    biased;
                    _ = cx.done() => Step::Cancelled,
                    message = incoming.next() => Step::Control(message),
                    event = sub.recv() => Step::Event(event),
                },
                _ => tokio::select! {
                    biased;
                    _ = cx.done() => Step::Cancelled,
                    message = incoming.next() => Step::Control(message),
                },
            };

            match step {
                Step::Cancelled => {
                    debug!("session cancelled");
                    return Ok(());
                }
                Step::Control(None) => {
                    debug!("client closed control stream");
                    return Ok(());
                }
                Step::Control(Some(Err(e))) => {
                    warn!(error = %e, "control stream failed");
                    return Err(e);
                }
                Step::Control(Some(Ok(message))) => self.apply(cx, message, state).await?,
                Step::Event(Some(event)) => {
                    let sent = tokio::select! {
                        biased;
                        _ = cx.done() => {
                            debug!("session cancelled while sending to client");
                            return Ok(());
                        }
                        sent = sink.send(event) => sent,
                    };
                    if let Err(e) = sent {
                        warn!(
                            resource_id = state.resource_id().unwrap_or_default(),
                            error = %e,
                            "failed to send update to client"
                        );
                        return Err(e);
                    }
                }
                Step::Event(None) => {
                    debug!(
                        resource_id = state.resource_id().unwrap_or_default(),
                        "subscription channel closed"
                    );
                    return Ok(());
                }
            }
        }
    }

    async fn apply(
        &self,
        cx: &Context,
        message: ControlMessage,
        state: &mut SessionState,
    ) -> Result<(), SessionError> {
        match message.action() {
            Some(Action::Subscribe) => self.subscribe(cx, message.resource_id, state).await,
            Some(Action::Update) => {
                self.refresh(cx, &message.resource_id, state).await;
                Ok(())
            }
            None => {
                debug!(
                    resource_id = %message.resource_id,
                    action = %message.action,
                    "ignoring unknown action"
                );
                Ok(())
            }
        }
    }

    async fn subscribe(
        &self,
        cx: &Context,
        resource_id: String,
        state: &mut SessionState,
    ) -> Result<(), SessionError> {
        if state.resource_id() == Some(resource_id.as_str()) {
            debug!(resource_id = %resource_id, "already subscribed");
            return Ok(());
        }
        self.teardown(state, SessionState::Idle).await;

        match self.broker.subscribe(cx, &resource_id).await {
            Ok(sub) => {
                info!(
                    resource_id = %resource_id,
                    subscription = %sub.id(),
                    backend = self.broker.backend().as_str(),
                    "client subscribed"
                );
                *state = SessionState::Subscribed(sub);
                Ok(())
            }
            // The loop sees the cancellation next and ends cleanly.
            Err(_) if cx.is_done() => {
                *state = SessionState::Idle;
                Ok(())
            }
            Err(e) => {
                warn!(resource_id = %resource_id, error = %e, "failed to subscribe");
                *state = SessionState::Idle;
                Err(e.into())
            }
        }
    }

    /// Publish the resource's current state to its subscribers.
    async fn refresh(&self, cx: &Context, resource_id: &str, state: &SessionState) {
        if state.resource_id() != Some(resource_id) {
            debug!(resource_id, "ignoring update for a resource not subscribed to");
            return;
        }
        let Some(changed_count) = self.states.changed_count(resource_id).await else {
            debug!(resource_id, "no state for resource, skipping update");
            return;
        };

        let event = UpdateEvent::new(
            resource_id,
            changed_count,
            format!("Project {resource_id} updated"),
        );
        let cx = cx.with_timeout(self.publish_timeout);
        if let Err(e) = self.broker.publish(&cx, resource_id, event).await {
            warn!(resource_id, error = %e, "failed to publish update");
        }
    }

    /// Release the current subscription, if any, and move to `next`. Runs
    /// outside the session's context so that it still happens after
    /// cancellation. `Closed` is terminal.
    async fn teardown(&self, state: &mut SessionState, next: SessionState) {
        let next = match state {
            SessionState::Closed => SessionState::Closed,
            _ => next,
        };
        let SessionState::Subscribed(sub) = std::mem::replace(state, next) else {
            return;
        };

        let cx = Context::background().with_timeout(self.publish_timeout);
        match self.broker.unsubscribe(&cx, sub.resource_id(), sub.id()).await {
            Ok(()) => debug!(
                resource_id = sub.resource_id(),
                subscription = %sub.id(),
                "released subscription"
            ),
            Err(e) => warn!(
                resource_id = sub.resource_id(),
                error = %e,
                "failed to release subscription"
            ),
        }
    }
}

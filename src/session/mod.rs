//! Client sessions.
//!
//! A session is one client connection: a stream of [`ControlMessage`]s in, a
//! [`SessionSink`] of [`UpdateEvent`]s out. The [`StreamCoordinator`] drives
//! it against a broker.
//!
//! [`ControlMessage`]: crate::types::ControlMessage

mod coordinator;
pub mod lines;
mod states;

pub use coordinator::StreamCoordinator;
pub use states::{MemoryStates, ResourceStates};

use crate::error::SessionError;
use crate::types::UpdateEvent;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Outgoing half of a session.
#[async_trait]
pub trait SessionSink: Send {
    /// Deliver one event to the client. An error ends the session.
    async fn send(&mut self, event: UpdateEvent) -> Result<(), SessionError>;
}

#[async_trait]
impl SessionSink for mpsc::Sender<UpdateEvent> {
    async fn send(&mut self, event: UpdateEvent) -> Result<(), SessionError> {
        mpsc::Sender::send(self, event)
            .await
            .map_err(|_| SessionError::Disconnected)
    }
}

//! TCP front end: one coordinator per connection.

use crate::context::Context;
use crate::session::{lines, StreamCoordinator};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Server {
    coordinator: Arc<StreamCoordinator>,
}

impl Server {
    pub fn new(coordinator: StreamCoordinator) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
        }
    }

    /// Accept connections until `shutdown` finishes, then cancel every
    /// session and wait for all of them to release their subscriptions.
    pub async fn serve(&self, listener: TcpListener, shutdown: Context) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "accepting sessions");

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.done() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_session(&mut sessions, &shutdown, stream, peer),
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    log_join(joined);
                }
            }
        }

        info!(active = sessions.len(), "stopping sessions");
        while let Some(joined) = sessions.join_next().await {
            log_join(joined);
        }
        info!("all sessions stopped");
        Ok(())
    }

    fn spawn_session(
        &self,
        sessions: &mut JoinSet<()>,
        shutdown: &Context,
        stream: TcpStream,
        peer: SocketAddr,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "could not disable nagle");
        }
        let coordinator = Arc::clone(&self.coordinator);
        let cx = shutdown.child();
        let span = info_span!("session", %peer);

        sessions.spawn(
            async move {
                debug!("session started");
                let (incoming, mut sink) = lines::split(stream);
                // The coordinator logs how the session ended.
                let _ = coordinator.run(&cx, incoming, &mut sink).await;
            }
            .instrument(span),
        );
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "session task panicked");
        }
    }
}

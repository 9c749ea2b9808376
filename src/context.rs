//! Cancellable operation context.
//!
//! Every broker operation takes a [`Context`]. A context finishes when its token
//! is cancelled (explicitly, or through a cancelled parent) or when its deadline
//! passes. Children inherit both.

use crate::error::{BrokerError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Done {
    Cancelled,
    DeadlineExceeded,
}

impl From<Done> for BrokerError {
    fn from(done: Done) -> Self {
        match done {
            Done::Cancelled => BrokerError::Cancelled,
            Done::DeadlineExceeded => BrokerError::DeadlineExceeded,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A root context with no deadline.
    pub fn background() -> Self {
        Self::from_token(CancellationToken::new())
    }

    /// A root context driven by an existing token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// A child that is cancelled with this context but can be cancelled alone.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// A child whose deadline is the earlier of the parent's and `now + timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(match self.deadline {
                Some(parent) if parent < deadline => parent,
                _ => deadline,
            }),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fails fast when the context is already finished.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(BrokerError::Cancelled)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Err(BrokerError::DeadlineExceeded)
        } else {
            Ok(())
        }
    }

    /// Resolves once the context finishes.
    pub async fn done(&self) -> Done {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => Done::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Done::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                Done::Cancelled
            }
        }
    }

    /// Runs `fut` until it completes or the context finishes, whichever is first.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output>
    where
        F: Future,
    {
        self.check()?;
        tokio::select! {
            biased;
            done = self.done() => Err(done.into()),
            out = fut => Ok(out),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes() {
        let cx = Context::background();
        assert_eq!(cx.run(async { 7 }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_cancelled_parent_cancels_child() {
        let parent = Context::background();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_done());
        assert!(matches!(
            child.run(std::future::pending::<()>()).await,
            Err(BrokerError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent() {
        let parent = Context::background();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_done());
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let cx = Context::background().with_timeout(Duration::from_millis(20));
        let result = cx.run(std::future::pending::<()>()).await;
        assert!(matches!(result, Err(BrokerError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_timeout_keeps_earlier_parent_deadline() {
        let parent = Context::background().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }
}

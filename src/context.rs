use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Cancelled {
    #[error("The operation was cancelled.")]
    Cancelled,
    #[error("The operation exceeded its deadline.")]
    DeadlineExceeded,
}

/// Cancellation and deadline for one unit of work. Children share the
/// parent's cancellation, so cancelling the root cancels every child.
#[derive(Clone, Debug, Default)]
pub struct Context {
    token:    CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A child bounded by `timeout` from now, or by the parent's deadline if
    /// that is earlier.
    pub(crate) fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now().checked_add(timeout);
        Self {
            token:    self.token.child_token(),
            deadline: match (self.deadline, deadline) {
                (Some(parent), Some(child)) => Some(parent.min(child)),
                (parent, child) => parent.or(child),
            },
        }
    }

    pub(crate) const fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fails once the context is cancelled or past its deadline.
    pub(crate) fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Cancelled::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Drives `future` until it completes, the context is cancelled or the
    /// deadline passes. The future is dropped in the latter two cases.
    pub(crate) async fn run<F: Future>(&self, future: F) -> Result<F::Output, Cancelled> {
        self.check()?;
        let bounded = async {
            match self.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, future)
                    .await
                    .map_err(|_| Cancelled::DeadlineExceeded),
                None => Ok(future.await),
            }
        };
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(Cancelled::Cancelled),
            output = bounded => output,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use crate::context::{Cancelled, Context};

    #[test]
    fn cancellation_is_shared() {
        let root = Context::new();
        let child = root.with_timeout(Duration::from_secs(60));
        assert_eq!(child.check(), Ok(()));
        root.cancel();
        assert_eq!(child.check(), Err(Cancelled::Cancelled));
        assert!(child.token().is_cancelled());
    }

    #[tokio::test]
    async fn deadline() {
        let ctx = Context::new().with_timeout(Duration::ZERO);
        assert_eq!(ctx.check(), Err(Cancelled::DeadlineExceeded));

        let ctx = Context::new().with_timeout(Duration::from_millis(20));
        let slow = ctx.run(tokio::time::sleep(Duration::from_secs(10))).await;
        assert_eq!(slow, Err(Cancelled::DeadlineExceeded));

        // The earlier deadline of the parent wins.
        let nested = Context::new().with_timeout(Duration::from_millis(20)).with_timeout(Duration::from_secs(3600));
        assert_eq!(nested.run(tokio::time::sleep(Duration::from_secs(10))).await, Err(Cancelled::DeadlineExceeded));

        assert_eq!(Context::new().run(async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn cancel_interrupts_running_work() {
        let root = Context::new();
        let child = root.with_timeout(Duration::from_secs(60));
        let canceller = root.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        assert_eq!(child.run(tokio::time::sleep(Duration::from_secs(10))).await, Err(Cancelled::Cancelled));
    }
}

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a scoped operation was cut short.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
    #[error("deadline exceeded")]
    TimedOut,
    #[error("cancelled")]
    Cancelled,
}

/// A bounded time budget nested inside a parent budget.
///
/// A child scope's deadline is clamped to its parent's, so a child can never
/// outlive the parent's remaining budget. Cancelling a scope cancels every
/// scope derived from it.
#[derive(Clone, Debug)]
pub struct DeadlineScope {
    cancel: CancellationToken,
    deadline: Instant,
}

impl DeadlineScope {
    pub fn new(budget: Duration) -> Self {
        Self::with_token(CancellationToken::new(), budget)
    }

    /// Root scope bound to an externally owned cancellation token.
    pub fn with_token(cancel: CancellationToken, budget: Duration) -> Self {
        Self {
            cancel,
            deadline: Instant::now() + budget,
        }
    }

    /// Derive a child scope. Its deadline is the earlier of `now + budget`
    /// and this scope's own deadline.
    pub fn child(&self, budget: Duration) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: (Instant::now() + budget).min(self.deadline),
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cheap pre-flight check, used before starting a step.
    pub fn check(&self) -> Result<(), ScopeError> {
        if self.cancel.is_cancelled() {
            return Err(ScopeError::Cancelled);
        }
        if self.is_expired() {
            return Err(ScopeError::TimedOut);
        }
        Ok(())
    }

    /// Run a future bounded by this scope's deadline and cancellation.
    pub async fn bound<F, T>(&self, fut: F) -> Result<T, ScopeError>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ScopeError::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(ScopeError::TimedOut),
            out = fut => Ok(out),
        }
    }
}

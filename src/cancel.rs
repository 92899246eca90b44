//! Cooperative cancellation for retry invocations.
//!
//! A `CancellationToken` is shared between the task running a retry loop and
//! whoever may want to stop it. The inter-attempt wait awaits
//! [`CancellationToken::cancelled`] alongside the backoff sleep, so a cancel
//! request wakes the waiter immediately instead of being noticed on the next poll.

use std::sync::Arc;
use tokio::sync::watch;

/// A cancellation token for cooperative cancellation of async operations.
///
/// Clones share state: cancelling any clone is observed by all of them.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    state: Arc<watch::Sender<bool>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// Create a new, not-yet-cancelled token.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            state: Arc::new(sender),
        }
    }

    /// Request cancellation and wake every waiter.
    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut receiver = self.state.subscribe();
        // The sender lives as long as `self`, so this only returns once the flag flips.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_token_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_clone_shares_state() {
        let token1 = CancellationToken::new();
        let token2 = token1.clone();

        token1.cancel();

        assert!(token1.is_cancelled());
        assert!(token2.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = token.clone();

        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("already cancelled");
    }
}

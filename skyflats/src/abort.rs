//! Cooperative abort
//!
//! An [`AbortToken`] is shared between the flat fielder and whoever may want
//! to stop it. Aborting never interrupts code directly: it is observed at
//! wait points, which then return [`WaitOutcome::Cancelled`] early.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// How a wait ended
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome<T> {
    /// The awaited operation finished
    Completed(T),
    /// The time limit passed first (for plain sleeps: the full duration elapsed)
    TimedOut,
    /// The token was aborted first
    Cancelled,
}

impl<T> WaitOutcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WaitOutcome::Cancelled)
    }
}

#[derive(Debug, Default)]
struct Inner {
    aborted: AtomicBool,
    notify: Notify,
}

/// Shared abort flag with wake-up of pending waits
#[derive(Debug, Clone, Default)]
pub struct AbortToken {
    inner: Arc<Inner>,
}

impl AbortToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Clear the flag so the token can be used for another run
    pub fn clear(&self) {
        self.inner.aborted.store(false, Ordering::SeqCst);
    }

    /// Resolves once the token is aborted
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register before checking the flag, otherwise a concurrent abort() is missed
            notified.as_mut().enable();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `duration` unless aborted earlier
    pub async fn sleep(&self, duration: Duration) -> WaitOutcome<()> {
        if self.is_aborted() {
            return WaitOutcome::Cancelled;
        }
        tokio::select! {
            _ = self.cancelled() => WaitOutcome::Cancelled,
            _ = tokio::time::sleep(duration) => WaitOutcome::TimedOut,
        }
    }

    /// Await `operation`, giving up on abort or after the optional `timeout`
    pub async fn wait_for<F, T>(&self, operation: F, timeout: Option<Duration>) -> WaitOutcome<T>
    where
        F: Future<Output = T>,
    {
        if self.is_aborted() {
            return WaitOutcome::Cancelled;
        }
        let limit = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancelled() => WaitOutcome::Cancelled,
            value = operation => WaitOutcome::Completed(value),
            _ = limit => WaitOutcome::TimedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_runs_full_duration() {
        let token = AbortToken::new();
        let start = tokio::time::Instant::now();
        assert_eq!(token.sleep(Duration::from_secs(10)).await, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_returns_early_on_abort() {
        let token = AbortToken::new();
        let remote = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            remote.abort();
        });

        let start = tokio::time::Instant::now();
        assert_eq!(token.sleep(Duration::from_secs(10)).await, WaitOutcome::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_already_aborted_token() {
        let token = AbortToken::new();
        token.abort();
        assert!(token.sleep(Duration::from_secs(3600)).await.is_cancelled());
        assert!(token.wait_for(async { 1 }, None).await.is_cancelled());

        token.clear();
        assert!(!token.is_aborted());
        assert_eq!(token.wait_for(async { 1 }, None).await, WaitOutcome::Completed(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_timeout() {
        let token = AbortToken::new();
        let outcome = token
            .wait_for(tokio::time::sleep(Duration::from_secs(60)), Some(Duration::from_secs(5)))
            .await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }
}

//! Cancellation tokens for execution attempts and intent batches.
//!
//! Cancellation is **cooperative**. Revoking a token never stops a future by
//! itself; it only makes operations that were explicitly raced against the
//! token resolve early with [`Cancelled`]:
//!
//! ```ignore
//! let response = ctx.token().race(client.fetch(page)).await?;
//! ```
//!
//! Anything not wrapped keeps running to completion, and the engine simply
//! ignores its result once the owning token is revoked.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error returned by operations raced against a revoked token.
///
/// The engine recognises it (also when wrapped in `anyhow::Error`). When the
/// attempt's own token is revoked the attempt is simply dropped. Returned from
/// a live attempt it is an ordinary failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

type Callback = Box<dyn FnOnce() + Send>;

/// A revocable signal owned by one execution attempt (or one intent batch).
///
/// Clones observe the same signal.
#[derive(Clone)]
pub struct CancelToken {
    inner: CancellationToken,
    callbacks: Arc<Mutex<Vec<Callback>>>,
}

impl CancelToken {
    /// Create a live token.
    pub fn new() -> Self {
        Self {
            inner: CancellationToken::new(),
            callbacks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Whether the token has been revoked.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Revoke the token. Idempotent.
    ///
    /// Registered callbacks run once, on the calling thread.
    pub fn cancel(&self) {
        self.inner.cancel();
        let callbacks = std::mem::take(
            &mut *self
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for callback in callbacks {
            callback();
        }
    }

    /// Run `callback` when the token is revoked.
    ///
    /// If the token is already revoked the callback runs immediately.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut callbacks = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.inner.is_cancelled() {
            drop(callbacks);
            callback();
            return;
        }
        callbacks.push(Box::new(callback));
    }

    /// Whether both handles observe the same signal.
    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.callbacks, &other.callbacks)
    }

    /// Completes once the token is revoked.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }

    /// Race `fut` against the token.
    ///
    /// Resolves with `Err(Cancelled)` as soon as the token is revoked (or
    /// immediately if it already is). `fut` is dropped in that case.
    pub async fn race<F>(&self, fut: F) -> Result<F::Output, Cancelled>
    where
        F: Future,
    {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.inner.cancelled() => Err(Cancelled),
            output = fut => Ok(output),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_ptr_eq_distinguishes_tokens() {
        let token = CancelToken::new();
        assert!(token.ptr_eq(&token.clone()));
        assert!(!token.ptr_eq(&CancelToken::new()));
    }

    #[test]
    fn test_on_cancel_runs_once() {
        let token = CancelToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        token.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel();
        token.cancel();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_cancel_after_revocation_runs_immediately() {
        let token = CancelToken::new();
        token.cancel();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        token.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_race_resolves_when_not_cancelled() {
        let token = CancelToken::new();
        let result = token.race(async { 7 }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_race_on_revoked_token_fails_fast() {
        let token = CancelToken::new();
        token.cancel();
        let result = token.race(std::future::pending::<()>()).await;
        assert_eq!(result, Err(Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_rejects_when_revoked_mid_flight() {
        let token = CancelToken::new();
        let revoker = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            revoker.cancel();
        });

        let result = token
            .race(tokio::time::sleep(Duration::from_secs(60)))
            .await;

        assert_eq!(result, Err(Cancelled));
    }

    #[test]
    fn test_cancelled_survives_anyhow() {
        let err: anyhow::Error = Cancelled.into();
        assert!(err.is::<Cancelled>());
    }
}

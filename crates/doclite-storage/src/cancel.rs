//! Cooperative cancellation.
//!
//! A [`CancelToken`] is polled at documented suspension points: operation
//! entry, before each statement, between result batches, and during retry
//! backoff. The driver is synchronous, so a statement already running is
//! never interrupted; the operation observes the cancellation at its next
//! checkpoint.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use doclite_core::error::{DbError, Result};

#[derive(Debug, Default)]
struct State {
    cancelled: bool,
    reason: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

/// A cloneable cancellation handle shared between the caller and the
/// operations it wants to be able to abort.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Creates a fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the token, waking any backoff sleep immediately.
    pub fn cancel(&self) {
        self.do_cancel(None);
    }

    /// Cancels with a reason that surfaces in [`DbError::Aborted`].
    pub fn cancel_with_reason(&self, reason: impl Into<String>) {
        self.do_cancel(Some(reason.into()));
    }

    fn do_cancel(&self, reason: Option<String>) {
        let mut state = self.lock();
        if !state.cancelled {
            state.cancelled = true;
            state.reason = reason;
        }
        drop(state);
        self.inner.cond.notify_all();
    }

    /// Returns `true` once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// The reason supplied at cancellation, if any.
    pub fn reason(&self) -> Option<String> {
        self.lock().reason.clone()
    }

    /// Fails with [`DbError::Aborted`] once cancelled.
    pub fn checkpoint(&self) -> Result<()> {
        let state = self.lock();
        if state.cancelled {
            Err(DbError::aborted(state.reason.clone()))
        } else {
            Ok(())
        }
    }

    /// Sleeps up to `timeout`, returning early on cancellation. Returns
    /// `Some(error)` when the sleep was preempted.
    pub(crate) fn sleep(&self, timeout: Duration) -> Option<DbError> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.cancelled {
                return Some(DbError::aborted(state.reason.clone()));
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _) = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // The state is a flag and a string; poisoning cannot corrupt it.
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Checks an optional token at a suspension point.
pub(crate) fn checkpoint(signal: Option<&CancelToken>) -> Result<()> {
    match signal {
        Some(token) => token.checkpoint(),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn fresh_token_passes_checkpoints() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.checkpoint().is_ok());
    }

    #[test]
    fn cancel_trips_checkpoint_with_reason() {
        let token = CancelToken::new();
        token.cancel_with_reason("caller gave up");
        let err = token.checkpoint().unwrap_err();
        match err {
            DbError::Aborted { reason } => assert_eq!(reason.as_deref(), Some("caller gave up")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn first_cancellation_wins() {
        let token = CancelToken::new();
        token.cancel_with_reason("first");
        token.cancel_with_reason("second");
        assert_eq!(token.reason().as_deref(), Some("first"));
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn sleep_returns_none_when_undisturbed() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn cancellation_preempts_sleep() {
        let token = CancelToken::new();
        let clone = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            clone.cancel_with_reason("stop");
        });
        let start = Instant::now();
        let err = token.sleep(Duration::from_secs(10));
        handle.join().unwrap();
        assert!(err.is_some());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}

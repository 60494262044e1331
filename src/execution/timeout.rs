//! Query Timeout Module
//!
//! Deadline tracking and cooperative cancellation for gateway calls.
//!
//! ## Design
//!
//! Uses a combination of:
//! - A fixed deadline shared by every step of one `execute` call (slot wait,
//!   engine call, aggregation fallback), so the budget is never reset
//! - An atomic flag plus a notifier for cooperative cancellation
//!
//! Engines can poll [`CancelHandle::is_cancelled`] between units of work or
//! race their I/O against [`CancelHandle::cancelled`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::MAX_TIMEOUT_SECS;

/// Timeout error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Query exceeded timeout of {timeout:?} (ran for {elapsed:?})")]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub timeout: Duration,
    /// How long the query actually ran
    pub elapsed: Duration,
}

/// Query timeout controller
///
/// Owns the deadline of one gateway call and the cancellation signal handed
/// to the engine. Clones share the cancellation state.
#[derive(Clone)]
pub struct QueryTimeout {
    cancel: CancelHandle,

    /// When the query started
    start_time: Instant,

    /// Maximum allowed duration
    timeout_duration: Duration,
}

impl QueryTimeout {
    /// Create a new timeout controller with the specified duration
    ///
    /// Durations above [`MAX_TIMEOUT_SECS`] are capped so the deadline
    /// always fits in an `Instant`.
    pub fn new(timeout: Duration) -> Self {
        QueryTimeout {
            cancel: CancelHandle::new(),
            start_time: Instant::now(),
            timeout_duration: timeout.min(Duration::from_secs(MAX_TIMEOUT_SECS)),
        }
    }

    /// The error reported for this call at the current instant
    pub fn error(&self) -> TimeoutError {
        TimeoutError {
            timeout: self.timeout_duration,
            elapsed: self.start_time.elapsed(),
        }
    }

    /// Cancel the query explicitly
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Get the elapsed time since the query started
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Get the remaining time before timeout
    pub fn remaining(&self) -> Duration {
        self.timeout_duration.saturating_sub(self.start_time.elapsed())
    }

    /// Instant at which the budget runs out
    pub fn deadline(&self) -> Instant {
        self.start_time + self.timeout_duration
    }

    /// Get a handle that can be used to cancel from another task
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

/// Handle for cancelling a query from another task
#[derive(Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelState>,
}

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the associated query
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_explicit_cancellation() {
        let timeout = QueryTimeout::new(Duration::from_secs(10));
        let handle = timeout.cancel_handle();
        assert!(!handle.is_cancelled());

        timeout.cancel();
        assert!(handle.is_cancelled());
        assert!(timeout.remaining() > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_oversized_timeout_is_capped() {
        let timeout = QueryTimeout::new(Duration::MAX);
        let cap = Duration::from_secs(MAX_TIMEOUT_SECS);
        assert!(timeout.remaining() <= cap);
        assert!(timeout.deadline() > Instant::now());
        assert_eq!(timeout.error().timeout, cap);
    }

    #[tokio::test]
    async fn test_cancel_handle() {
        let timeout = QueryTimeout::new(Duration::from_secs(10));
        let handle = timeout.cancel_handle();

        // Cancel from handle
        handle.cancel();

        // Every handle of the controller should reflect cancellation
        assert!(timeout.cancel_handle().is_cancelled());
        assert!(handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_exceeded() {
        let timeout = QueryTimeout::new(Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(timeout.remaining(), Duration::ZERO);
        assert!(timeout.deadline() <= Instant::now());
        let err = timeout.error();
        assert!(err.elapsed >= Duration::from_millis(50));
        assert_eq!(err.timeout, Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_time() {
        let timeout = QueryTimeout::new(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(timeout.remaining(), Duration::from_secs(6));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(timeout.remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let handle = CancelHandle::new();
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });

        tokio::task::yield_now().await;
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_after_cancel_returns_immediately() {
        let handle = CancelHandle::new();
        handle.cancel();
        tokio::time::timeout(Duration::from_millis(100), handle.cancelled())
            .await
            .unwrap();
    }

    #[test]
    fn test_cancel_handle_from_another_thread() {
        let handle = CancelHandle::new();
        let remote = handle.clone();
        std::thread::spawn(move || remote.cancel()).join().unwrap();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_timeout_error_display() {
        let err = TimeoutError {
            timeout: Duration::from_secs(5),
            elapsed: Duration::from_secs(6),
        };
        let msg = err.to_string();
        assert!(msg.contains('5'));
        assert!(msg.contains('6'));
    }
}

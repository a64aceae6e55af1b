//! Retry policy shared by every remote-shell operation.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{FleetError, Result};
use crate::readiness::sleep_or_cancel;

/// How an error should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Give up immediately.
    Terminal,
    /// Back off and try again.
    Transient,
}

/// Default classifier: see [`FleetError::is_transient`].
#[must_use]
pub fn classify(err: &FleetError) -> ErrorClass {
    if err.is_transient() {
        ErrorClass::Transient
    } else {
        ErrorClass::Terminal
    }
}

/// Exponential backoff parameters plus an error classifier.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub classify: fn(&FleetError) -> ErrorClass,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 1.5, Duration::from_secs(10))
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
            classify,
        }
    }

    /// Replace the error classifier.
    #[must_use]
    pub fn with_classifier(mut self, classify: fn(&FleetError) -> ErrorClass) -> Self {
        self.classify = classify;
        self
    }

    /// Delay before retry number `attempt` (zero-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Run `f` until it succeeds, fails terminally, or `cancel` fires.
    ///
    /// Cancellation is checked between attempts, never in the middle of one.
    ///
    /// # Errors
    /// Returns the first terminal error, or [`FleetError::Cancelled`].
    pub async fn retry<T, F, Fut>(&self, cancel: &CancellationToken, label: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(FleetError::Cancelled);
            }
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if (self.classify)(&e) == ErrorClass::Terminal => return Err(e),
                Err(e) => {
                    let delay = self.delay(attempt);
                    warn!(
                        operation = label,
                        attempt = attempt + 1,
                        "{e}. Retrying in {delay:?}..."
                    );
                    sleep_or_cancel(delay, cancel).await?;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use tokio::time::Instant;

    use super::*;

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_millis(1500));
        assert_eq!(policy.delay(2), Duration::from_millis(2250));
        assert_eq!(policy.delay(10), Duration::from_secs(10));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let cancel = CancellationToken::new();

        let err = RetryPolicy::default()
            .retry::<(), _, _>(&cancel, "exec", || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(FleetError::Authentication("publickey denied".into())) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::Authentication(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_back_off() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let value = RetryPolicy::default()
            .retry(&cancel, "exec", || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(FleetError::Transport("connection refused".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(start.elapsed(), Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_classifier() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::default().with_classifier(|_| ErrorClass::Terminal);

        let err = policy
            .retry::<(), _, _>(&cancel, "exec", || async {
                Err(FleetError::Transport("unreachable".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::Transport(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = RetryPolicy::default()
            .retry::<(), _, _>(&cancel, "exec", || async {
                Err(FleetError::Transport("unreachable".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::Cancelled));
    }
}

//! Backoff for transport failures only.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::ProgressError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `backoff_step` (0 before the second attempt).
    pub fn delay(&self, backoff_step: u32) -> Duration {
        let factor = 2u32.saturating_pow(backoff_step);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut call: F,
) -> Result<T, ProgressError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProgressError>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay(attempt - 1);
                warn!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying after transport failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{InvitationError, StoreError};
    use crate::models::{FacultyCode, Phase};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(200));
        assert_eq!(policy.delay(1), Duration::from_millis(400));
        assert_eq!(policy.delay(10), Duration::from_secs(5));
        assert_eq!(policy.delay(40), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn transport_failures_are_retried_until_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ProgressError> = with_retry(&fast_policy(), "fetch", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProgressError::Store(StoreError::from(sqlx::Error::PoolTimedOut))) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn recovers_when_a_later_attempt_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(), "fetch", || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(ProgressError::Store(StoreError::from(sqlx::Error::PoolClosed)))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn invariant_violations_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ProgressError> = with_retry(&fast_policy(), "respond", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ProgressError::Invitation(InvitationError::AlreadyResponded {
                    faculty: FacultyCode::from("F01"),
                    phase: Phase::Project,
                }))
            }
        })
        .await;

        assert!(matches!(result, Err(ProgressError::Invitation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

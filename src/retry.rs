//! Bounded retry with exponential backoff and jitter.
//!
//! Every remote call (list, fetch, embed, publish) goes through
//! [`retry_call`]: each attempt runs under a per-call timeout, retryable
//! errors are retried up to `max_attempts`, a server-suggested
//! `retry_after` (capped at `max_delay`) replaces the computed backoff, and
//! the cancellation flag is checked before every attempt and while waiting.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::warn;

use corpus_sync_core::cancel::CancellationFlag;
use corpus_sync_core::error::SyncError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Randomize each delay within `[delay / 2, delay]`.
    pub jitter: bool,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter && !delay.is_zero() {
            let half = delay / 2;
            let spread = (delay - half).as_millis() as u64;
            half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
        } else {
            delay
        }
    }

    /// Wait before retrying after `err`. A server-suggested delay wins over
    /// the backoff but never exceeds `max_delay`.
    pub fn delay_after(&self, err: &SyncError, attempt: u32) -> Duration {
        match err.retry_after() {
            Some(suggested) => suggested.min(self.max_delay),
            None => self.delay_for_attempt(attempt),
        }
    }
}

const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Sleep for `delay`, waking early with `Cancelled` once `cancel` is set.
async fn sleep_unless_cancelled(delay: Duration, cancel: &CancellationFlag) -> Result<(), SyncError> {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Ok(());
        }
        tokio::time::sleep((deadline - now).min(CANCEL_POLL)).await;
    }
}

/// Run `call` under `policy`.
///
/// Returns the first success, the first non-retryable error, or the last
/// error once attempts run out. [`SyncError::Cancelled`] when `cancel` is
/// set before an attempt.
pub async fn retry_call<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    cancel: &CancellationFlag,
    mut call: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        attempt += 1;

        let started = Instant::now();
        let result = match tokio::time::timeout(policy.call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout {
                operation: operation.to_string(),
                elapsed: started.elapsed(),
            }),
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_retryable() || attempt >= max_attempts {
            return Err(err);
        }

        let delay = policy.delay_after(&err, attempt);
        warn!(
            operation,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying"
        );
        sleep_unless_cancelled(delay, cancel).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
            call_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter: false,
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(10),
            jitter: true,
            ..Default::default()
        };
        for _ in 0..50 {
            let d = policy.delay_for_attempt(1);
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(400));
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = retry_call(&fast(5), "op", &CancellationFlag::new(), move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SyncError::RateLimited {
                    retry_after: Some(Duration::from_millis(1)),
                })
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = retry_call(&fast(3), "op", &CancellationFlag::new(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::EmbeddingService("503".into()))
        })
        .await;
        assert!(matches!(result, Err(SyncError::EmbeddingService(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = retry_call(&fast(5), "op", &CancellationFlag::new(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::Rejected("400".into()))
        })
        .await;
        assert!(matches!(result, Err(SyncError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let mut policy = fast(2);
        policy.call_timeout = Duration::from_millis(10);
        let result = retry_call(&policy, "slow", &CancellationFlag::new(), move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok("done")
        })
        .await;
        assert_eq!(result, Ok("done"));
    }

    #[test]
    fn test_server_delay_is_capped() {
        let policy = fast(3);
        let throttled = SyncError::RateLimited {
            retry_after: Some(Duration::from_secs(86_400)),
        };
        assert_eq!(policy.delay_after(&throttled, 1), Duration::from_millis(5));
        let short = SyncError::RateLimited {
            retry_after: Some(Duration::from_millis(2)),
        };
        assert_eq!(policy.delay_after(&short, 1), Duration::from_millis(2));
    }

    #[tokio::test]
    async fn test_long_retry_after_does_not_stall() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = fast(2);
        let cancel = CancellationFlag::new();
        let run = retry_call(&policy, "op", &cancel, move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(SyncError::RateLimited {
                    retry_after: Some(Duration::from_secs(86_400)),
                })
            } else {
                Ok(1)
            }
        });
        let result = tokio::time::timeout(Duration::from_secs(5), run).await;
        assert_eq!(result, Ok(Ok(1)));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationFlag::new();
        let mut policy = fast(2);
        policy.base_delay = Duration::from_secs(60);
        policy.max_delay = Duration::from_secs(60);
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let run = retry_call(&policy, "op", &cancel, || async {
            Err::<(), _>(SyncError::EmbeddingService("503".into()))
        });
        let result = tokio::time::timeout(Duration::from_secs(5), run).await;
        assert_eq!(result, Ok(Err(SyncError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancelled_before_attempt() {
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let result: Result<(), _> = retry_call(&fast(3), "op", &cancel, || async { Ok(()) }).await;
        assert_eq!(result, Err(SyncError::Cancelled));
    }
}

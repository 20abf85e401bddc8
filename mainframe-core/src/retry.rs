use std::{future::Future, time::Duration};

use rand::Rng;
use tracing::debug;

use crate::{
    config::RetryConfig,
    error::{CoreError, Result},
    store::{StoreError, StoreResult},
};

/// Runs `op` until it stops reporting [`StoreError::Conflict`], sleeping with
/// jittered exponential backoff in between.
///
/// Other store errors are returned immediately. When every attempt conflicted
/// the caller gets [`CoreError::StoreConflictExhausted`].
pub async fn with_conflict_retry<T, F, Fut>(
    policy: &RetryConfig,
    operation: &'static str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u16 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(StoreError::Conflict(reason)) => {
                if attempt >= max_attempts {
                    return Err(CoreError::StoreConflictExhausted {
                        operation,
                        attempts: attempt,
                    });
                }
                let delay = jittered(policy, attempt);
                debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "store conflict, retrying: {reason}"
                );
                tokio::time::sleep(delay).await;
            }
            Err(other) => return Err(other.into()),
        }
    }
}

fn jittered(policy: &RetryConfig, attempt: u16) -> Duration {
    let anchor = policy.base_delay(attempt).as_millis() as f64;
    if anchor == 0.0 {
        return Duration::ZERO;
    }

    let span = anchor * f64::from(policy.jitter_ratio.max(0.0));
    let lower = (anchor - span).max(0.0);
    let upper = (anchor + span).min(policy.backoff_max_ms as f64);
    if upper <= lower {
        return Duration::from_millis(lower.round() as u64);
    }

    let unit: f64 = rand::rng().random_range(0.0..1.0);
    Duration::from_millis((lower + (upper - lower) * unit).round() as u64)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU16, Ordering};

    use super::*;

    fn fast_policy(max_attempts: u16) -> RetryConfig {
        RetryConfig {
            max_attempts,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
            jitter_ratio: 0.5,
        }
    }

    #[tokio::test]
    async fn conflicts_are_retried_until_success() {
        let calls = AtomicU16::new(0);
        let calls = &calls;
        let value = with_conflict_retry(&fast_policy(5), "test", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::Conflict("serialization".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_conflicts_surface_as_transient() {
        let err = with_conflict_retry(&fast_policy(3), "claim", || async {
            Err::<(), _>(StoreError::Conflict("deadlock".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            CoreError::StoreConflictExhausted {
                operation: "claim",
                attempts: 3
            }
        ));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn non_conflict_errors_are_not_retried() {
        let calls = AtomicU16::new(0);
        let calls = &calls;
        let err = with_conflict_retry(&fast_policy(5), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(StoreError::Unavailable("down".into()))
        })
        .await
        .unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn jitter_stays_within_cap() {
        let policy = RetryConfig {
            max_attempts: 10,
            backoff_base_ms: 100,
            backoff_max_ms: 400,
            jitter_ratio: 0.5,
        };
        for attempt in 1..10 {
            assert!(jittered(&policy, attempt) <= Duration::from_millis(400));
        }
    }
}

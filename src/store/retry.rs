//! Retry with exponential backoff for non-critical storage calls
//! (heartbeats, liveness bookkeeping).

use crate::config::BackoffConfig;
use crate::error::{StoreError, StoreResult};
use std::future::Future;
use tracing::warn;

/// Retry `op` while it fails with [`StoreError::Unavailable`].
/// Deterministic errors (not found, invalid transition) return immediately.
pub async fn retry_with_backoff<T, F, Fut>(
    backoff: &BackoffConfig,
    operation: &str,
    mut op: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(StoreError::Unavailable(reason)) if attempt < backoff.max_attempts => {
                let delay = backoff.delay_for_attempt(attempt);
                warn!(
                    operation = operation,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Storage unavailable, retrying"
                );
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
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast_backoff(), "heartbeat", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::Unavailable("down".into()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = retry_with_backoff(&fast_backoff(), "heartbeat", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable("down".into()))
        })
        .await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_not_found() {
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = retry_with_backoff(&fast_backoff(), "heartbeat", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::not_found("agent", "x"))
        })
        .await;

        assert!(matches!(result, Err(StoreError::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

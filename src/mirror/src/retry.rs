//! Retry with exponential backoff for registry transfers.

use std::future::Future;

use d8_mirror_core::config::RetryConfig;
use d8_mirror_core::error::{MirrorError, Result};
use tokio_util::sync::CancellationToken;

/// Run `f` until it succeeds, fails permanently, or attempts run out.
///
/// Only transient errors are retried. Both the attempt and the backoff sleep
/// abort with [`MirrorError::Cancelled`] when `cancel` fires.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(MirrorError::Cancelled);
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(MirrorError::Cancelled),
            result = f() => result,
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) if attempt >= max_attempts => {
                tracing::warn!(
                    operation,
                    attempts = attempt,
                    error = %err,
                    "Operation failed after maximum retries"
                );
                return Err(err);
            }
            Err(err) => {
                let delay = config.delay_for(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(MirrorError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    fn unavailable() -> MirrorError {
        MirrorError::RegistryUnavailable {
            reference: "r".into(),
            message: "503".into(),
        }
    }

    #[tokio::test]
    async fn test_retry_success_after_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = retry_with_backoff(&fast(), &CancellationToken::new(), "test", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(unavailable())
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> =
            retry_with_backoff(&fast(), &CancellationToken::new(), "test", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(unavailable()) }
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> =
            retry_with_backoff(&fast(), &CancellationToken::new(), "test", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(MirrorError::Unauthorized {
                        reference: "r".into(),
                        message: "401".into(),
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(MirrorError::Unauthorized { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = retry_with_backoff(&fast(), &cancel, "test", || async { Ok(1) }).await;
        assert!(matches!(result, Err(MirrorError::Cancelled)));
    }
}

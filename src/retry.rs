//! Exponential retry for one-shot operations (token request, store connect).
//!
//! Page requests do not go through here; throttled pages are handled by the
//! fetcher's own wait-and-reissue loop.

use crate::config::RetryConfig;
use crate::error::Result;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::warn;

/// Create exponential backoff from config.
pub fn create_backoff(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(config.initial_backoff())
        .with_max_interval(config.max_backoff())
        .with_multiplier(config.multiplier)
        .with_randomization_factor(if config.jitter { 0.5 } else { 0.0 })
        .with_max_elapsed_time(Some(Duration::from_secs(300)))
        .build()
}

/// Run `op`, retrying retryable errors up to `config.max_retries` times.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = AtomicU32::new(0);
    let max_retries = config.max_retries;

    backoff::future::retry(create_backoff(config), || {
        let attempt = attempts.fetch_add(1, Ordering::Relaxed);
        let fut = op();
        async move {
            fut.await.map_err(|e| {
                if e.is_retryable() && attempt < max_retries {
                    warn!(
                        attempt = attempt + 1,
                        code = e.code(),
                        "{} failed, retrying: {}",
                        what,
                        e
                    );
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(), "op", || {
            let n = calls.fetch_add(1, Ordering::Relaxed);
            async move {
                if n == 0 {
                    Err(Error::auth("unavailable", Some(503)))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        tokio_test::assert_ok!(&result);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast(), "op", || {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(Error::auth("bad secret", Some(401))) }
        })
        .await;
        tokio_test::assert_err!(&result);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast(), "op", || {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(Error::auth("unavailable", Some(503))) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }
}

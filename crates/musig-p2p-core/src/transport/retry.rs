use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::{Error, Result};

/// Run a transport operation, retrying network failures with exponential
/// backoff. Any other error is returned immediately.
pub async fn with_retry<T, F, Fut>(
    operation: &str,
    attempts: u32,
    base_delay: Duration,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut delay = base_delay;

    for attempt in 1..=attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(Error::Network(reason)) if attempt < attempts => {
                warn!(
                    operation,
                    attempt,
                    attempts,
                    %reason,
                    "transport call failed, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::Network(format!(
        "{} failed after {} attempts",
        operation, attempts
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retries_network_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry("publish", 3, Duration::from_millis(100), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Network("offline".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_last_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry("publish", 2, Duration::from_millis(10), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Network("offline".into()))
        })
        .await;

        assert!(matches!(result, Err(Error::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_network_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry("publish", 5, Duration::from_millis(10), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Serialization("bad".into()))
        })
        .await;

        assert!(matches!(result, Err(Error::Serialization(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

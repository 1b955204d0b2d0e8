/*!
Bounded exponential backoff for external calls.

Generic failures back off from 1s doubling to a 10s cap; rate-limited
(429) failures from 2s doubling to a 30s cap. Five attempts total, then
the last error propagates.
*/

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};

pub const MAX_ATTEMPTS: u32 = 5;

const GENERIC_BASE_SECS: u64 = 1;
const GENERIC_CAP_SECS: u64 = 10;
const RATE_LIMIT_BASE_SECS: u64 = 2;
const RATE_LIMIT_CAP_SECS: u64 = 30;

/// Delay before retry number `attempt` (0-based count of prior failures).
pub fn delay_for(attempt: u32, rate_limited: bool) -> Duration {
    let (base, cap) = if rate_limited {
        (RATE_LIMIT_BASE_SECS, RATE_LIMIT_CAP_SECS)
    } else {
        (GENERIC_BASE_SECS, GENERIC_CAP_SECS)
    };
    let exp = base.saturating_mul(1u64 << attempt.min(16));
    Duration::from_secs(exp.min(cap))
}

fn is_rate_limited(err: &Error) -> bool {
    match err {
        Error::Http(e) => e.status().map(|s| s.as_u16() == 429).unwrap_or(false),
        Error::RetryableUpstream(msg) | Error::QuotaExceeded(msg) => msg.contains("429"),
        _ => false,
    }
}

/// Run `op` up to [`MAX_ATTEMPTS`] times. Non-retryable errors propagate
/// immediately; retryable ones sleep per the backoff schedule.
pub async fn with_backoff<T, F, Fut>(label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() || attempt + 1 >= MAX_ATTEMPTS {
                    return Err(err);
                }
                let delay = delay_for(attempt, is_rate_limited(&err));
                warn!(
                    %label,
                    attempt = attempt + 1,
                    delay_secs = delay.as_secs(),
                    error = %err,
                    "retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn generic_schedule_doubles_and_caps() {
        assert_eq!(delay_for(0, false), Duration::from_secs(1));
        assert_eq!(delay_for(1, false), Duration::from_secs(2));
        assert_eq!(delay_for(2, false), Duration::from_secs(4));
        assert_eq!(delay_for(3, false), Duration::from_secs(8));
        assert_eq!(delay_for(4, false), Duration::from_secs(10));
        assert_eq!(delay_for(10, false), Duration::from_secs(10));
    }

    #[test]
    fn rate_limit_schedule_doubles_and_caps() {
        assert_eq!(delay_for(0, true), Duration::from_secs(2));
        assert_eq!(delay_for(1, true), Duration::from_secs(4));
        assert_eq!(delay_for(3, true), Duration::from_secs(16));
        assert_eq!(delay_for(4, true), Duration::from_secs(30));
        assert_eq!(delay_for(9, true), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_backoff("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::UpstreamEmpty("empty".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_errors_are_bounded() {
        tokio::time::pause();
        let calls = std::sync::Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let handle = tokio::spawn(async move {
            with_backoff::<(), _, _>("test", move || {
                calls2.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::RetryableUpstream("503".to_string())) }
            })
            .await
        });
        // Drive the paused clock past every scheduled delay.
        for _ in 0..8 {
            tokio::time::advance(Duration::from_secs(30)).await;
            tokio::task::yield_now().await;
        }
        let result = handle.await.unwrap();
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn success_after_transient_failure() {
        tokio::time::pause();
        let calls = std::sync::Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let handle = tokio::spawn(async move {
            with_backoff("test", move || {
                let n = calls2.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Error::RetryableUpstream("timeout".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
        });
        tokio::time::advance(Duration::from_secs(2)).await;
        let result = handle.await.unwrap();
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

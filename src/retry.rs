//! Shared retry/backoff helper for I/O-bound processors (HTTP, LoRaWAN
//! downlinks) and the MQTT connection manager's reconnect loop.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Linear or exponential backoff, depending on which fields are read.
/// HTTP processors use a flat `retry_delay` per spec §4.5; the MQTT
/// manager computes `delay(n) = min(retry_delay * backoff^(n-1),
/// max_retry_delay)` directly rather than through this struct, since its
/// backoff is exponential-by-definition and occurs between *connection*
/// attempts rather than per-operation.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl RetryConfig {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }
}

/// Classifies whether a failure is worth retrying. HTTP/LoRaWAN
/// processors use this to distinguish a timeout or transport hiccup
/// (retryable) from a validation failure or unexpected exception (not).
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Run `operation` up to `config.max_attempts` times with a flat delay
/// between attempts, short-circuiting as soon as `operation` returns a
/// non-retryable error. Returns the final error if every attempt fails.
pub async fn retry_with_delay<F, Fut, T, E>(
    config: &RetryConfig,
    label: &str,
    mut operation: F,
) -> Result<(T, usize), E>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut last_err = None;
    for attempt in 1..=config.max_attempts {
        match operation(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(err) => {
                let retryable = err.is_retryable();
                if attempt == config.max_attempts || !retryable {
                    warn!(label, attempt, error = %err, retryable, "giving up after failed attempt");
                    return Err(err);
                }
                debug!(label, attempt, error = %err, "attempt failed, retrying");
                last_err = Some(err);
                if !config.delay.is_zero() {
                    sleep(config.delay).await;
                }
            }
        }
    }
    // Unreachable because max_attempts >= 1 always returns above, but
    // kept for exhaustiveness without unwrapping an Option in a hot path.
    Err(last_err.expect("loop always runs at least once"))
}

/// `delay(n) = min(base * backoff^(n-1), max_delay)`, the MQTT manager's
/// exponential reconnect schedule (spec §4.6, scenario 6).
pub fn exponential_backoff_delay(attempt: u32, base: Duration, backoff: f64, max_delay: Duration) -> Duration {
    let secs = base.as_secs_f64() * backoff.powi(attempt as i32 - 1);
    Duration::from_secs_f64(secs.min(max_delay.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_clamps_to_max() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(10);
        let delays: Vec<u64> = (1..=5)
            .map(|n| exponential_backoff_delay(n, base, 2.0, max).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10]);
    }

    #[derive(Debug)]
    struct Failure(bool);
    impl std::fmt::Display for Failure {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "failure")
        }
    }
    impl Retryable for Failure {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let config = RetryConfig::new(3, Duration::from_millis(0));
        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let (value, used) = retry_with_delay(&config, "test", |_| {
            let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if n < 1 {
                    Err(Failure(true))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(used, 2);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let config = RetryConfig::new(5, Duration::from_millis(0));
        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let result: Result<(i32, usize), Failure> = retry_with_delay(&config, "test", |_| {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(Failure(false)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_all_attempts_on_persistent_retryable_failure() {
        let config = RetryConfig::new(3, Duration::from_millis(0));
        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let result: Result<(i32, usize), Failure> = retry_with_delay(&config, "test", |_| {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(Failure(true)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}

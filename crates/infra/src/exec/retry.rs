//! Retry executor with exponential backoff.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use erpbridge_core::ConnectorError;

use super::rate_limit::RateLimiter;

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first one (0 = no retries).
    pub max_retries: u32,
    /// Sleep before the first retry.
    pub initial_delay: Duration,
    /// Factor applied to the delay after each retry.
    pub backoff_multiplier: f64,
    /// Optional cap on any single sleep.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: None,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, initial_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_retries,
            initial_delay,
            backoff_multiplier,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Sleep before retry number `retry` (1-indexed): `initial_delay * multiplier^(retry-1)`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = self.backoff_multiplier.max(0.0).powi(retry as i32 - 1);
        let nanos = (self.initial_delay.as_nanos() as f64 * factor).round();
        let delay = if nanos.is_finite() && nanos < u64::MAX as f64 {
            Duration::from_nanos(nanos as u64)
        } else {
            Duration::from_nanos(u64::MAX)
        };
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Total attempts the policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Run `operation` until it succeeds, fails terminally, or the policy is exhausted.
///
/// - A permit is taken from `limiter` (when given) before every attempt.
/// - Errors for which [`ConnectorError::is_retryable`] is false abort immediately.
/// - A rate-limit cooldown longer than the backoff delay replaces it.
/// - After `max_retries` failed retries the last error is returned.
pub async fn execute_with_retry<T, F, Fut>(
    mut operation: F,
    label: &str,
    policy: &RetryPolicy,
    limiter: Option<&RateLimiter>,
) -> Result<T, ConnectorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ConnectorError>>,
{
    let mut retry: u32 = 0;
    loop {
        if let Some(limiter) = limiter {
            limiter.acquire(1).await?;
        }

        match operation().await {
            Ok(value) => {
                if retry > 0 {
                    info!(operation = label, retries = retry, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !err.is_retryable() => {
                debug!(operation = label, error = %err, "non-retryable failure");
                return Err(err);
            }
            Err(err) if retry >= policy.max_retries => {
                warn!(
                    operation = label,
                    attempts = retry + 1,
                    error = %err,
                    "operation failed after exhausting retries"
                );
                return Err(err);
            }
            Err(err) => {
                retry += 1;
                let mut delay = policy.delay_for_retry(retry);
                if let Some(cooldown) = err.retry_after() {
                    delay = delay.max(cooldown);
                }
                warn!(
                    operation = label,
                    retry,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "operation failed; backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), 2.0);

        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_retry(4), Duration::from_millis(800));
    }

    #[test]
    fn max_delay_caps_backoff() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), 10.0)
            .with_max_delay(Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn permanently_failing_operation_is_attempted_max_retries_plus_one() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(50), 3.0);
        let attempts = Arc::new(Mutex::new(Vec::<Instant>::new()));

        let seen = attempts.clone();
        let result: Result<(), _> = execute_with_retry(
            || {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(Instant::now());
                    Err(ConnectorError::connection("down"))
                }
            },
            "test",
            &policy,
            None,
        )
        .await;

        assert_eq!(result, Err(ConnectorError::connection("down")));
        let attempts = attempts.lock().unwrap();
        assert_eq!(attempts.len(), 4);
        for k in 1..attempts.len() {
            assert_eq!(attempts[k] - attempts[k - 1], policy.delay_for_retry(k as u32));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_short_circuits_after_one_attempt() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(10), 2.0);
        let calls = Arc::new(Mutex::new(0u32));

        let counter = calls.clone();
        let result: Result<(), _> = execute_with_retry(
            || {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    Err(ConnectorError::http(401, "expired token"))
                }
            },
            "test",
            &policy,
            None,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_from_transient_failures() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(10), 2.0);
        let calls = Arc::new(Mutex::new(0u32));

        let counter = calls.clone();
        let value = execute_with_retry(
            || {
                let counter = counter.clone();
                async move {
                    let mut n = counter.lock().unwrap();
                    *n += 1;
                    if *n < 3 {
                        Err(ConnectorError::connection("flaky"))
                    } else {
                        Ok(*n)
                    }
                }
            },
            "test",
            &policy,
            None,
        )
        .await
        .unwrap();

        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_cooldown_overrides_shorter_backoff() {
        let policy = RetryPolicy::exponential(1, Duration::from_millis(10), 2.0);
        let started = Instant::now();
        let calls = Arc::new(Mutex::new(0u32));

        let counter = calls.clone();
        let _ = execute_with_retry(
            || {
                let counter = counter.clone();
                async move {
                    let mut n = counter.lock().unwrap();
                    *n += 1;
                    if *n == 1 {
                        Err(ConnectorError::RateLimited {
                            retry_after: Some(Duration::from_secs(2)),
                        })
                    } else {
                        Ok(())
                    }
                }
            },
            "test",
            &policy,
            None,
        )
        .await;

        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 64,
                ..ProptestConfig::default()
            })]

            /// Property: attempts = n + 1 and the k-th sleep is d0 * m^(k-1).
            #[test]
            fn retry_schedule_follows_policy(
                max_retries in 0u32..5,
                initial_ms in 1u64..200,
                multiplier in 1u32..4,
            ) {
                let policy = RetryPolicy::exponential(
                    max_retries,
                    Duration::from_millis(initial_ms),
                    multiplier as f64,
                );
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .start_paused(true)
                    .build()
                    .unwrap();

                let attempts = rt.block_on(async {
                    let attempts = Arc::new(Mutex::new(Vec::<Instant>::new()));
                    let seen = attempts.clone();
                    let _: Result<(), _> = execute_with_retry(
                        || {
                            let seen = seen.clone();
                            async move {
                                seen.lock().unwrap().push(Instant::now());
                                Err(ConnectorError::connection("down"))
                            }
                        },
                        "prop",
                        &policy,
                        None,
                    )
                    .await;
                    let out = attempts.lock().unwrap().clone();
                    out
                });

                prop_assert_eq!(attempts.len() as u32, max_retries + 1);
                for k in 1..attempts.len() {
                    let expected = Duration::from_millis(initial_ms * (multiplier as u64).pow(k as u32 - 1));
                    prop_assert_eq!(attempts[k] - attempts[k - 1], expected);
                }
            }
        }
    }
}

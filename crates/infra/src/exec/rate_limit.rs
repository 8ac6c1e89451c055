//! Sliding-window rate limiter.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use erpbridge_core::ConnectorError;

/// Sliding-window limiter allowing `max_requests` permits per `window`.
///
/// Issued permits are timestamps guarded by an async mutex, so concurrent
/// `acquire`/`release` calls never race. A permit counts against the window until
/// it ages out or is handed back with [`RateLimiter::release`].
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    issued: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: (max_requests as usize).max(1),
            window,
            issued: Mutex::new(VecDeque::new()),
        }
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Wait for a single permit.
    pub async fn check_limit(&self) -> Result<(), ConnectorError> {
        self.acquire(1).await
    }

    /// Wait until `n` permits fit in the window, then take them.
    pub async fn acquire(&self, n: u32) -> Result<(), ConnectorError> {
        let n = n as usize;
        if n > self.max_requests {
            return Err(ConnectorError::validation(format!(
                "requested {n} permits but the window only allows {}",
                self.max_requests
            )));
        }
        if n == 0 {
            return Ok(());
        }

        loop {
            let wait = {
                let mut issued = self.issued.lock().await;
                let now = Instant::now();
                self.prune(&mut issued, now);

                if issued.len() + n <= self.max_requests {
                    issued.extend(std::iter::repeat_n(now, n));
                    return Ok(());
                }

                // The permit whose expiry frees enough room for `n` more.
                let blocking = issued.len() + n - self.max_requests - 1;
                (issued[blocking] + self.window).saturating_duration_since(now)
            };

            debug!(wait_ms = wait.as_millis() as u64, permits = n, "rate limit reached; waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Hand back the `n` most recently issued permits.
    ///
    /// For requests that never reached the remote system. Failed requests keep
    /// their permits so retries cannot burst past the limit.
    pub async fn release(&self, n: u32) {
        let mut issued = self.issued.lock().await;
        for _ in 0..n {
            if issued.pop_back().is_none() {
                break;
            }
        }
    }

    /// Permits that could be taken right now without waiting.
    pub async fn available(&self) -> usize {
        let mut issued = self.issued.lock().await;
        self.prune(&mut issued, Instant::now());
        self.max_requests - issued.len()
    }

    fn prune(&self, issued: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = issued.front() {
            if now.duration_since(*oldest) >= self.window {
                issued.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn waits_for_window_when_exhausted() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        let start = Instant::now();

        limiter.acquire(1).await.unwrap();
        limiter.acquire(1).await.unwrap();
        assert_eq!(limiter.available().await, 0);

        limiter.acquire(1).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn release_returns_capacity_early() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let start = Instant::now();

        limiter.acquire(1).await.unwrap();
        limiter.release(1).await;
        limiter.acquire(1).await.unwrap();

        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn oversized_request_is_rejected() {
        let limiter = RateLimiter::new(3, Duration::from_secs(1));
        assert!(limiter.acquire(4).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquires_never_exceed_limit() {
        let limiter = Arc::new(RateLimiter::new(5, Duration::from_secs(1)));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire(1).await.unwrap();
                Instant::now()
            }));
        }

        let mut immediate = 0;
        for h in handles {
            if h.await.unwrap() == start {
                immediate += 1;
            }
        }
        assert_eq!(immediate, 5);
    }
}

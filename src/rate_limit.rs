use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::util::lock_unpoisoned;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateLimitPolicy {
    requests_per_second: f64,
    burst: usize,
}

impl RateLimitPolicy {
    /// 500 requests per second with a burst of one.
    pub const fn standard() -> Self {
        Self {
            requests_per_second: 500.0,
            burst: 1,
        }
    }

    pub fn requests_per_second(mut self, requests_per_second: f64) -> Self {
        self.requests_per_second = if requests_per_second.is_finite() && requests_per_second > 0.0 {
            requests_per_second
        } else {
            1.0
        };
        self
    }

    pub const fn burst(mut self, burst: usize) -> Self {
        self.burst = burst;
        self
    }

    pub const fn configured_requests_per_second(self) -> f64 {
        self.requests_per_second
    }

    pub const fn configured_burst(self) -> usize {
        self.burst
    }

    fn normalize(self) -> Self {
        Self {
            requests_per_second: if self.requests_per_second.is_finite()
                && self.requests_per_second > 0.0
            {
                self.requests_per_second
            } else {
                1.0
            },
            burst: self.burst.max(1),
        }
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug)]
struct TokenBucket {
    policy: RateLimitPolicy,
    tokens: f64,
    last_refill_at: Instant,
}

impl TokenBucket {
    fn new(policy: RateLimitPolicy, now: Instant) -> Self {
        let policy = policy.normalize();
        Self {
            policy,
            tokens: policy.configured_burst() as f64,
            last_refill_at: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill_at {
            return;
        }
        let elapsed_secs = now.duration_since(self.last_refill_at).as_secs_f64();
        self.last_refill_at = now;
        let replenished = elapsed_secs * self.policy.configured_requests_per_second();
        self.tokens = (self.tokens + replenished).min(self.policy.configured_burst() as f64);
    }

    fn wait_duration(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }

        let needed_tokens = (1.0 - self.tokens).max(0.0);
        let delay_secs = needed_tokens / self.policy.configured_requests_per_second();
        if delay_secs <= f64::EPSILON {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }

    fn try_consume(&mut self, now: Instant) -> Duration {
        let delay = self.wait_duration(now);
        if delay.is_zero() {
            self.tokens = (self.tokens - 1.0).max(0.0);
        }
        delay
    }
}

/// Returned by [`RateLimiter::wait`] when the caller gave up before a token was free.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitCanceled;

/// Token bucket shared by every client built from the same [`ClientOptions`](crate::ClientOptions).
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(policy, Instant::now())),
        }
    }

    pub fn per_second(requests_per_second: f64) -> Self {
        Self::new(RateLimitPolicy::standard().requests_per_second(requests_per_second))
    }

    pub fn policy(&self) -> RateLimitPolicy {
        lock_unpoisoned(&self.bucket).policy
    }

    /// Takes a token if one is available now, otherwise reports how long to wait.
    pub(crate) fn try_acquire(&self) -> Duration {
        lock_unpoisoned(&self.bucket).try_consume(Instant::now())
    }

    /// Waits for one token, giving up as soon as `token` is canceled.
    pub async fn wait(&self, token: &CancellationToken) -> Result<(), WaitCanceled> {
        loop {
            if token.is_cancelled() {
                return Err(WaitCanceled);
            }
            let delay = self.try_acquire();
            if delay.is_zero() {
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(WaitCanceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitPolicy::standard())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use tokio_util::sync::CancellationToken;

    use super::{RateLimitPolicy, RateLimiter, TokenBucket, WaitCanceled};

    #[test]
    fn bucket_refills_at_configured_rate() {
        let start = Instant::now();
        let policy = RateLimitPolicy::standard().requests_per_second(10.0).burst(2);
        let mut bucket = TokenBucket::new(policy, start);

        assert_eq!(bucket.try_consume(start), Duration::ZERO);
        assert_eq!(bucket.try_consume(start), Duration::ZERO);
        let delay = bucket.try_consume(start);
        assert!(delay > Duration::from_millis(90) && delay <= Duration::from_millis(100));

        let later = start + Duration::from_millis(100);
        assert_eq!(bucket.try_consume(later), Duration::ZERO);
    }

    #[test]
    fn invalid_rates_fall_back_to_one_per_second() {
        let policy = RateLimitPolicy::standard().requests_per_second(f64::NAN).burst(0);
        let bucket = TokenBucket::new(policy, Instant::now());
        assert_eq!(bucket.policy.configured_requests_per_second(), 1.0);
        assert_eq!(bucket.policy.configured_burst(), 1);
    }

    #[tokio::test]
    async fn wait_returns_once_a_token_is_free() {
        let limiter = RateLimiter::per_second(20.0);
        let token = CancellationToken::new();
        let started = Instant::now();
        limiter.wait(&token).await.expect("first token is immediate");
        limiter.wait(&token).await.expect("second token after refill");
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn wait_gives_up_when_canceled() {
        let limiter = RateLimiter::per_second(0.1);
        let token = CancellationToken::new();
        limiter.wait(&token).await.expect("first token is immediate");

        let canceler = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceler.cancel();
        });
        let started = Instant::now();
        assert_eq!(limiter.wait(&token).await, Err(WaitCanceled));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}

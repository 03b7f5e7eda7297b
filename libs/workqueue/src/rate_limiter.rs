//! Per-key retry delay policies.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::{lock, Key};

/// Decides how long a key should wait before it is processed again.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before `item` should be retried. Records a failure for it.
    fn when(&self, item: &K) -> Duration;

    /// Clear all history for `item`. Unknown keys are ignored.
    fn forget(&self, item: &K);

    /// Consecutive failures recorded for `item` (0 for unknown keys).
    fn num_requeues(&self, item: &K) -> u32;
}

// =============================================================================
// Exponential failure
// =============================================================================

/// `base * 2^failures`, clamped to `[base, max]`.
#[derive(Debug)]
pub struct ItemExponentialFailureRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Key> ItemExponentialFailureRateLimiter<K> {
    /// Create a limiter with the given base and maximum delay.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Key> RateLimiter<K> for ItemExponentialFailureRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        let exp = {
            let mut failures = lock(&self.failures);
            let count = failures.entry(item.clone()).or_insert(0);
            let exp = *count;
            *count = count.saturating_add(1);
            exp
        };

        exponential_delay(self.base, self.max, exp)
    }

    fn forget(&self, item: &K) {
        lock(&self.failures).remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        lock(&self.failures).get(item).copied().unwrap_or(0)
    }
}

/// Compute `base * 2^exp` without overflowing; anything too large is `max`.
pub(crate) fn exponential_delay(base: Duration, max: Duration, exp: u32) -> Duration {
    let delay = 2u32
        .checked_pow(exp)
        .and_then(|factor| base.checked_mul(factor))
        .unwrap_or(max);

    delay.min(max).max(base.min(max))
}

// =============================================================================
// Token bucket
// =============================================================================

/// Overall rate limit shared by every key.
///
/// Each `when` reserves one token. Tokens may go negative, in which case the
/// returned delay is the time until the bucket refills back to zero, so a
/// burst of calls is spread out at `1 / rate` intervals.
#[derive(Debug)]
pub struct BucketRateLimiter {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

impl BucketRateLimiter {
    /// Create a bucket refilling at `rate` tokens per second, holding at most
    /// `burst` tokens. The bucket starts full.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate,
            burst: f64::from(burst),
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
        }
    }

    fn reserve_at(&self, now: Instant) -> Duration {
        let mut bucket = lock(&self.bucket);

        if self.rate > 0.0 {
            let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
            bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        }
        if now > bucket.last {
            bucket.last = now;
        }

        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            return Duration::ZERO;
        }
        if self.rate <= 0.0 {
            return Duration::MAX;
        }

        Duration::try_from_secs_f64(-bucket.tokens / self.rate).unwrap_or(Duration::MAX)
    }
}

impl<K: Key> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _item: &K) -> Duration {
        self.reserve_at(Instant::now())
    }

    fn forget(&self, _item: &K) {}

    fn num_requeues(&self, _item: &K) -> u32 {
        0
    }
}

// =============================================================================
// Fast / slow
// =============================================================================

/// `fast` for the first `max_fast_attempts` failures, then `slow`.
#[derive(Debug)]
pub struct ItemFastSlowRateLimiter<K> {
    fast: Duration,
    slow: Duration,
    max_fast_attempts: u32,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Key> ItemFastSlowRateLimiter<K> {
    /// Create a fast/slow limiter.
    pub fn new(fast: Duration, slow: Duration, max_fast_attempts: u32) -> Self {
        Self {
            fast,
            slow,
            max_fast_attempts,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Key> RateLimiter<K> for ItemFastSlowRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(item.clone()).or_insert(0);
        *count = count.saturating_add(1);

        if *count <= self.max_fast_attempts {
            self.fast
        } else {
            self.slow
        }
    }

    fn forget(&self, item: &K) {
        lock(&self.failures).remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        lock(&self.failures).get(item).copied().unwrap_or(0)
    }
}

// =============================================================================
// Max-of
// =============================================================================

/// Returns the longest delay of any wrapped limiter.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K: Key> MaxOfRateLimiter<K> {
    /// Compose the given limiters.
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K: Key> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        // Every child must see the failure, so no short-circuiting here.
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &K) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Default base delay for per-key exponential backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default ceiling for per-key exponential backoff.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Default overall retry rate (per second).
pub const DEFAULT_QPS: f64 = 10.0;

/// Default overall burst.
pub const DEFAULT_BURST: u32 = 100;

/// Per-key exponential backoff combined with an overall token bucket.
pub fn default_controller_rate_limiter<K: Key>() -> MaxOfRateLimiter<K> {
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            DEFAULT_BASE_DELAY,
            DEFAULT_MAX_DELAY,
        )),
        Box::new(BucketRateLimiter::new(DEFAULT_QPS, DEFAULT_BURST)),
    ])
}

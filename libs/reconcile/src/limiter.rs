//! Rate limiters deciding how long a key waits before it is requeued.
//!
//! Every call to [`RateLimiter::when`] counts as one failure for the key.
//! [`RateLimiter::forget`] clears that history once the key reconciles
//! successfully.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Decides the requeue delay for a key.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before `key` may be processed again. Records a failure.
    fn when(&self, key: &K) -> Duration;

    /// Clear failure tracking for a key (on success).
    fn forget(&self, key: &K);

    /// Number of failures recorded for a key since it was last forgotten.
    fn num_requeues(&self, key: &K) -> u32;
}

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay for the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: crate::DEFAULT_BACKOFF_BASE,
            max: crate::DEFAULT_BACKOFF_MAX,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = 1u32
            .checked_shl(attempt)
            .and_then(|factor| self.base.checked_mul(factor));
        match delay {
            Some(delay) if delay < self.max => delay,
            _ => self.max,
        }
    }
}

// =============================================================================
// Per-key exponential limiter
// =============================================================================

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ItemExponentialLimiter<K> {
    policy: BackoffPolicy,

    /// Tracked failures: key -> count.
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> ItemExponentialLimiter<K> {
    /// Create a new limiter.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for ItemExponentialLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(key.clone()).or_insert(0);
        let attempt = *count;
        *count = count.saturating_add(1);
        self.policy.delay(attempt)
    }

    fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}

// =============================================================================
// Token bucket
// =============================================================================

/// Token bucket shared by every key. Bounds the overall requeue rate.
pub struct BucketLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl BucketLimiter {
    /// Create a bucket refilling at `qps` tokens per second, holding at most `burst`.
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }
}

impl<K> RateLimiter<K> for BucketLimiter {
    fn when(&self, _key: &K) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last_refill = now;

        // Tokens may go negative: each caller reserves the next free slot.
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 {
        0
    }
}

// =============================================================================
// Composition
// =============================================================================

/// Takes the longest delay of its children.
pub struct MaxOfLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &K) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// Default controller limiter: max(per-key exponential, shared token bucket).
pub fn default_controller_limiter<K>(
    policy: BackoffPolicy,
    qps: f64,
    burst: u32,
) -> MaxOfLimiter<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    MaxOfLimiter::new(vec![
        Box::new(ItemExponentialLimiter::new(policy)),
        Box::new(BucketLimiter::new(qps, burst)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1),
        }
    }

    #[rstest]
    #[case(0, Duration::from_millis(5))]
    #[case(1, Duration::from_millis(10))]
    #[case(3, Duration::from_millis(40))]
    #[case(8, Duration::from_millis(1000))]
    #[case(400, Duration::from_millis(1000))]
    fn test_backoff_delay(#[case] attempt: u32, #[case] expected: Duration) {
        assert_eq!(policy().delay(attempt), expected);
    }

    #[test]
    fn test_item_limiter_grows_and_resets() {
        let limiter = ItemExponentialLimiter::new(policy());

        let d0 = limiter.when(&"svc");
        let d1 = limiter.when(&"svc");
        let d2 = limiter.when(&"svc");
        assert!(d0 < d1 && d1 < d2);
        assert_eq!(limiter.num_requeues(&"svc"), 3);

        // Other keys are independent
        assert_eq!(limiter.num_requeues(&"other"), 0);

        limiter.forget(&"svc");
        assert_eq!(limiter.num_requeues(&"svc"), 0);
        assert_eq!(limiter.when(&"svc"), d0);
    }

    #[test]
    fn test_bucket_limiter_burst() {
        let limiter = BucketLimiter::new(1.0, 2);

        assert_eq!(RateLimiter::<&str>::when(&limiter, &"a"), Duration::ZERO);
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"b"), Duration::ZERO);

        // Bucket exhausted: next caller waits roughly one token interval
        let delay = RateLimiter::<&str>::when(&limiter, &"c");
        assert!(delay > Duration::from_millis(900));
    }

    #[test]
    fn test_max_of_limiter() {
        let limiter: MaxOfLimiter<&str> = default_controller_limiter(policy(), 100.0, 100);

        assert_eq!(limiter.when(&"svc"), Duration::from_millis(5));
        assert_eq!(limiter.when(&"svc"), Duration::from_millis(10));
        assert_eq!(limiter.num_requeues(&"svc"), 2);

        limiter.forget(&"svc");
        assert_eq!(limiter.num_requeues(&"svc"), 0);
    }
}

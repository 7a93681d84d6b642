//! Per-publisher token buckets.
//!
//! Buckets refill continuously from the injected clock, so tests can step
//! time with a `ManualClock` instead of sleeping.

use parking_lot::Mutex;
use std::collections::HashMap;
use trustgate_core::config::BrokerConfig;
use trustgate_core::SharedClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    rate_per_ms: f64,
    tokens: f64,
    last_refill_ms: u64,
}

impl TokenBucket {
    /// Full bucket of `capacity` tokens refilling at `rate_per_sec`.
    pub fn new(capacity: f64, rate_per_sec: f64, now_ms: u64) -> Self {
        Self {
            capacity,
            rate_per_ms: rate_per_sec / 1000.0,
            tokens: capacity,
            last_refill_ms: now_ms,
        }
    }

    fn refill(&mut self, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_refill_ms) as f64;
        self.tokens = (self.tokens + elapsed * self.rate_per_ms).min(self.capacity);
        self.last_refill_ms = now_ms.max(self.last_refill_ms);
    }

    /// Change limits in place, keeping accumulated tokens within the new capacity.
    pub fn reconfigure(&mut self, capacity: f64, rate_per_sec: f64, now_ms: u64) {
        self.refill(now_ms);
        self.capacity = capacity;
        self.rate_per_ms = rate_per_sec / 1000.0;
        self.tokens = self.tokens.min(capacity);
    }

    pub fn try_acquire(&mut self, now_ms: u64) -> RateDecision {
        self.refill(now_ms);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return RateDecision::Allowed;
        }
        let retry_after_ms = if self.rate_per_ms > 0.0 {
            ((1.0 - self.tokens) / self.rate_per_ms).ceil() as u64
        } else {
            u64::MAX
        };
        RateDecision::Limited {
            retry_after_ms: retry_after_ms.max(1),
        }
    }
}

/// Token buckets keyed by publisher.
pub struct RateLimiter {
    rate_per_sec: f64,
    capacity: f64,
    low_trust_factor: f64,
    buckets: Mutex<HashMap<String, TokenBucket>>,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(config: &BrokerConfig, clock: SharedClock) -> Self {
        Self {
            rate_per_sec: config.max_rate_per_sec,
            capacity: config.bucket_capacity(),
            low_trust_factor: config.low_trust_rate_factor.clamp(0.0, 1.0),
            buckets: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn limits(&self, low_trust: bool) -> (f64, f64) {
        if low_trust {
            let capacity = (self.capacity * self.low_trust_factor).max(1.0);
            (capacity, self.rate_per_sec * self.low_trust_factor)
        } else {
            (self.capacity, self.rate_per_sec)
        }
    }

    /// Take one token for `publisher`. Low-trust publishers draw from a
    /// smaller, slower bucket.
    pub fn check(&self, publisher: &str, low_trust: bool) -> RateDecision {
        let now = self.clock.now_ms();
        let (capacity, rate) = self.limits(low_trust);
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(publisher.to_string())
            .or_insert_with(|| TokenBucket::new(capacity, rate, now));
        if bucket.capacity != capacity || bucket.rate_per_ms != rate / 1000.0 {
            bucket.reconfigure(capacity, rate, now);
        }
        bucket.try_acquire(now)
    }

    pub fn tracked_publishers(&self) -> usize {
        self.buckets.lock().len()
    }
}

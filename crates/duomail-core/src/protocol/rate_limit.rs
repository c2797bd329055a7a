use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_PER_MINUTE: u32 = 60;
pub const DEFAULT_PER_HOUR: u32 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    pub per_minute: u32,
    pub per_hour: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            per_minute: DEFAULT_PER_MINUTE,
            per_hour: DEFAULT_PER_HOUR,
        }
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    updated: Instant,
}

impl Bucket {
    fn new(capacity: u32, window: Duration, now: Instant) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / window.as_secs_f64(),
            updated: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.updated = now;
    }

    /// Time until one whole token is available.
    fn wait_for_token(&self) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
        }
    }
}

/// Two token buckets per connection: a short per-minute cap and a longer per-hour cap. A
/// request is admitted only if both have a token; a rejected request consumes nothing.
#[derive(Debug)]
pub struct RateLimiter {
    limits: RateLimits,
    buckets: Mutex<HashMap<u64, (Bucket, Bucket)>>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, connection_id: u64) -> Result<(), Duration> {
        self.check_at(connection_id, Instant::now())
    }

    pub fn check_at(&self, connection_id: u64, now: Instant) -> Result<(), Duration> {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (minute, hour) = buckets.entry(connection_id).or_insert_with(|| {
            (
                Bucket::new(self.limits.per_minute, Duration::from_secs(60), now),
                Bucket::new(self.limits.per_hour, Duration::from_secs(3600), now),
            )
        });

        minute.refill(now);
        hour.refill(now);

        let wait = minute.wait_for_token().max(hour.wait_for_token());
        if wait > Duration::ZERO {
            return Err(wait);
        }

        minute.tokens -= 1.0;
        hour.tokens -= 1.0;
        Ok(())
    }

    /// Drops a closed connection's buckets.
    pub fn forget(&self, connection_id: u64) {
        self.buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&connection_id);
    }
}

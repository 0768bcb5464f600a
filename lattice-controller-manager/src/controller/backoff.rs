use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

pub const BASE_DELAY: Duration = Duration::from_millis(5);
pub const MAX_DELAY: Duration = Duration::from_secs(1000);
pub const OVERALL_QPS: f64 = 10.0;
pub const OVERALL_BURST: f64 = 100.0;

/// Exponential backoff per key, `base * 2^failures` capped at `max`.
#[derive(Debug)]
pub struct ItemBackoff {
    base: Duration,
    max: Duration,
    failures: HashMap<String, u32>,
}

impl ItemBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }

    pub fn next_delay(&mut self, key: &str) -> Duration {
        let failures = self.failures.entry(key.to_owned()).or_default();
        let multiplier = 1u32.checked_shl(*failures).unwrap_or(u32::MAX);

        *failures = failures.saturating_add(1);

        self.base.saturating_mul(multiplier).min(self.max)
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).copied().unwrap_or_default()
    }

    pub fn reset(&mut self, key: &str) {
        self.failures.remove(key);
    }
}

/// Bounds the overall requeue rate, `qps` tokens per second up to `burst`.
#[derive(Debug)]
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    tokens: f64,
    last_refill: Option<Instant>,
}

impl TokenBucket {
    pub fn new(qps: f64, burst: f64) -> Self {
        Self {
            qps,
            burst,
            tokens: burst,
            last_refill: None,
        }
    }

    /// Takes a token and returns how long the caller has to wait until it's valid.
    pub fn reserve(&mut self, now: Instant) -> Duration {
        if let Some(last_refill) = self.last_refill {
            let elapsed = now.saturating_duration_since(last_refill).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        }

        self.last_refill = Some(now);
        self.tokens -= 1.0;

        match self.tokens >= 0.0 {
            true => Duration::ZERO,
            false => Duration::from_secs_f64(-self.tokens / self.qps),
        }
    }
}

/// Per key backoff combined with the overall limiter, the longer delay wins.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<(ItemBackoff, TokenBucket)>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(
            ItemBackoff::new(BASE_DELAY, MAX_DELAY),
            TokenBucket::new(OVERALL_QPS, OVERALL_BURST),
        )
    }
}

impl RateLimiter {
    pub fn new(item: ItemBackoff, overall: TokenBucket) -> Self {
        Self {
            state: Mutex::new((item, overall)),
        }
    }

    pub fn when(&self, key: &str, now: Instant) -> Duration {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (item, overall) = &mut *state;

        item.next_delay(key).max(overall.reserve(now))
    }

    pub fn forget(&self, key: &str) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .0
            .reset(key);
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .0
            .failures(key)
    }
}

//! Rate limiter - token bucket for exchange request pacing
//!
//! Binance spot enforces:
//! - Request weight: 6000 per minute per IP
//! - Orders: 100 per 10 seconds per account
//!
//! Buckets run at 80% of those limits. Callers wait for a token instead of
//! being rejected.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Rate limit endpoint classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    /// Weighted market data and account endpoints
    General,
    /// POST /api/v3/order
    Order,
}

impl EndpointClass {
    /// Maximum tokens per window, at 80% of the exchange limit
    fn max_tokens(&self) -> u32 {
        match self {
            EndpointClass::General => 4800, // 80% of 6000
            EndpointClass::Order => 80,     // 80% of 100
        }
    }

    fn window(&self) -> Duration {
        match self {
            EndpointClass::General => Duration::from_secs(60),
            EndpointClass::Order => Duration::from_secs(10),
        }
    }
}

/// A single token bucket
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl TokenBucket {
    fn new(class: EndpointClass) -> Self {
        let max = class.max_tokens() as f64;
        Self {
            tokens: max,
            max_tokens: max,
            refill_rate: max / class.window().as_secs_f64(),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Consume `weight` tokens if available
    fn try_acquire(&mut self, weight: f64) -> bool {
        self.refill();
        if self.tokens >= weight {
            self.tokens -= weight;
            true
        } else {
            false
        }
    }

    fn time_until_available(&mut self, weight: f64) -> Duration {
        self.refill();
        if self.tokens >= weight {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((weight - self.tokens) / self.refill_rate)
        }
    }
}

/// Rate limiter with one bucket per endpoint class
#[derive(Clone)]
pub struct RateLimiter {
    general: Arc<Mutex<TokenBucket>>,
    order: Arc<Mutex<TokenBucket>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            general: Arc::new(Mutex::new(TokenBucket::new(EndpointClass::General))),
            order: Arc::new(Mutex::new(TokenBucket::new(EndpointClass::Order))),
        }
    }

    /// Wait until `weight` tokens are available for the class.
    /// Returns true if we had to wait.
    pub async fn acquire(&self, class: EndpointClass, weight: u32) -> bool {
        let weight = (weight.max(1) as f64).min(class.max_tokens() as f64);
        let bucket = self.bucket(class);
        let mut waited = false;
        loop {
            let wait_time = {
                let mut b = bucket.lock().await;
                if b.try_acquire(weight) {
                    return waited;
                }
                b.time_until_available(weight)
            };

            waited = true;
            debug!("[RateLimiter] waiting {:?} for {:?}", wait_time, class);
            tokio::time::sleep(wait_time).await;
        }
    }

    /// Take tokens without waiting
    pub async fn try_acquire(&self, class: EndpointClass, weight: u32) -> bool {
        let mut b = self.bucket(class).lock().await;
        b.try_acquire(weight.max(1) as f64)
    }

    fn bucket(&self, class: EndpointClass) -> &Arc<Mutex<TokenBucket>> {
        match class {
            EndpointClass::General => &self.general,
            EndpointClass::Order => &self.order,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_succeeds_on_full_bucket() {
        let limiter = RateLimiter::new();
        assert!(!limiter.acquire(EndpointClass::General, 20).await);
        assert!(!limiter.acquire(EndpointClass::Order, 1).await);
    }

    #[tokio::test]
    async fn test_order_bucket_drains() {
        let limiter = RateLimiter::new();
        for _ in 0..80 {
            assert!(limiter.try_acquire(EndpointClass::Order, 1).await);
        }
        assert!(!limiter.try_acquire(EndpointClass::Order, 1).await);
        // General bucket is independent
        assert!(limiter.try_acquire(EndpointClass::General, 1).await);
    }
}

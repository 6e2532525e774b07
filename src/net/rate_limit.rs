//! Token bucket rate limiting for the transfer-rate options

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_update: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, rate_per_sec: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            rate_per_sec,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_update = now;
    }

    pub fn try_consume(&mut self, tokens: f64) -> bool {
        self.refill();
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    /// Time until `tokens` would be available, zero if available now.
    pub fn time_until(&mut self, tokens: f64) -> Duration {
        self.refill();
        if self.tokens >= tokens {
            return Duration::ZERO;
        }
        let missing = tokens - self.tokens;
        Duration::from_secs_f64(missing / self.rate_per_sec)
    }

    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }
}

/// Direction-wide byte limiter shared by every connection. Writers await
/// their budget before flushing a frame; readers account frames after
/// receipt, which delays further reads on that connection.
#[derive(Debug)]
pub struct SharedLimiter {
    bucket: Mutex<TokenBucket>,
}

impl SharedLimiter {
    /// `kb_per_sec` per the CLI convention; burst of one second.
    pub fn new(kb_per_sec: u64) -> Self {
        let rate = (kb_per_sec as f64) * 1024.0;
        Self {
            bucket: Mutex::new(TokenBucket::new(rate, rate)),
        }
    }

    /// Wait until `bytes` fit the budget, then consume them. Oversized
    /// single frames (bigger than the burst) are let through once the
    /// bucket is full.
    pub async fn throttle(&self, bytes: usize) {
        let want = bytes as f64;
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().unwrap();
                let capped = want.min(bucket.capacity);
                if bucket.try_consume(capped) {
                    return;
                }
                bucket.time_until(capped)
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_starts_full_and_drains() {
        let mut bucket = TokenBucket::new(100.0, 10.0);
        assert!(bucket.try_consume(60.0));
        assert!(bucket.try_consume(40.0));
        assert!(!bucket.try_consume(50.0));
    }

    #[test]
    fn bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(10.0, 1000.0);
        assert!(bucket.try_consume(10.0));
        assert!(!bucket.try_consume(5.0));
        std::thread::sleep(Duration::from_millis(20));
        assert!(bucket.try_consume(5.0));
    }

    #[test]
    fn time_until_is_zero_when_available() {
        let mut bucket = TokenBucket::new(10.0, 1.0);
        assert_eq!(bucket.time_until(5.0), Duration::ZERO);
        bucket.try_consume(10.0);
        assert!(bucket.time_until(5.0) > Duration::ZERO);
    }

    #[tokio::test]
    async fn shared_limiter_lets_oversized_frame_pass() {
        let limiter = SharedLimiter::new(1); // 1 kB/s burst
        // A frame larger than the burst must not deadlock.
        tokio::time::timeout(Duration::from_secs(2), limiter.throttle(64 * 1024))
            .await
            .expect("oversized frame must pass once bucket is full");
    }
}

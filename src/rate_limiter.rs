//! Token-bucket rate limiter (C2).
//!
//! Two variants share the same refill/consume logic: [`RateLimiter`] is
//! mutex-guarded for cross-thread use (the run controller's process-wide
//! `constant_rps` gate); [`UnlockedRateLimiter`] requires `&mut self`, so
//! the borrow checker — not a runtime assertion — enforces the
//! single-owner precondition for a worker's per-instance limiter.

use std::sync::Mutex;
use std::time::Instant;

struct Bucket {
    target_rps: f64,
    burst_size: f64,
    balance: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(target_rps: f64, burst_size: f64) -> Self {
        Self {
            target_rps,
            burst_size,
            balance: burst_size,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        if self.target_rps <= 0.0 {
            return;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.balance = (self.balance + elapsed * self.target_rps).min(self.burst_size);
    }

    fn try_acquire(&mut self) -> bool {
        if self.target_rps <= 0.0 {
            return true;
        }
        self.refill();
        if self.balance >= 1.0 {
            self.balance -= 1.0;
            true
        } else {
            false
        }
    }

    /// Seconds until the next token becomes available, given the current
    /// (post-refill) balance.
    fn wait_secs(&self) -> f64 {
        if self.target_rps <= 0.0 || self.balance >= 1.0 {
            0.0
        } else {
            (1.0 - self.balance) / self.target_rps
        }
    }
}

/// Mutex-guarded token bucket, safe to share across threads (e.g. the
/// run controller's process-wide `constant_rps` gate).
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// `target_rps == 0` disables the limiter: both `try_acquire` and
    /// `acquire` then return immediately.
    pub fn new(target_rps: f64, burst_size: f64) -> Self {
        Self {
            bucket: Mutex::new(Bucket::new(target_rps, burst_size.max(target_rps))),
        }
    }

    pub fn with_default_burst(target_rps: f64) -> Self {
        Self::new(target_rps, 2.0 * target_rps)
    }

    /// Consumes one token if available; never sleeps.
    pub fn try_acquire(&self) -> bool {
        self.bucket.lock().unwrap().try_acquire()
    }

    /// Loops with adaptive sleep until a token is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().unwrap();
                if bucket.try_acquire() {
                    return;
                }
                bucket.wait_secs()
            };
            if wait > 0.0 {
                tokio::time::sleep(std::time::Duration::from_secs_f64(wait)).await;
            } else {
                tokio::task::yield_now().await;
            }
        }
    }

    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock().unwrap();
        bucket.refill();
        bucket.balance
    }
}

/// Single-owner token bucket with no internal locking. Legal only when the
/// limiter instance is owned exclusively by one worker — enforced by
/// requiring `&mut self` on the hot-path method.
pub struct UnlockedRateLimiter {
    bucket: Bucket,
}

impl UnlockedRateLimiter {
    pub fn new(target_rps: f64, burst_size: f64) -> Self {
        Self {
            bucket: Bucket::new(target_rps, burst_size.max(target_rps)),
        }
    }

    pub fn with_default_burst(target_rps: f64) -> Self {
        Self::new(target_rps, 2.0 * target_rps)
    }

    /// Consumes one token if available; never sleeps. `&mut self` means a
    /// worker can only call this through its own owned limiter, never
    /// through a shared reference handed to another thread.
    pub fn try_acquire_unlocked(&mut self) -> bool {
        self.bucket.try_acquire()
    }

    pub fn available_tokens(&mut self) -> f64 {
        self.bucket.refill();
        self.bucket.balance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_limiter_always_admits() {
        let limiter = RateLimiter::new(0.0, 0.0);
        for _ in 0..1000 {
            assert!(limiter.try_acquire());
        }
    }

    #[test]
    fn burst_size_bounds_immediate_acquires() {
        let limiter = RateLimiter::new(10.0, 5.0);
        let mut admitted = 0;
        for _ in 0..100 {
            if limiter.try_acquire() {
                admitted += 1;
            }
        }
        assert!(admitted <= 5, "admitted {admitted} exceeds burst_size 5");
    }

    #[test]
    fn available_tokens_never_exceeds_burst_size() {
        let limiter = RateLimiter::new(1000.0, 50.0);
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(limiter.available_tokens() <= 50.0);
    }

    #[test]
    fn unlocked_variant_matches_guarded_semantics() {
        let mut limiter = UnlockedRateLimiter::new(10.0, 5.0);
        let mut admitted = 0;
        for _ in 0..100 {
            if limiter.try_acquire_unlocked() {
                admitted += 1;
            }
        }
        assert!(admitted <= 5);
    }

    #[tokio::test]
    async fn acquire_eventually_succeeds_under_contention() {
        let limiter = RateLimiter::new(100.0, 1.0);
        for _ in 0..5 {
            limiter.acquire().await;
        }
    }
}

//! Token bucket rate limiter for store-session bandwidth control
//!
//! One limiter is shared by all segment workers of a session when a speed
//! limit is configured.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Largest slice consumed per acquire, so concurrent workers interleave
/// fairly under a tight limit
const ACQUIRE_CHUNK: u64 = 16 * 1024;

/// Token bucket limiter shared across the segment workers of one session
#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<BucketState>>,
}

struct BucketState {
    /// Maximum tokens (bytes) the bucket can hold
    capacity: u64,
    /// Currently available tokens
    tokens: f64,
    last_refill: Instant,
    /// Tokens added per second (the speed limit)
    refill_rate: u64,
    unlimited: bool,
}

impl RateLimiter {
    /// Create a limiter with a bytes-per-second budget
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(BucketState {
                capacity: bytes_per_second,
                tokens: bytes_per_second as f64,
                last_refill: Instant::now(),
                refill_rate: bytes_per_second,
                unlimited: false,
            })),
        }
    }

    /// Create a limiter that never throttles
    pub fn unlimited() -> Self {
        Self {
            state: Arc::new(Mutex::new(BucketState {
                capacity: u64::MAX,
                tokens: f64::MAX,
                last_refill: Instant::now(),
                refill_rate: u64::MAX,
                unlimited: true,
            })),
        }
    }

    /// Throttle a transfer of `bytes`, blocking until the budget allows it
    pub async fn throttle(&self, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            let chunk = remaining.min(ACQUIRE_CHUNK);
            self.acquire(chunk).await;
            remaining -= chunk;
        }
    }

    async fn acquire(&self, bytes: u64) {
        let mut remaining = bytes as f64;
        loop {
            let wait = {
                let mut state = self.state.lock().await;

                if state.unlimited {
                    return;
                }

                refill(&mut state);

                // Drain whatever is available; requests larger than the
                // bucket capacity complete across several refills.
                let take = state.tokens.min(remaining);
                state.tokens -= take;
                remaining -= take;
                if remaining <= 0.0 {
                    return;
                }

                // Wait only a small slice so other workers get fair access
                let wait_secs = remaining / state.refill_rate as f64;
                Duration::from_secs_f64(wait_secs.min(0.05))
            };

            if wait > Duration::ZERO {
                tokio::time::sleep(wait).await;
            }
        }
    }
}

fn refill(state: &mut BucketState) {
    let now = Instant::now();
    let elapsed = now.duration_since(state.last_refill).as_secs_f64();
    if elapsed > 0.001 {
        let new_tokens = elapsed * state.refill_rate as f64;
        state.tokens = (state.tokens + new_tokens).min(state.capacity as f64);
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn throttle_respects_budget() {
        let limiter = RateLimiter::new(1000); // 1KB/s

        let start = Instant::now();
        limiter.throttle(500).await; // full bucket, immediate
        assert!(start.elapsed().as_millis() < 50);

        limiter.throttle(500).await; // drains the bucket, still immediate
        assert!(start.elapsed().as_millis() < 50);

        limiter.throttle(500).await; // must wait ~0.5s for refill
        assert!(start.elapsed().as_millis() >= 400);
    }

    #[tokio::test]
    async fn unlimited_never_waits() {
        let limiter = RateLimiter::unlimited();

        let start = Instant::now();
        for _ in 0..100 {
            limiter.throttle(1024 * 1024).await;
        }
        assert!(start.elapsed().as_millis() < 50);
    }
}

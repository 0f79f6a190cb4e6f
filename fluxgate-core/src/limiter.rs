//! Token-bucket throttle for outbound writes.
//!
//! Sessions acquire tokens before writing toward the remote; when the
//! bucket runs dry the acquiring session sleeps until enough tokens have
//! refilled. Writes are delayed, never dropped, and a stalled session only
//! stalls itself.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct BucketState {
    available: f64,
    refilled_at: Instant,
}

/// Aggregate bytes/sec limiter shared by all sessions of one run.
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// `rate` in bytes/sec. The burst capacity is one sampling window's
    /// worth of tokens, matching the telemetry window.
    pub fn new(rate: u64) -> Self {
        let rate = rate as f64;
        Self {
            rate,
            capacity: rate * crate::stats::SAMPLE_WINDOW.as_secs_f64(),
            state: Mutex::new(BucketState {
                available: rate,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Take `bytes` tokens, sleeping until the bucket can cover them.
    pub async fn acquire(&self, bytes: usize) {
        let mut needed = bytes as f64;

        // chunks larger than the bucket are drained in capacity-sized bites
        while needed > 0.0 {
            let bite = needed.min(self.capacity);
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.refilled_at.elapsed().as_secs_f64();
                state.available = (state.available + elapsed * self.rate).min(self.capacity);
                state.refilled_at = Instant::now();

                if state.available >= bite {
                    state.available -= bite;
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (bite - state.available) / self.rate,
                    ))
                }
            };

            match wait {
                None => needed -= bite,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant as StdInstant;

    #[tokio::test]
    async fn test_burst_within_capacity_is_immediate() {
        let limiter = RateLimiter::new(1_000_000);
        let started = StdInstant::now();
        limiter.acquire(1000).await;
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_sustained_demand_is_throttled() {
        // 10 KiB/s limit, 30 KiB demand beyond the initial tokens
        let limiter = RateLimiter::new(10 * 1024);
        let started = StdInstant::now();
        for _ in 0..4 {
            limiter.acquire(10 * 1024).await;
        }
        // first window is free (burst allowance), the rest must wait
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_oversized_chunk_completes() {
        let limiter = RateLimiter::new(1024 * 1024);
        // larger than the bucket capacity; must complete, not hang
        tokio::time::timeout(Duration::from_secs(10), limiter.acquire(3 * 1024 * 1024))
            .await
            .expect("oversized acquire must not hang");
    }
}

//! Async token-bucket rate limiter
//!
//! Exceeding the budget suspends the caller until tokens refill; frames are
//! never dropped. The read loops await here, which stalls WebSocket
//! consumption and pushes backpressure to the remote sender.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::sleep;

struct Bucket {
    tokens: f64,
    refreshed: Instant,
}

/// Token bucket: `limit` tokens per second, capacity `burst`.
pub struct RateLimiter {
    limit: usize,
    burst: usize,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(limit: usize, burst: usize) -> Self {
        Self {
            limit,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                refreshed: Instant::now(),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn burst(&self) -> usize {
        self.burst
    }

    /// Take `n` tokens, suspending until the bucket can cover them. A
    /// request larger than the burst is clamped so it can complete.
    pub async fn wait_n(&self, n: usize) {
        if self.limit == 0 || n == 0 {
            return;
        }
        let need = n.min(self.burst) as f64;
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.refreshed).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.limit as f64).min(self.burst as f64);
                bucket.refreshed = now;
                if bucket.tokens >= need {
                    bucket.tokens -= need;
                    return;
                }
                Duration::from_secs_f64((need - bucket.tokens) / self.limit as f64)
            };
            sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_is_immediate() {
        let rl = RateLimiter::new(100, 1000);
        let start = Instant::now();
        rl.wait_n(1000).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_exhausted_bucket_waits() {
        let rl = RateLimiter::new(1000, 100);
        rl.wait_n(100).await;
        let start = Instant::now();
        rl.wait_n(100).await; // refills at 1000/s, so ~100ms
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(80), "waited {:?}", waited);
    }

    #[tokio::test]
    async fn test_oversized_request_clamped() {
        let rl = RateLimiter::new(1000, 100);
        let start = Instant::now();
        rl.wait_n(10_000).await;
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_zero_limit_is_unlimited() {
        let rl = RateLimiter::new(0, 0);
        rl.wait_n(1 << 20).await;
    }
}

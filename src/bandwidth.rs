//! Shared outbound bandwidth budget.
//!
//! A token bucket refilled at `rate` bytes per second with one second of
//! burst. A send larger than the available tokens reserves them anyway (the
//! bucket goes into debt) and the caller sleeps until the debt is repaid, so
//! frames larger than the burst still go out at the configured average rate.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_update: Instant,
}

#[derive(Debug)]
pub struct BandwidthLimiter {
    /// Bytes per second; `None` means unlimited.
    rate: Option<u64>,
    bucket: Mutex<Bucket>,
}

impl BandwidthLimiter {
    pub fn new(rate: Option<u64>) -> Self {
        let rate = rate.filter(|r| *r > 0);
        Self {
            rate,
            bucket: Mutex::new(Bucket {
                tokens: rate.unwrap_or(0) as f64,
                last_update: Instant::now(),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    pub fn rate(&self) -> Option<u64> {
        self.rate
    }

    /// How long a caller must wait before sending `bytes`, reserving them.
    async fn reserve(&self, bytes: usize) -> Duration {
        let Some(rate) = self.rate else {
            return Duration::ZERO;
        };
        let rate = rate as f64;
        let mut bucket = self.bucket.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_update).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(rate);
        bucket.last_update = now;
        bucket.tokens -= bytes as f64;

        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / rate)
        }
    }

    /// Wait until `bytes` may be sent.
    pub async fn acquire(&self, bytes: usize) {
        let wait = self.reserve(bytes).await;
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_never_waits() {
        let limiter = BandwidthLimiter::unlimited();
        assert_eq!(limiter.reserve(usize::MAX / 2).await, Duration::ZERO);
        assert_eq!(BandwidthLimiter::new(Some(0)).rate(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_debt() {
        let limiter = BandwidthLimiter::new(Some(1000));
        assert_eq!(limiter.reserve(1000).await, Duration::ZERO);

        let wait = limiter.reserve(500).await;
        assert_eq!(wait, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_over_time() {
        let limiter = BandwidthLimiter::new(Some(1000));
        limiter.acquire(1000).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.reserve(1000).await, Duration::ZERO);
    }
}

//! Token-bucket credit limiter.
//!
//! Each channel owns one bucket, mutated only by that channel's worker.
//! Credits refill proportionally to elapsed time and waiting is done by
//! polling at `refill_interval / max_credits`, so the worst-case extra
//! latency after a credit becomes available is one polling tick.

use tokio::time::{Duration, Instant};

use feedwatch_core::ChannelConfig;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    max_credits: u32,
    refill_interval: Duration,
    credits: u32,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket. `max_credits` and `refill_interval` must be
    /// positive; the dispatcher validates both on registration.
    pub fn new(max_credits: u32, refill_interval: Duration) -> Self {
        Self {
            max_credits,
            refill_interval,
            credits: max_credits,
            last_refill: Instant::now(),
        }
    }

    pub fn from_config(config: &ChannelConfig) -> Self {
        Self::new(config.max_credits, config.refill_interval())
    }

    pub fn credits(&self) -> u32 {
        self.credits
    }

    pub fn max_credits(&self) -> u32 {
        self.max_credits
    }

    /// Add `floor(elapsed / refill_interval * max_credits)` credits, capped
    /// at `max_credits`.
    ///
    /// The refill timestamp only moves when at least one credit was added,
    /// so fractional progress carries over to the next call.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let earned = (elapsed.as_secs_f64() / self.refill_interval.as_secs_f64()
            * f64::from(self.max_credits))
        .floor();

        if earned >= 1.0 {
            let earned = earned.min(f64::from(self.max_credits)) as u32;
            self.credits = self.credits.saturating_add(earned).min(self.max_credits);
            self.last_refill = now;
        }
    }

    /// Refill, then consume one credit if any is available.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.credits > 0 {
            self.credits -= 1;
            true
        } else {
            false
        }
    }

    /// Polling cadence used by [`acquire`](Self::acquire).
    pub fn poll_interval(&self) -> Duration {
        self.refill_interval / self.max_credits.max(1)
    }

    /// Wait until a credit is available and consume it.
    ///
    /// Cancel-safe: dropping the future never loses a credit, since the
    /// credit is only taken synchronously right before returning.
    pub async fn acquire(&mut self) {
        loop {
            if self.try_acquire(Instant::now()) {
                return;
            }
            tokio::time::sleep(self.poll_interval()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn starts_full_and_drains() {
        let mut bucket = TokenBucket::new(3, Duration::from_secs(3));
        let now = Instant::now();
        assert!(bucket.try_acquire(now));
        assert!(bucket.try_acquire(now));
        assert!(bucket.try_acquire(now));
        assert!(!bucket.try_acquire(now));
        assert_eq!(bucket.credits(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_never_exceeds_max() {
        let mut bucket = TokenBucket::new(2, Duration::from_secs(1));
        let start = Instant::now();
        bucket.try_acquire(start);
        bucket.refill(start + Duration::from_secs(3600));
        assert_eq!(bucket.credits(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fractional_progress_is_retained() {
        let mut bucket = TokenBucket::new(1, Duration::from_secs(1));
        let start = Instant::now();
        assert!(bucket.try_acquire(start));

        // 600ms: not yet a full credit, timestamp must not move.
        bucket.refill(start + Duration::from_millis(600));
        assert_eq!(bucket.credits(), 0);

        // 1000ms since the original refill point: one credit.
        bucket.refill(start + Duration::from_millis(1000));
        assert_eq!(bucket.credits(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_max_credits_per_interval_after_drain() {
        let max = 4;
        let interval = Duration::from_secs(2);
        let mut bucket = TokenBucket::new(max, interval);
        let start = Instant::now();
        while bucket.try_acquire(start) {}

        // Hammer the bucket every 10ms for just under one interval.
        let mut granted = 0;
        let mut t = start;
        while t < start + interval - Duration::from_millis(1) {
            t += Duration::from_millis(10);
            if bucket.try_acquire(t) {
                granted += 1;
            }
            assert!(bucket.credits() <= max);
        }
        assert!(granted <= max, "granted {granted} credits within one interval");
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_one_poll_tick() {
        let mut bucket = TokenBucket::new(2, Duration::from_secs(1));
        bucket.acquire().await;
        bucket.acquire().await;

        let before = Instant::now();
        bucket.acquire().await;
        let waited = before.elapsed();
        assert!(waited >= Duration::from_millis(500), "waited {waited:?}");
        assert!(waited < Duration::from_millis(600), "waited {waited:?}");
        assert_eq!(bucket.credits(), 0);
    }

    #[test]
    fn poll_interval_divides_refill_interval() {
        let bucket = TokenBucket::new(4, Duration::from_secs(2));
        assert_eq!(bucket.poll_interval(), Duration::from_millis(500));
    }
}

//! Rate limiting for Microsoft Graph API requests.
//!
//! A windowed token bucket: `refill_quantity` tokens are granted in one lump
//! once per window, unused tokens carry over up to `capacity`. This mirrors
//! the "N requests per T seconds" limits Graph advertises.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::metrics::TrafficMetrics;
use crate::{GraphResult, GraphSyncConfig, GraphSyncError};

/// Token bucket state.
#[derive(Debug, Clone)]
pub struct RateLimitBucket {
    capacity: u32,
    available: u32,
    refill_quantity: u32,
    interval: Duration,
    next_refill: Instant,
}

impl RateLimitBucket {
    /// Creates a full bucket whose first refill is one interval from now.
    #[must_use]
    pub fn new(capacity: u32, refill_quantity: u32, interval: Duration) -> Self {
        Self {
            capacity,
            available: capacity,
            refill_quantity,
            interval,
            next_refill: Instant::now() + interval,
        }
    }

    /// Maximum number of tokens the bucket holds.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tokens currently available, without refilling.
    #[must_use]
    pub fn available(&self) -> u32 {
        self.available
    }

    fn refill(&mut self, now: Instant) {
        if now >= self.next_refill {
            self.available = self
                .available
                .saturating_add(self.refill_quantity)
                .min(self.capacity);
            self.next_refill = now + self.interval;
            trace!(available = self.available, "Rate limit window refilled");
        }
    }

    /// Refills if the window elapsed, then deducts `cost` if enough tokens remain.
    fn try_take(&mut self, cost: u32, now: Instant) -> bool {
        self.refill(now);
        if self.available >= cost {
            self.available -= cost;
            true
        } else {
            false
        }
    }
}

/// Process-wide rate limiter shared by every caller of one Graph endpoint.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<RateLimitBucket>,
    min_wait: Duration,
    metrics: Arc<TrafficMetrics>,
}

impl RateLimiter {
    /// Creates a rate limiter from an explicit bucket.
    #[must_use]
    pub fn new(bucket: RateLimitBucket, min_wait: Duration, metrics: Arc<TrafficMetrics>) -> Self {
        Self {
            bucket: Mutex::new(bucket),
            min_wait,
            metrics,
        }
    }

    /// Creates a rate limiter from configuration.
    #[must_use]
    pub fn from_config(config: &GraphSyncConfig, metrics: Arc<TrafficMetrics>) -> Self {
        Self::new(
            RateLimitBucket::new(
                config.rate_limit_capacity,
                config.refill_quantity(),
                config.window(),
            ),
            Duration::from_millis(config.rate_limit_min_wait_ms),
            metrics,
        )
    }

    // Refill and deduction share this one critical section. It is never held
    // across an await point.
    fn lock(&self) -> MutexGuard<'_, RateLimitBucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_cost(&self, cost: u32) -> GraphResult<()> {
        let capacity = self.lock().capacity;
        if cost > capacity {
            return Err(GraphSyncError::InvalidArgument(format!(
                "cost {cost} exceeds rate limit capacity {capacity}"
            )));
        }
        Ok(())
    }

    /// Bucket capacity.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.lock().capacity
    }

    /// Tokens currently available (after a lazy refill).
    #[must_use]
    pub fn available(&self) -> u32 {
        let mut bucket = self.lock();
        bucket.refill(Instant::now());
        bucket.available
    }

    /// Time left until the next refill.
    #[must_use]
    pub fn next_refill_in(&self) -> Duration {
        self.lock()
            .next_refill
            .saturating_duration_since(Instant::now())
    }

    /// Takes `cost` tokens if available, without waiting.
    ///
    /// Returns `Ok(false)` and leaves the bucket untouched when there are not
    /// enough tokens.
    pub fn try_consume(&self, cost: u32, cancel: &CancellationToken) -> GraphResult<bool> {
        if cancel.is_cancelled() {
            return Err(GraphSyncError::Cancelled);
        }
        self.check_cost(cost)?;
        let taken = self.lock().try_take(cost, Instant::now());
        if taken {
            self.metrics.add_tokens(cost);
        }
        Ok(taken)
    }

    /// Takes `cost` tokens, sleeping until the next window whenever the bucket
    /// runs dry.
    pub async fn consume(&self, cost: u32, cancel: &CancellationToken) -> GraphResult<()> {
        self.check_cost(cost)?;
        let mut throttled = false;

        loop {
            if cancel.is_cancelled() {
                return Err(GraphSyncError::Cancelled);
            }

            let wait = {
                let mut bucket = self.lock();
                let now = Instant::now();
                if bucket.try_take(cost, now) {
                    None
                } else {
                    Some(
                        bucket
                            .next_refill
                            .saturating_duration_since(now)
                            .max(self.min_wait),
                    )
                }
            };

            let Some(wait) = wait else {
                self.metrics.add_tokens(cost);
                return Ok(());
            };

            if !throttled {
                throttled = true;
                self.metrics.increment_throttled_waits();
            }
            debug!(
                cost,
                wait_ms = wait.as_millis() as u64,
                "Rate limit exhausted, waiting for refill"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(GraphSyncError::Cancelled),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn limiter(capacity: u32, refill: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(
            RateLimitBucket::new(capacity, refill, Duration::from_secs(window_secs)),
            Duration::from_millis(10),
            Arc::new(TrafficMetrics::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_consume_deducts_exact_cost() {
        let limiter = limiter(10, 10, 60);
        let cancel = CancellationToken::new();

        assert!(limiter.try_consume(4, &cancel).unwrap());
        assert_eq!(limiter.available(), 6);
        assert!(limiter.try_consume(6, &cancel).unwrap());
        assert_eq!(limiter.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_consume_insufficient_leaves_state_unchanged() {
        let limiter = limiter(10, 10, 60);
        let cancel = CancellationToken::new();

        assert!(limiter.try_consume(8, &cancel).unwrap());
        assert!(!limiter.try_consume(3, &cancel).unwrap());
        assert_eq!(limiter.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cost_above_capacity_rejected() {
        let limiter = limiter(10, 10, 60);
        let cancel = CancellationToken::new();

        assert!(matches!(
            limiter.try_consume(11, &cancel),
            Err(GraphSyncError::InvalidArgument(_))
        ));
        assert!(matches!(
            limiter.consume(11, &cancel).await,
            Err(GraphSyncError::InvalidArgument(_))
        ));
        assert_eq!(limiter.available(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_once_per_window_capped_at_capacity() {
        let limiter = limiter(10, 4, 60);
        let cancel = CancellationToken::new();

        assert!(limiter.try_consume(9, &cancel).unwrap());
        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(limiter.available(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.available(), 5);

        // A long idle period still grants only one lump.
        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(limiter.available(), 9);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.available(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_does_not_overgrant_right_after_boundary() {
        let limiter = limiter(10, 5, 60);
        let cancel = CancellationToken::new();

        assert!(limiter.try_consume(10, &cancel).unwrap());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!limiter.try_consume(6, &cancel).unwrap());
        assert!(limiter.try_consume(5, &cancel).unwrap());
        assert!(!limiter.try_consume(1, &cancel).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_waits_for_next_window() {
        let limiter = limiter(10, 10, 30);
        let cancel = CancellationToken::new();

        limiter.consume(10, &cancel).await.unwrap();
        let start = Instant::now();
        limiter.consume(5, &cancel).await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(limiter.available(), 5);
        assert_eq!(limiter.metrics.snapshot().throttled_waits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_wait_consumes_nothing() {
        let limiter = Arc::new(limiter(10, 10, 60));
        let cancel = CancellationToken::new();
        limiter.consume(8, &cancel).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.consume(5, &cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(GraphSyncError::Cancelled)));
        assert_eq!(limiter.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_consumers_never_exceed_window_budget() {
        let capacity = 20;
        let refill = 15;
        let window = 10;
        let limiter = Arc::new(limiter(capacity, refill, window));
        let deducted = Arc::new(AtomicU64::new(0));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let limiter = limiter.clone();
            let deducted = deducted.clone();
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                for _ in 0..5 {
                    limiter.consume(2, &cancel).await.unwrap();
                    deducted.fetch_add(2, Ordering::SeqCst);
                    let elapsed = start.elapsed().as_secs();
                    let budget = u64::from(capacity) + u64::from(refill) * (elapsed / window);
                    assert!(deducted.load(Ordering::SeqCst) <= budget);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(deducted.load(Ordering::SeqCst), 160);
        let elapsed = start.elapsed().as_secs();
        assert!(160 <= u64::from(capacity) + u64::from(refill) * (elapsed / window));
    }
}

//! Traffic metrics for observability.
//!
//! Counters are shared by every component that talks to Graph and can be
//! read at any time through [`TrafficMetrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Live traffic counters.
#[derive(Debug, Default)]
pub struct TrafficMetrics {
    tokens_consumed: AtomicU64,
    throttled_waits: AtomicU64,
    retries: AtomicU64,
    batches_submitted: AtomicU64,
    items_succeeded: AtomicU64,
    items_suppressed: AtomicU64,
    items_retried: AtomicU64,
    items_failed: AtomicU64,
    pages_fetched: AtomicU64,
    total_retry_delay_ms: AtomicU64,
}

/// Point-in-time copy of [`TrafficMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrafficMetricsSnapshot {
    /// Rate limiter tokens deducted.
    pub tokens_consumed: u64,
    /// Times a caller had to sleep for tokens.
    pub throttled_waits: u64,
    /// Retries performed by the retry executor.
    pub retries: u64,
    /// `$batch` envelopes sent (including resubmissions).
    pub batches_submitted: u64,
    /// Batch items that succeeded.
    pub items_succeeded: u64,
    /// Batch items treated as success through suppression.
    pub items_suppressed: u64,
    /// Batch items scheduled for another pass.
    pub items_retried: u64,
    /// Batch items that failed.
    pub items_failed: u64,
    /// Pages read by page streams.
    pub pages_fetched: u64,
    /// Sum of all backoff delays in milliseconds.
    pub total_retry_delay_ms: u64,
}

impl TrafficMetricsSnapshot {
    /// Average backoff delay in milliseconds.
    #[must_use]
    pub fn average_retry_delay_ms(&self) -> u64 {
        if self.retries == 0 {
            0
        } else {
            self.total_retry_delay_ms / self.retries
        }
    }
}

impl TrafficMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_tokens(&self, cost: u32) {
        self.tokens_consumed
            .fetch_add(u64::from(cost), Ordering::Relaxed);
    }

    pub(crate) fn increment_throttled_waits(&self) {
        self.throttled_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self, delay_ms: u64) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        self.total_retry_delay_ms
            .fetch_add(delay_ms, Ordering::Relaxed);
    }

    pub(crate) fn increment_batches(&self) {
        self.batches_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_pages(&self) {
        self.pages_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_items(
        &self,
        succeeded: usize,
        suppressed: usize,
        retried: usize,
        failed: usize,
    ) {
        self.items_succeeded
            .fetch_add(succeeded as u64, Ordering::Relaxed);
        self.items_suppressed
            .fetch_add(suppressed as u64, Ordering::Relaxed);
        self.items_retried
            .fetch_add(retried as u64, Ordering::Relaxed);
        self.items_failed
            .fetch_add(failed as u64, Ordering::Relaxed);
    }

    /// Returns a copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> TrafficMetricsSnapshot {
        TrafficMetricsSnapshot {
            tokens_consumed: self.tokens_consumed.load(Ordering::Relaxed),
            throttled_waits: self.throttled_waits.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            batches_submitted: self.batches_submitted.load(Ordering::Relaxed),
            items_succeeded: self.items_succeeded.load(Ordering::Relaxed),
            items_suppressed: self.items_suppressed.load(Ordering::Relaxed),
            items_retried: self.items_retried.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            total_retry_delay_ms: self.total_retry_delay_ms.load(Ordering::Relaxed),
        }
    }
}

//! Linear-backoff retry logic for single units of Graph work.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::TrafficMetrics;
use crate::rate_limit::RateLimiter;
use crate::{GraphResult, GraphSyncConfig, GraphSyncError};

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed, counting the first one.
    pub max_retries: u32,
    /// Delay step; attempt `n` waits `base_delay * n`.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&GraphSyncConfig::default())
    }
}

impl RetryPolicy {
    /// Creates a retry policy.
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Policy for single calls described by `config`.
    #[must_use]
    pub fn from_config(config: &GraphSyncConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_secs(config.base_delay_secs),
        )
    }

    /// Delay after the failed `attempt` (1-based).
    ///
    /// `base_delay * attempt`, raised to the server's `Retry-After` hint when
    /// the error carries a larger one.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, error: &GraphSyncError) -> Duration {
        let linear = self.base_delay.saturating_mul(attempt);
        error.retry_after().map_or(linear, |hint| hint.max(linear))
    }
}

/// Default classifier: timeouts, bad gateways, throttling and 404-on-lookup.
#[must_use]
pub fn default_classifier(error: &GraphSyncError) -> bool {
    error.is_retryable()
}

/// Runs units of work behind the shared rate limiter, retrying classified
/// failures.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<TrafficMetrics>,
}

impl RetryExecutor {
    /// Creates a retry executor.
    #[must_use]
    pub fn new(
        policy: RetryPolicy,
        rate_limiter: Arc<RateLimiter>,
        metrics: Arc<TrafficMetrics>,
    ) -> Self {
        Self {
            policy,
            rate_limiter,
            metrics,
        }
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns the shared rate limiter.
    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Executes `unit`, consuming `cost` tokens before every attempt.
    ///
    /// Failures for which `classifier` returns `true` are retried with linear
    /// backoff until `max_retries` attempts have been made; the last failure
    /// is then returned unchanged. Other failures, and cancellation, are
    /// returned immediately.
    pub async fn execute<T, F, Fut, C>(
        &self,
        cost: u32,
        classifier: C,
        cancel: &CancellationToken,
        mut unit: F,
    ) -> GraphResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GraphResult<T>>,
        C: Fn(&GraphSyncError) -> bool,
    {
        let mut attempt: u32 = 1;

        loop {
            self.rate_limiter.consume(cost, cancel).await?;

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(GraphSyncError::Cancelled),
                result = unit() => result,
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if error.is_cancelled() || !classifier(&error) {
                return Err(error);
            }

            if attempt >= self.policy.max_retries {
                warn!(
                    attempts = attempt,
                    error = %error,
                    "Max retries exceeded"
                );
                return Err(error);
            }

            let delay = self.policy.delay_for(attempt, &error);
            debug!(
                attempt,
                max_retries = self.policy.max_retries,
                delay_secs = delay.as_secs(),
                error = %error,
                "Retrying after transient error"
            );
            self.metrics.record_retry(delay.as_millis() as u64);

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(GraphSyncError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// [`execute`](Self::execute) with [`default_classifier`].
    pub async fn execute_default<T, F, Fut>(
        &self,
        cost: u32,
        cancel: &CancellationToken,
        unit: F,
    ) -> GraphResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GraphResult<T>>,
    {
        self.execute(cost, default_classifier, cancel, unit).await
    }
}

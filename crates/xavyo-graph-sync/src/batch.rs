//! Chunked `$batch` submission with per-item classification and selective
//! resubmission.
//!
//! Operations are cut into ordered chunks of at most `batch_size` items.
//! Every chunk is one `$batch` envelope sent through the [`RetryExecutor`].
//! After a full pass the items that came back retryable (throttled, or not
//! found yet) are resubmitted together, and only those.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::error::{is_already_exists, BatchItemError};
use crate::graph_client::{BatchRequestItem, BatchResponseItem, GraphTransport};
use crate::metrics::TrafficMetrics;
use crate::operation::Operation;
use crate::retry::RetryExecutor;
use crate::{GraphResult, GraphSyncConfig, GraphSyncError};

/// Outcomes to treat as success because the desired end state already holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOptions {
    /// Treat 404 as success (idempotent delete).
    pub suppress_not_found: bool,
    /// Treat "object references already exist" as success (idempotent add).
    pub suppress_already_exists: bool,
}

impl BatchOptions {
    /// Options for delete operations.
    #[must_use]
    pub fn deletes() -> Self {
        Self {
            suppress_not_found: true,
            suppress_already_exists: false,
        }
    }

    /// Options for add operations.
    #[must_use]
    pub fn adds() -> Self {
        Self {
            suppress_not_found: false,
            suppress_already_exists: true,
        }
    }
}

/// Classified result of one batch item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// 2xx response.
    Success,
    /// An error the batch options treat as already done.
    SuppressedSuccess,
    /// Throttled or transient; resend in a later pass.
    Retryable { retry_after: Option<Duration> },
    /// Terminal failure.
    Failed(BatchItemError),
}

/// Summary of a completed batch submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Ids that succeeded, in completion-pass order.
    pub succeeded: Vec<String>,
    /// Ids whose error was suppressed.
    pub suppressed: Vec<String>,
    /// Ids sent again, once per resubmission.
    pub resubmitted: Vec<String>,
    /// Submission passes made.
    pub passes: u32,
}

impl BatchReport {
    /// Number of operations that reached their desired end state.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.succeeded.len() + self.suppressed.len()
    }

    /// Folds a later submission into this report.
    pub fn merge(&mut self, other: BatchReport) {
        self.succeeded.extend(other.succeeded);
        self.suppressed.extend(other.suppressed);
        self.resubmitted.extend(other.resubmitted);
        self.passes += other.passes;
    }
}

/// Classifies one batch response item.
///
/// `retries_remain` is false on the last pass, where throttled and
/// not-found items become failures.
#[must_use]
pub fn classify(
    response: &BatchResponseItem,
    options: BatchOptions,
    retries_remain: bool,
) -> ItemOutcome {
    let status = response.status;
    if (200..300).contains(&status) {
        return ItemOutcome::Success;
    }

    let (code, message) = match response.error() {
        Some(error) => (Some(error.code), error.message),
        None => (None, format!("HTTP {status}")),
    };

    match status {
        404 if options.suppress_not_found => ItemOutcome::SuppressedSuccess,
        400 if options.suppress_already_exists
            && is_already_exists(code.as_deref().unwrap_or_default(), &message) =>
        {
            ItemOutcome::SuppressedSuccess
        }
        429 if retries_remain => ItemOutcome::Retryable {
            retry_after: response.retry_after(),
        },
        404 if retries_remain => ItemOutcome::Retryable { retry_after: None },
        _ => ItemOutcome::Failed(BatchItemError::new(response.id.clone(), status, code, message)),
    }
}

/// Submits named operations as `$batch` envelopes.
#[derive(Clone)]
pub struct BatchExecutor {
    transport: Arc<dyn GraphTransport>,
    retry: RetryExecutor,
    batch_size: usize,
    max_passes: u32,
    backoff_step: Duration,
    metrics: Arc<TrafficMetrics>,
}

impl std::fmt::Debug for BatchExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchExecutor")
            .field("batch_size", &self.batch_size)
            .field("max_passes", &self.max_passes)
            .field("backoff_step", &self.backoff_step)
            .finish_non_exhaustive()
    }
}

impl BatchExecutor {
    /// Creates a batch executor.
    #[must_use]
    pub fn new(
        transport: Arc<dyn GraphTransport>,
        retry: RetryExecutor,
        config: &GraphSyncConfig,
        metrics: Arc<TrafficMetrics>,
    ) -> Self {
        Self {
            transport,
            retry,
            batch_size: config.batch_size,
            max_passes: config.max_retries,
            backoff_step: Duration::from_secs(config.batch_backoff_secs),
            metrics,
        }
    }

    /// Operations per envelope.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Delay before pass `attempt + 1`.
    fn pass_delay(&self, attempt: u32, largest_hint: Option<Duration>) -> Duration {
        let linear = self.backoff_step.saturating_mul(attempt);
        largest_hint.map_or(linear, |hint| hint.max(linear))
    }

    /// Submits `operations`, resubmitting retryable items until they settle
    /// or the pass limit is reached.
    ///
    /// All chunks of a pass are sent even when earlier chunks failed. If any
    /// item failed, a single item error or an aggregate of all failures is
    /// returned and no further pass is made.
    #[instrument(skip(self, operations, cancel), fields(operations = operations.len()))]
    pub async fn submit(
        &self,
        operations: Vec<Operation>,
        options: BatchOptions,
        cancel: &CancellationToken,
    ) -> GraphResult<BatchReport> {
        {
            let mut seen = HashSet::with_capacity(operations.len());
            for op in &operations {
                if !seen.insert(op.id()) {
                    return Err(GraphSyncError::InvalidArgument(format!(
                        "duplicate correlation id {}",
                        op.id()
                    )));
                }
            }
        }

        let mut report = BatchReport::default();
        if operations.is_empty() {
            return Ok(report);
        }

        let originals: HashMap<String, Operation> = operations
            .iter()
            .map(|op| (op.id().to_string(), op.clone()))
            .collect();
        let mut pending = operations;
        let mut attempt: u32 = 1;

        loop {
            let retries_remain = attempt < self.max_passes;
            let outcomes = self
                .submit_pass(&pending, options, retries_remain, cancel)
                .await?;
            report.passes = attempt;

            let mut failures = Vec::new();
            let mut retryable = Vec::new();
            let mut largest_hint: Option<Duration> = None;
            let (mut succeeded, mut suppressed) = (0, 0);

            for (id, outcome) in outcomes {
                match outcome {
                    ItemOutcome::Success => {
                        succeeded += 1;
                        report.succeeded.push(id);
                    }
                    ItemOutcome::SuppressedSuccess => {
                        suppressed += 1;
                        report.suppressed.push(id);
                    }
                    ItemOutcome::Retryable { retry_after } => {
                        largest_hint = largest_hint.max(retry_after);
                        retryable.push(id);
                    }
                    ItemOutcome::Failed(error) => failures.push(error),
                }
            }
            self.metrics
                .record_items(succeeded, suppressed, retryable.len(), failures.len());

            if let Some(error) = GraphSyncError::from_failures(failures) {
                warn!(
                    pass = attempt,
                    error = %error,
                    "Batch pass finished with failures"
                );
                return Err(error);
            }

            if retryable.is_empty() {
                debug!(passes = attempt, "Batch submission complete");
                return Ok(report);
            }

            let delay = self.pass_delay(attempt, largest_hint);
            info!(
                pass = attempt,
                retryable = retryable.len(),
                delay_secs = delay.as_secs(),
                "Resubmitting retryable batch items"
            );
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(GraphSyncError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }

            pending = retryable
                .iter()
                .filter_map(|id| originals.get(id).cloned())
                .collect();
            report.resubmitted.extend(retryable);
            attempt += 1;
        }
    }

    /// Sends every chunk of `operations` once and classifies each item.
    async fn submit_pass(
        &self,
        operations: &[Operation],
        options: BatchOptions,
        retries_remain: bool,
        cancel: &CancellationToken,
    ) -> GraphResult<Vec<(String, ItemOutcome)>> {
        let mut outcomes = Vec::with_capacity(operations.len());
        let transport = &self.transport;
        let metrics = &self.metrics;

        for chunk in operations.chunks(self.batch_size) {
            // The envelope itself counts against the rate limit.
            let cost = chunk.len() as u32 + 1;

            let result = self
                .retry
                .execute_default(cost, cancel, || {
                    let items: Vec<BatchRequestItem> = chunk
                        .iter()
                        .map(|op| BatchRequestItem {
                            id: op.id().to_string(),
                            request: op.build(),
                        })
                        .collect();
                    trace!(items = ?items, "Submitting batch envelope");
                    metrics.increment_batches();
                    async move { transport.send_batch(items).await }
                })
                .await;

            match result {
                Ok(responses) => {
                    trace!(responses = ?responses, "Batch envelope answered");
                    outcomes.extend(Self::classify_chunk(
                        chunk,
                        responses,
                        options,
                        retries_remain,
                    ));
                }
                Err(error) if error.is_cancelled() => return Err(error),
                Err(error) => {
                    warn!(items = chunk.len(), error = %error, "Batch envelope failed");
                    let status = error.status().unwrap_or(0);
                    let message = error.to_string();
                    outcomes.extend(chunk.iter().map(|op| {
                        (
                            op.id().to_string(),
                            ItemOutcome::Failed(BatchItemError::new(
                                op.id(),
                                status,
                                None,
                                message.clone(),
                            )),
                        )
                    }));
                }
            }
        }

        Ok(outcomes)
    }

    fn classify_chunk(
        chunk: &[Operation],
        responses: Vec<BatchResponseItem>,
        options: BatchOptions,
        retries_remain: bool,
    ) -> Vec<(String, ItemOutcome)> {
        let mut by_id: HashMap<String, BatchResponseItem> = responses
            .into_iter()
            .map(|response| (response.id.clone(), response))
            .collect();

        let outcomes = chunk
            .iter()
            .map(|op| {
                let outcome = match by_id.remove(op.id()) {
                    Some(response) => {
                        let outcome = classify(&response, options, retries_remain);
                        if outcome == ItemOutcome::SuppressedSuccess {
                            warn!(
                                id = op.id(),
                                status = response.status,
                                "Expected error suppressed, treating as success"
                            );
                        }
                        outcome
                    }
                    None => ItemOutcome::Failed(BatchItemError::new(
                        op.id(),
                        0,
                        None,
                        "no response returned for batch item",
                    )),
                };
                (op.id().to_string(), outcome)
            })
            .collect();

        if !by_id.is_empty() {
            debug!(
                unexpected = by_id.len(),
                "Ignoring responses for unknown batch ids"
            );
        }
        outcomes
    }
}

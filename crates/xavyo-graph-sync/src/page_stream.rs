//! Paged and delta reads drained into one ordered record sequence.
//!
//! Delta feeds may split one changed object across several adjacent
//! records (large membership changes in particular). In delta mode adjacent
//! records with the same id are folded back into one logical record before
//! they reach the caller.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::graph_client::{GraphTransport, ODataResponse};
use crate::metrics::TrafficMetrics;
use crate::retry::RetryExecutor;
use crate::{GraphResult, GraphSyncError};

/// Opaque delta resumption token, persisted and replayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeltaWatermark(String);

impl DeltaWatermark {
    /// Wraps a stored delta link.
    pub fn new(link: impl Into<String>) -> Self {
        Self(link.into())
    }

    /// The delta link.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Unwraps into the delta link.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for DeltaWatermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How pages of a request are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMode {
    /// Plain list pagination; every record is emitted as is.
    Standard,
    /// Delta query; fragments are merged and the delta link is captured.
    Delta,
}

/// Starting point of a paged read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    url: String,
    mode: PageMode,
}

impl PageRequest {
    /// A list read, e.g. `/groups/{id}/members?$select=id`.
    pub fn standard(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mode: PageMode::Standard,
        }
    }

    /// A fresh delta read, e.g. `/groups/delta?$select=members`.
    pub fn delta(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mode: PageMode::Delta,
        }
    }

    /// Continues a delta read from a stored watermark.
    #[must_use]
    pub fn resume(watermark: &DeltaWatermark) -> Self {
        Self::delta(watermark.as_str())
    }

    /// First page to fetch.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Standard or delta read.
    #[must_use]
    pub fn mode(&self) -> PageMode {
        self.mode
    }

    /// Whether the read produces a watermark.
    #[must_use]
    pub fn is_delta(&self) -> bool {
        self.mode == PageMode::Delta
    }
}

/// One logical directory record.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalRecord {
    value: Value,
}

impl LogicalRecord {
    /// Wraps one JSON object from a page.
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    /// The record's `id`, when present.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.value.get("id").and_then(Value::as_str)
    }

    /// Whether a delta feed marked this record as removed.
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.value.get("@removed").is_some()
    }

    /// Field map of the record; `None` for non-object payloads.
    #[must_use]
    pub fn fields(&self) -> Option<&Map<String, Value>> {
        self.value.as_object()
    }

    /// Unwraps into the merged JSON object.
    #[must_use]
    pub fn into_value(self) -> Value {
        self.value
    }

    /// Folds a later fragment of the same object into this record.
    ///
    /// Arrays present in both fragments are concatenated; any other field of
    /// the later fragment replaces the earlier value.
    fn absorb(&mut self, fragment: LogicalRecord) {
        let Value::Object(incoming) = fragment.value else {
            self.value = fragment.value;
            return;
        };
        let Value::Object(fields) = &mut self.value else {
            self.value = Value::Object(incoming);
            return;
        };

        for (key, value) in incoming {
            match (fields.get_mut(&key), value) {
                (Some(Value::Array(existing)), Value::Array(more)) => existing.extend(more),
                (_, value) => {
                    fields.insert(key, value);
                }
            }
        }
    }
}

impl From<Value> for LogicalRecord {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

/// Buffered result of a drained stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOutcome {
    /// Records in first-seen order, fragments merged.
    pub records: Vec<LogicalRecord>,
    /// Delta link of the last page; `None` for standard reads.
    pub watermark: Option<DeltaWatermark>,
}

/// Drains paged reads through the retry executor.
#[derive(Clone)]
pub struct PageStream {
    transport: Arc<dyn GraphTransport>,
    retry: RetryExecutor,
    metrics: Arc<TrafficMetrics>,
}

impl fmt::Debug for PageStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageStream").finish_non_exhaustive()
    }
}

impl PageStream {
    /// Creates a stream reading through `transport`.
    #[must_use]
    pub fn new(
        transport: Arc<dyn GraphTransport>,
        retry: RetryExecutor,
        metrics: Arc<TrafficMetrics>,
    ) -> Self {
        Self {
            transport,
            retry,
            metrics,
        }
    }

    async fn fetch_page(
        &self,
        url: &str,
        delta: bool,
        cancel: &CancellationToken,
    ) -> GraphResult<ODataResponse<Value>> {
        let transport = &self.transport;
        let page = self
            .retry
            .execute_default(1, cancel, || transport.get_page(url))
            .await
            .map_err(|e| {
                if delta {
                    if let GraphSyncError::GraphApi { ref code, .. } = e {
                        if code.contains("resyncRequired") || code.contains("syncStateNotFound") {
                            return GraphSyncError::DeltaTokenExpired;
                        }
                    }
                }
                e
            })?;
        self.metrics.increment_pages();
        Ok(page)
    }

    /// Streams every logical record of `request` to `sink`, page by page.
    ///
    /// Returns the delta watermark of the final page, if the server sent one.
    /// An error from `sink` stops the read and is returned as is.
    #[instrument(skip(self, cancel, sink), fields(url = %request.url(), mode = ?request.mode()))]
    pub async fn for_each<F>(
        &self,
        request: &PageRequest,
        cancel: &CancellationToken,
        mut sink: F,
    ) -> GraphResult<Option<DeltaWatermark>>
    where
        F: FnMut(LogicalRecord) -> GraphResult<()>,
    {
        let delta = request.is_delta();
        let mut next = Some(request.url().to_string());
        let mut pending: Option<LogicalRecord> = None;
        let mut watermark = None;
        let mut pages: u32 = 0;

        while let Some(url) = next.take() {
            let page = self.fetch_page(&url, delta, cancel).await?;
            pages += 1;
            debug!(page = pages, records = page.value.len(), "Processing page");

            for value in page.value {
                let record = LogicalRecord::new(value);
                if !delta {
                    sink(record)?;
                    continue;
                }

                let continues_pending = match (&pending, record.id()) {
                    (Some(current), Some(id)) => current.id() == Some(id),
                    _ => false,
                };
                if continues_pending {
                    if let Some(current) = pending.as_mut() {
                        current.absorb(record);
                    }
                } else if let Some(done) = pending.replace(record) {
                    sink(done)?;
                }
            }

            next = page.next_link;
            if next.is_none() {
                watermark = page.delta_link.map(DeltaWatermark::new);
            }
        }

        if let Some(done) = pending.take() {
            sink(done)?;
        }

        info!(
            pages,
            has_watermark = watermark.is_some(),
            "Paged read complete"
        );
        Ok(watermark)
    }

    /// Drains `request` into memory.
    pub async fn collect(
        &self,
        request: &PageRequest,
        cancel: &CancellationToken,
    ) -> GraphResult<StreamOutcome> {
        let mut records = Vec::new();
        let watermark = self
            .for_each(request, cancel, |record| {
                records.push(record);
                Ok(())
            })
            .await?;
        Ok(StreamOutcome { records, watermark })
    }
}

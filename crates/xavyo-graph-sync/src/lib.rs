//! Microsoft Graph traffic control for xavyo
//!
//! This crate sits between directory-synchronization logic and the
//! Microsoft Graph API. Every call passes through a shared rate limiter and
//! a retry executor; writes are grouped into `$batch` envelopes and
//! membership changes are ordered so an entity never loses its last owner.
//!
//! # Features
//!
//! - Windowed token-bucket rate limiting shared by all callers
//! - Linear-backoff retries honoring `Retry-After`
//! - Chunked `$batch` submission with per-item suppression and resubmission
//! - Paged and delta reads with fragment merging and delta watermarks
//! - Owner-safe membership reconciliation for groups and Teams channels
//! - Bounded-parallel reconciliation of many entities
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use xavyo_graph_sync::{
//!     GraphSync, GraphSyncConfig, MembershipDelta, MembershipState, StaticTokenProvider,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let sync = GraphSync::with_http(
//!     GraphSyncConfig::default(),
//!     Arc::new(StaticTokenProvider::new("access-token")),
//! )?;
//!
//! let group = sync.group("group-id");
//! let current = MembershipState::new(["user-1"], ["owner-1"]);
//! let delta = MembershipDelta {
//!     member_adds: vec!["user-2".into()],
//!     ..Default::default()
//! };
//!
//! let report = sync
//!     .submit_reconciliation(&group, &current, &delta, &CancellationToken::new())
//!     .await?;
//! println!("{} phases executed", report.phases.len());
//! # Ok(())
//! # }
//! ```

pub mod batch;
mod config;
mod error;
pub mod graph_client;
pub mod membership;
mod metrics;
mod operation;
pub mod page_stream;
pub mod pool;
mod rate_limit;
mod retry;

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

// Re-exports
pub use batch::{BatchExecutor, BatchOptions, BatchReport, ItemOutcome};
pub use config::{
    options, ConfigSource, EnvConfigSource, GraphSyncConfig, MapConfigSource, GRAPH_BATCH_LIMIT,
};
pub use error::{is_already_exists, BatchItemError, ErrorKind, GraphResult, GraphSyncError};
pub use graph_client::{
    AccessTokenProvider, BatchRequestItem, BatchResponseItem, GraphTransport, HttpGraphTransport,
    ODataResponse, StaticTokenProvider,
};
pub use membership::{
    plan_reconciliation, ChannelMembership, GroupMembership, MemberRole, MembershipDelta,
    MembershipOperation, MembershipReconciler, MembershipRequests, MembershipState, PlanPhase,
    ReconciliationPlan, ReconciliationReport,
};
pub use metrics::{TrafficMetrics, TrafficMetricsSnapshot};
pub use operation::{GraphRequest, Method, Operation, RequestFactory};
pub use page_stream::{DeltaWatermark, LogicalRecord, PageRequest, PageStream, StreamOutcome};
pub use pool::{JobResult, ReconciliationJob, ReconciliationPool};
pub use rate_limit::{RateLimitBucket, RateLimiter};
pub use retry::{default_classifier, RetryExecutor, RetryPolicy};

/// Entry point wiring every component to one transport and one rate limiter.
#[derive(Debug, Clone)]
pub struct GraphSync {
    config: GraphSyncConfig,
    metrics: Arc<TrafficMetrics>,
    retry: RetryExecutor,
    batch: BatchExecutor,
    pages: PageStream,
    reconciler: MembershipReconciler,
}

impl GraphSync {
    /// Creates the facade over `transport`.
    ///
    /// # Errors
    ///
    /// Returns `GraphSyncError::Config` if the configuration is invalid.
    pub fn new(config: GraphSyncConfig, transport: Arc<dyn GraphTransport>) -> GraphResult<Self> {
        config.validate()?;

        let metrics = Arc::new(TrafficMetrics::new());
        let rate_limiter = Arc::new(RateLimiter::from_config(&config, metrics.clone()));
        let retry = RetryExecutor::new(
            RetryPolicy::from_config(&config),
            rate_limiter,
            metrics.clone(),
        );
        let batch = BatchExecutor::new(transport.clone(), retry.clone(), &config, metrics.clone());
        let pages = PageStream::new(transport, retry.clone(), metrics.clone());
        let reconciler = MembershipReconciler::new(batch.clone(), config.max_owners);

        Ok(Self {
            config,
            metrics,
            retry,
            batch,
            pages,
            reconciler,
        })
    }

    /// Creates the facade over a reqwest transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn with_http(
        config: GraphSyncConfig,
        token_provider: Arc<dyn AccessTokenProvider>,
    ) -> GraphResult<Self> {
        config.validate()?;
        let transport = Arc::new(HttpGraphTransport::new(&config, token_provider)?);
        Self::new(config, transport)
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &GraphSyncConfig {
        &self.config
    }

    /// Shared traffic counters.
    #[must_use]
    pub fn metrics(&self) -> &Arc<TrafficMetrics> {
        &self.metrics
    }

    /// The rate limiter every call goes through.
    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        self.retry.rate_limiter()
    }

    /// Planner and executor behind the reconciliation calls.
    #[must_use]
    pub fn reconciler(&self) -> &MembershipReconciler {
        &self.reconciler
    }

    /// Membership target for a group, using the configured API root.
    #[must_use]
    pub fn group(&self, group_id: impl Into<String>) -> GroupMembership {
        GroupMembership::new(group_id).with_base_url(self.config.graph_base_url.as_str())
    }

    /// Membership target for a Teams channel, using the configured API root.
    pub fn channel<I, K, V>(
        &self,
        team_id: impl Into<String>,
        channel_id: impl Into<String>,
        membership_ids: I,
    ) -> ChannelMembership
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        ChannelMembership::new(team_id, channel_id, membership_ids)
            .with_base_url(self.config.graph_base_url.as_str())
    }

    /// Plans a reconciliation without sending anything.
    pub fn plan_reconciliation(
        &self,
        target: &dyn MembershipRequests,
        current: &MembershipState,
        delta: &MembershipDelta,
    ) -> GraphResult<ReconciliationPlan> {
        self.reconciler.plan(target, current, delta)
    }

    /// Plans and executes the membership change of one entity.
    pub async fn submit_reconciliation(
        &self,
        target: &dyn MembershipRequests,
        current: &MembershipState,
        delta: &MembershipDelta,
        cancel: &CancellationToken,
    ) -> GraphResult<ReconciliationReport> {
        self.reconciler
            .reconcile(target, current, delta, cancel)
            .await
    }

    /// Drains a paged or delta read into memory.
    pub async fn stream(
        &self,
        request: &PageRequest,
        cancel: &CancellationToken,
    ) -> GraphResult<StreamOutcome> {
        self.pages.collect(request, cancel).await
    }

    /// Streams a paged or delta read to `sink`, returning the watermark.
    pub async fn stream_each<F>(
        &self,
        request: &PageRequest,
        cancel: &CancellationToken,
        sink: F,
    ) -> GraphResult<Option<DeltaWatermark>>
    where
        F: FnMut(LogicalRecord) -> GraphResult<()>,
    {
        self.pages.for_each(request, cancel, sink).await
    }

    /// Runs a caller-defined unit of work behind the rate limiter with
    /// retries.
    pub async fn execute_with_retry<T, F, Fut, C>(
        &self,
        cost: u32,
        classifier: C,
        cancel: &CancellationToken,
        unit: F,
    ) -> GraphResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GraphResult<T>>,
        C: Fn(&GraphSyncError) -> bool,
    {
        self.retry.execute(cost, classifier, cancel, unit).await
    }

    /// Submits independent operations as `$batch` envelopes.
    pub async fn submit_batch(
        &self,
        operations: Vec<Operation>,
        options: BatchOptions,
        cancel: &CancellationToken,
    ) -> GraphResult<BatchReport> {
        self.batch.submit(operations, options, cancel).await
    }

    /// Worker pool for reconciling many entities at once.
    #[must_use]
    pub fn pool(&self) -> ReconciliationPool {
        ReconciliationPool::new(self.reconciler.clone(), self.config.max_parallelism)
    }
}

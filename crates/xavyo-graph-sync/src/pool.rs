//! Bounded-parallel reconciliation of many entities.
//!
//! Each entity is reconciled sequentially by one task; up to
//! `max_parallelism` entities run at once. All tasks share the same rate
//! limiter through the cloned [`MembershipReconciler`].

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::membership::{
    MembershipDelta, MembershipReconciler, MembershipRequests, MembershipState,
    ReconciliationReport,
};
use crate::{GraphResult, GraphSyncError};

/// Reconciliation of one entity.
#[derive(Clone)]
pub struct ReconciliationJob {
    /// Group or channel to reconcile.
    pub target: Arc<dyn MembershipRequests>,
    /// Membership as last read.
    pub current: MembershipState,
    /// Change to apply.
    pub delta: MembershipDelta,
}

impl ReconciliationJob {
    /// Bundles a target with its current state and delta.
    pub fn new(
        target: Arc<dyn MembershipRequests>,
        current: MembershipState,
        delta: MembershipDelta,
    ) -> Self {
        Self {
            target,
            current,
            delta,
        }
    }
}

impl std::fmt::Debug for ReconciliationJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationJob")
            .field("target", &self.target.target_id())
            .field("delta", &self.delta)
            .finish_non_exhaustive()
    }
}

/// Result for one job.
#[derive(Debug)]
pub struct JobResult {
    /// Id of the entity the job targeted.
    pub target_id: String,
    /// Report, or the error that stopped this entity.
    pub result: GraphResult<ReconciliationReport>,
}

/// Runs reconciliation jobs with bounded parallelism.
#[derive(Debug, Clone)]
pub struct ReconciliationPool {
    reconciler: MembershipReconciler,
    semaphore: Arc<Semaphore>,
    max_parallelism: usize,
}

impl ReconciliationPool {
    /// Creates a pool; `max_parallelism` is clamped to at least 1.
    #[must_use]
    pub fn new(reconciler: MembershipReconciler, max_parallelism: usize) -> Self {
        let max_parallelism = max_parallelism.max(1);
        Self {
            reconciler,
            semaphore: Arc::new(Semaphore::new(max_parallelism)),
            max_parallelism,
        }
    }

    /// Upper bound on concurrently running jobs.
    #[must_use]
    pub fn max_parallelism(&self) -> usize {
        self.max_parallelism
    }

    /// Runs every job and returns one result per job, in submission order.
    ///
    /// A failing job does not stop the others. Cancelling `cancel` makes
    /// queued and in-flight jobs finish with `Cancelled`.
    #[instrument(skip(self, jobs, cancel), fields(jobs = jobs.len()))]
    pub async fn run(
        &self,
        jobs: Vec<ReconciliationJob>,
        cancel: &CancellationToken,
    ) -> Vec<JobResult> {
        info!(
            max_parallelism = self.max_parallelism,
            "Starting reconciliation pool"
        );

        let target_ids: Vec<String> = jobs
            .iter()
            .map(|job| job.target.target_id().to_string())
            .collect();
        let mut join_set = JoinSet::new();

        for (index, job) in jobs.into_iter().enumerate() {
            let reconciler = self.reconciler.clone();
            let semaphore = self.semaphore.clone();
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let result: GraphResult<ReconciliationReport> = async {
                    let _permit = tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(GraphSyncError::Cancelled),
                        permit = semaphore.acquire_owned() => permit
                            .map_err(|e| GraphSyncError::TaskFailed(e.to_string()))?,
                    };
                    reconciler
                        .reconcile(job.target.as_ref(), &job.current, &job.delta, &cancel)
                        .await
                }
                .await;
                (index, result)
            });
        }

        let mut results: Vec<Option<GraphResult<ReconciliationReport>>> = Vec::new();
        results.resize_with(target_ids.len(), || None);

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => {
                    if let Err(ref e) = result {
                        warn!(
                            target_id = %target_ids[index],
                            error = %e,
                            "Reconciliation failed"
                        );
                    }
                    results[index] = Some(result);
                }
                Err(e) => error!(error = %e, "Reconciliation task panicked"),
            }
        }

        target_ids
            .into_iter()
            .zip(results)
            .map(|(target_id, result)| JobResult {
                result: result.unwrap_or_else(|| {
                    Err(GraphSyncError::TaskFailed(format!(
                        "task for {target_id} did not complete"
                    )))
                }),
                target_id,
            })
            .collect()
    }
}

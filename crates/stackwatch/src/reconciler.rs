// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciler - writes a drifted stack's resource-level drift snapshot.
//!
//! Runs only for jobs that completed with a `DRIFTED` stack status. The
//! remote detail fetch is bounded by the remote timeout; when it fails the job
//! stays `COMPLETE` with `reconciled_at` unset and the orchestrator retries on
//! the next tick. Detail-fetch failure never turns into a job failure.
//!
//! The snapshot is replaced wholesale inside the store, so reconciling the
//! same job twice against the same remote data leaves the same rows.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Error, Result, deadline};
use crate::gateway::{DriftGateway, RemoteScope};
use crate::store::JobStore;
use crate::types::{DriftJob, JobStatus, SnapshotApply, StackDriftStatus};

/// What a reconciliation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The snapshot was replaced with `resources` rows.
    Applied {
        /// Rows written.
        resources: u64,
    },
    /// A newer job exists for the stack; nothing was written.
    Superseded,
    /// The stack record is gone; the job was stamped without writing rows.
    StackMissing,
}

/// Writes drift snapshots for completed, drifted jobs.
pub struct Reconciler {
    store: Arc<dyn JobStore>,
    gateway: Arc<dyn DriftGateway>,
    remote_timeout: Duration,
}

impl Reconciler {
    /// Create a reconciler.
    pub fn new(
        store: Arc<dyn JobStore>,
        gateway: Arc<dyn DriftGateway>,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            remote_timeout,
        }
    }

    /// Fetch the job's resource drifts and replace the stack's snapshot.
    ///
    /// Jobs that did not complete as drifted are rejected with
    /// [`Error::Inconsistent`] before any remote call.
    pub async fn reconcile(&self, job: &DriftJob, scope: &RemoteScope) -> Result<ReconcileOutcome> {
        if !is_drifted_completion(job) {
            return Err(Error::Inconsistent(format!(
                "job {} is {} with drift status {}, not a drifted completion",
                job.remote_operation_id,
                job.status,
                job.drift_status
                    .map(|s| s.as_str())
                    .unwrap_or("none")
            )));
        }

        let drifts = deadline(
            self.remote_timeout,
            self.gateway
                .describe_resource_drifts(scope, &job.stack_name),
        )
        .await?;

        debug!(
            remote_operation_id = %job.remote_operation_id,
            resources = drifts.len(),
            "Fetched resource drifts"
        );

        let outcome = match self.store.apply_drift_snapshot(job, &drifts).await? {
            SnapshotApply::Applied(resources) => {
                info!(
                    remote_operation_id = %job.remote_operation_id,
                    stack = %job.stack_key(),
                    resources = resources,
                    "Drift snapshot replaced"
                );
                ReconcileOutcome::Applied { resources }
            }
            SnapshotApply::Superseded => {
                info!(
                    remote_operation_id = %job.remote_operation_id,
                    stack = %job.stack_key(),
                    "Skipping drift snapshot, a newer job exists for the stack"
                );
                ReconcileOutcome::Superseded
            }
            SnapshotApply::StackMissing => {
                info!(
                    remote_operation_id = %job.remote_operation_id,
                    stack = %job.stack_key(),
                    "Stack record no longer exists, nothing to reconcile"
                );
                ReconcileOutcome::StackMissing
            }
        };

        Ok(outcome)
    }
}

fn is_drifted_completion(job: &DriftJob) -> bool {
    job.status == JobStatus::Complete && job.drift_status == Some(StackDriftStatus::Drifted)
}

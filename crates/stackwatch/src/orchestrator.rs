// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drift job orchestrator.
//!
//! Drives outstanding drift jobs through their lifecycle on a fixed period:
//!
//! ```text
//! (none) --trigger--> IN_PROGRESS
//! IN_PROGRESS --remote IN_PROGRESS--> IN_PROGRESS
//! IN_PROGRESS --remote COMPLETE/IN_SYNC--> COMPLETE (stack IN_SYNC)
//! IN_PROGRESS --remote COMPLETE/DRIFTED--> COMPLETE (reconciler writes snapshot, stack DRIFTED)
//! IN_PROGRESS --remote FAILED--> FAILED (stack UNKNOWN)
//! IN_PROGRESS --older than retention--> left as is, no longer polled, reported stale
//! ```
//!
//! Every job in a tick is processed in its own task, bounded by a semaphore.
//! A job's error is classified and handled for that job only:
//!
//! - permanent errors fail the job with `<ERROR_CODE>: <message>`
//!   (`AccountDisconnected` when the owner's grant is gone)
//! - transient errors leave the job for the next tick
//! - inconsistent remote state is logged and the job is skipped untouched
//!
//! Credentials are acquired fresh for every job in every tick.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerError, CredentialBroker};
use crate::config::Config;
use crate::error::{Error, ErrorClass, Result, deadline};
use crate::gateway::{DetectionStatus, DriftGateway, RemoteScope};
use crate::reconciler::Reconciler;
use crate::store::{JobStore, now};
use crate::types::{DriftJob, JobOutcome, StackDriftStatus};

/// Failure reason recorded when the owner's grant disappeared mid-flight.
pub const ACCOUNT_DISCONNECTED_REASON: &str = "AccountDisconnected";

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How often to tick.
    pub poll_interval: Duration,
    /// Jobs started longer ago are no longer polled.
    pub job_retention: Duration,
    /// Bound on every remote call.
    pub remote_timeout: Duration,
    /// Jobs processed concurrently within one tick.
    pub max_concurrent_jobs: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            job_retention: Duration::from_secs(24 * 3600),
            remote_timeout: Duration::from_secs(30),
            max_concurrent_jobs: 8,
        }
    }
}

impl From<&Config> for OrchestratorConfig {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval,
            job_retention: config.job_retention,
            remote_timeout: config.remote_timeout,
            max_concurrent_jobs: config.max_concurrent_jobs,
        }
    }
}

/// Summary of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Outstanding jobs picked up.
    pub polled: usize,
    /// Jobs that completed this tick.
    pub completed: usize,
    /// Drift snapshots written this tick.
    pub reconciled: usize,
    /// Jobs marked failed this tick.
    pub failed: usize,
    /// Jobs still running remotely.
    pub pending: usize,
    /// Jobs left for the next tick after a transient error.
    pub deferred: usize,
    /// Jobs skipped without any change (inconsistent remote state, or already moved on).
    pub ignored: usize,
    /// The tick did not run because another tick was still in flight.
    pub skipped: bool,
}

impl TickReport {
    fn record(&mut self, progress: JobProgress) {
        match progress {
            JobProgress::Pending => self.pending += 1,
            JobProgress::InSync => self.completed += 1,
            JobProgress::Drifted { reconciled } => {
                self.completed += 1;
                if reconciled {
                    self.reconciled += 1;
                }
            }
            JobProgress::Reconciled => self.reconciled += 1,
            JobProgress::Failed => self.failed += 1,
            JobProgress::Deferred => self.deferred += 1,
            JobProgress::Ignored => self.ignored += 1,
        }
    }
}

/// What happened to one job during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobProgress {
    Pending,
    InSync,
    Drifted { reconciled: bool },
    Reconciled,
    Failed,
    Deferred,
    Ignored,
}

/// Per-job state machine, cloned into every job task.
#[derive(Clone)]
struct JobDriver {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn CredentialBroker>,
    gateway: Arc<dyn DriftGateway>,
    reconciler: Arc<Reconciler>,
    remote_timeout: Duration,
}

impl JobDriver {
    async fn drive(&self, job: DriftJob) -> JobProgress {
        match self.advance(&job).await {
            Ok(progress) => progress,
            Err(e) => self.handle_error(&job, e).await,
        }
    }

    async fn advance(&self, job: &DriftJob) -> Result<JobProgress> {
        let scope = self.resolve_scope(job).await?;

        if job.needs_reconcile() {
            self.reconciler.reconcile(job, &scope).await?;
            return Ok(JobProgress::Reconciled);
        }

        let report = deadline(
            self.remote_timeout,
            self.gateway
                .describe_drift_status(&scope, &job.remote_operation_id),
        )
        .await?;

        let op = job.remote_operation_id.as_str();
        match (report.status, report.drift_status) {
            (DetectionStatus::InProgress, _) => {
                debug!(remote_operation_id = %op, "Drift detection still in progress");
                Ok(JobProgress::Pending)
            }
            (DetectionStatus::Failed, _) => {
                let reason = report
                    .failure_reason
                    .unwrap_or_else(|| "Drift detection failed".to_string());
                if !self
                    .store
                    .finish_job(op, &JobOutcome::Failed { reason: reason.clone() })
                    .await?
                {
                    return Ok(JobProgress::Ignored);
                }
                info!(remote_operation_id = %op, reason = %reason, "Drift detection failed");
                Ok(JobProgress::Failed)
            }
            (DetectionStatus::Complete, Some(StackDriftStatus::InSync)) => {
                if !self.store.finish_job(op, &JobOutcome::InSync).await? {
                    return Ok(JobProgress::Ignored);
                }
                info!(remote_operation_id = %op, stack = %job.stack_key(), "Stack in sync");
                Ok(JobProgress::InSync)
            }
            (DetectionStatus::Complete, Some(StackDriftStatus::Drifted)) => {
                if !self.store.finish_job(op, &JobOutcome::Drifted).await? {
                    return Ok(JobProgress::Ignored);
                }
                info!(remote_operation_id = %op, stack = %job.stack_key(), "Stack drifted");

                let completed = self
                    .store
                    .get_job(op)
                    .await?
                    .ok_or_else(|| Error::JobNotFound(op.to_string()))?;

                // Detail-fetch failure keeps the job COMPLETE; the next tick retries.
                let reconciled = match self.reconciler.reconcile(&completed, &scope).await {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(
                            remote_operation_id = %op,
                            error = %e,
                            class = %e.class(),
                            "Failed to fetch resource drifts, retrying next tick"
                        );
                        false
                    }
                };
                Ok(JobProgress::Drifted { reconciled })
            }
            (DetectionStatus::Complete, other) => Err(Error::Inconsistent(format!(
                "detection {} completed with drift status {}",
                op,
                other.map(|s| s.as_str()).unwrap_or("none")
            ))),
        }
    }

    /// Re-resolve the owner's grant and acquire a fresh session for the job's account.
    async fn resolve_scope(&self, job: &DriftJob) -> Result<RemoteScope> {
        let grant = self
            .store
            .get_grant(&job.owner_id, &job.account_id)
            .await?
            .ok_or_else(|| Error::AccountDisconnected {
                owner_id: job.owner_id.clone(),
                account_id: job.account_id.clone(),
            })?;

        let credentials = deadline(
            self.remote_timeout,
            self.broker.acquire(&grant.role_arn, &grant.external_id),
        )
        .await?;

        if credentials.account_id != job.account_id {
            return Err(BrokerError::IdentityMismatch {
                expected: job.account_id.clone(),
                actual: credentials.account_id,
            }
            .into());
        }

        Ok(RemoteScope::new(credentials, &job.region))
    }

    async fn handle_error(&self, job: &DriftJob, e: Error) -> JobProgress {
        let op = job.remote_operation_id.as_str();

        match e.class() {
            ErrorClass::Permanent => {
                let reason = match &e {
                    Error::AccountDisconnected { .. } => ACCOUNT_DISCONNECTED_REASON.to_string(),
                    _ => e.failure_reason(),
                };

                match self
                    .store
                    .finish_job(op, &JobOutcome::Failed { reason: reason.clone() })
                    .await
                {
                    Ok(true) => {
                        warn!(
                            remote_operation_id = %op,
                            account_id = %job.account_id,
                            reason = %reason,
                            "Drift job failed permanently"
                        );
                        JobProgress::Failed
                    }
                    Ok(false) => {
                        warn!(
                            remote_operation_id = %op,
                            error = %e,
                            "Permanent error for a job that is no longer in progress"
                        );
                        JobProgress::Ignored
                    }
                    Err(store_err) => {
                        error!(
                            remote_operation_id = %op,
                            error = %store_err,
                            "Failed to record job failure"
                        );
                        JobProgress::Deferred
                    }
                }
            }
            ErrorClass::Transient => {
                warn!(
                    remote_operation_id = %op,
                    error = %e,
                    code = e.error_code(),
                    "Transient error, retrying next tick"
                );
                JobProgress::Deferred
            }
            ErrorClass::Inconsistent => {
                warn!(
                    remote_operation_id = %op,
                    error = %e,
                    "Inconsistent remote state, skipping job"
                );
                JobProgress::Ignored
            }
        }
    }
}

/// Background orchestrator polling outstanding drift jobs.
pub struct DriftOrchestrator {
    driver: JobDriver,
    config: OrchestratorConfig,
    tick_guard: Mutex<()>,
    shutdown: Arc<Notify>,
}

impl DriftOrchestrator {
    /// Create a new orchestrator.
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn CredentialBroker>,
        gateway: Arc<dyn DriftGateway>,
        config: OrchestratorConfig,
    ) -> Self {
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            gateway.clone(),
            config.remote_timeout,
        ));

        Self {
            driver: JobDriver {
                store,
                broker,
                gateway,
                reconciler,
                remote_timeout: config.remote_timeout,
            },
            config,
            tick_guard: Mutex::new(()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the orchestrator loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            retention_hours = self.config.job_retention.as_secs() / 3600,
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "Drift orchestrator started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Drift orchestrator received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.tick().await;
                }
            }
        }

        info!("Drift orchestrator stopped");
    }

    /// Run one polling pass over outstanding jobs.
    ///
    /// Returns immediately with `skipped = true` if another tick is in flight.
    /// Never fails: per-job errors are handled per job.
    pub async fn tick(&self) -> TickReport {
        let Ok(_guard) = self.tick_guard.try_lock() else {
            warn!("Previous tick still running, skipping");
            return TickReport {
                skipped: true,
                ..TickReport::default()
            };
        };

        let retention = chrono::Duration::from_std(self.config.job_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let cutoff = now() - retention;

        let jobs = match self.driver.store.find_outstanding_jobs(Some(cutoff)).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Failed to load outstanding jobs");
                return TickReport::default();
            }
        };

        let mut report = TickReport {
            polled: jobs.len(),
            ..TickReport::default()
        };

        if jobs.is_empty() {
            debug!("No outstanding drift jobs");
            return report;
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_jobs.max(1)));
        let tasks = jobs.into_iter().map(|job| {
            let semaphore = semaphore.clone();
            let driver = self.driver.clone();
            let op = job.remote_operation_id.clone();
            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                driver.drive(job).await
            });
            async move { (op, handle.await) }
        });

        for (op, result) in join_all(tasks).await {
            match result {
                Ok(progress) => report.record(progress),
                Err(e) => {
                    error!(remote_operation_id = %op, error = %e, "Drift job task panicked");
                    report.failed += 1;
                }
            }
        }

        info!(
            polled = report.polled,
            completed = report.completed,
            reconciled = report.reconciled,
            failed = report.failed,
            pending = report.pending,
            deferred = report.deferred,
            ignored = report.ignored,
            "Drift tick finished"
        );

        report
    }
}

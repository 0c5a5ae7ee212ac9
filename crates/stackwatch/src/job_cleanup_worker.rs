// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for deleting old terminal drift jobs.
//!
//! Jobs that reached `COMPLETE` or `FAILED` longer than `max_age` ago are
//! deleted in batches. `IN_PROGRESS` jobs are never touched, so stale jobs
//! stay queryable.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::{JobStore, now};

/// Configuration for the job cleanup worker.
#[derive(Debug, Clone)]
pub struct JobCleanupWorkerConfig {
    /// Whether cleanup is enabled.
    pub enabled: bool,
    /// How often to run cleanup.
    pub poll_interval: Duration,
    /// Age after which terminal jobs are deleted.
    pub max_age: Duration,
    /// Maximum jobs to delete per batch.
    pub batch_size: i64,
}

impl Default for JobCleanupWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: Duration::from_secs(3600),     // 1 hour
            max_age: Duration::from_secs(30 * 24 * 3600), // 30 days
            batch_size: 100,
        }
    }
}

impl From<&Config> for JobCleanupWorkerConfig {
    fn from(config: &Config) -> Self {
        Self {
            enabled: config.job_cleanup_enabled,
            max_age: config.job_cleanup_max_age,
            ..Self::default()
        }
    }
}

/// Background worker that deletes old terminal jobs.
pub struct JobCleanupWorker {
    store: Arc<dyn JobStore>,
    config: JobCleanupWorkerConfig,
    shutdown: Arc<Notify>,
}

impl JobCleanupWorker {
    /// Create a new job cleanup worker.
    pub fn new(store: Arc<dyn JobStore>, config: JobCleanupWorkerConfig) -> Self {
        Self {
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the cleanup loop until shutdown is signalled.
    ///
    /// Returns immediately when cleanup is disabled.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Job cleanup worker disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_days = self.config.max_age.as_secs() / 86400,
            batch_size = self.config.batch_size,
            "Job cleanup worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Job cleanup worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.cleanup_old_jobs().await {
                        error!(error = %e, "Failed to cleanup old drift jobs");
                    }
                }
            }
        }

        info!("Job cleanup worker stopped");
    }

    /// Delete every terminal job older than `max_age`. Returns the number deleted.
    pub async fn cleanup_old_jobs(&self) -> Result<u64> {
        let max_age = chrono::Duration::from_std(self.config.max_age)
            .map_err(|e| Error::InvalidRequest(format!("Invalid cleanup max age: {}", e)))?;
        let cutoff = now() - max_age;
        let batch_size = self.config.batch_size.max(1);

        let mut total_deleted = 0u64;

        loop {
            let deleted = self
                .store
                .delete_terminal_jobs_before(cutoff, batch_size)
                .await?;
            total_deleted += deleted;

            debug!(
                deleted = deleted,
                total_deleted = total_deleted,
                "Cleaned up batch of drift jobs"
            );

            if deleted < batch_size as u64 {
                break;
            }
        }

        if total_deleted > 0 {
            info!(
                total_deleted = total_deleted,
                cutoff = %cutoff,
                "Job cleanup cycle completed"
            );
        } else {
            debug!("Job cleanup cycle completed, no old jobs found");
        }

        Ok(total_deleted)
    }
}

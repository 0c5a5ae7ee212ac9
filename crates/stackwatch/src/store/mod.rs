// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job store - the persistence boundary for grants, stacks, jobs and drift snapshots.
//!
//! The store holds no business logic beyond the transactional guarantees the
//! orchestrator relies on:
//!
//! - `create_job` supersedes any outstanding job of the same stack, inserts the
//!   new job and flags the stack `DETECTION_IN_PROGRESS` in one transaction.
//! - `finish_job` moves a job out of `IN_PROGRESS` and derives the stack's
//!   drift status from the outcome in one transaction.
//! - `apply_drift_snapshot` replaces a stack's resource drift rows wholesale,
//!   marks the stack `DRIFTED` and stamps the job reconciled in one transaction,
//!   unless a newer job exists for the stack.
//!
//! Timestamps are always produced by [`now`] and bound as parameters.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use thiserror::Error;

use crate::gateway::ResourceDriftDescriptor;
use crate::types::{
    AccountGrant, DriftJob, JobCreation, JobOutcome, JobStatus, NewDriftJob, PropertyDifference,
    ResourceDrift, SnapshotApply, StackKey, StackRecord, StackUpsert,
};

/// Failure reason recorded on a job replaced by a newer trigger.
pub const SUPERSEDED_REASON: &str = "Superseded";

/// Store errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Query failed.
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A uniqueness constraint rejected the write.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A stored row could not be mapped to a domain record.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            _ => StoreError::Database(err),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::InvalidRecord(err.to_string())
    }
}

/// Current time at the precision both backends store.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Persistence operations used by the service, orchestrator and reconciler.
#[async_trait]
pub trait JobStore: Send + Sync {
    // ------------------------------------------------------------------
    // Grants
    // ------------------------------------------------------------------

    /// Insert a grant or update the region and name of an existing one.
    async fn upsert_grant(&self, grant: &AccountGrant) -> Result<AccountGrant, StoreError>;

    /// Get the grant an owner holds for an account.
    async fn get_grant(
        &self,
        owner_id: &str,
        account_id: &str,
    ) -> Result<Option<AccountGrant>, StoreError>;

    /// List an owner's grants.
    async fn list_grants(&self, owner_id: &str) -> Result<Vec<AccountGrant>, StoreError>;

    /// Delete a grant.
    ///
    /// When no other owner holds a grant for the account, its stack records
    /// and snapshots are deleted too. Job rows are kept so outstanding jobs
    /// can be failed by the next tick.
    async fn delete_grant(&self, owner_id: &str, account_id: &str) -> Result<bool, StoreError>;

    // ------------------------------------------------------------------
    // Stacks
    // ------------------------------------------------------------------

    /// Insert or refresh a stack from a listing.
    ///
    /// A `DETECTION_IN_PROGRESS` drift status is never overwritten.
    async fn upsert_stack(&self, stack: &StackUpsert) -> Result<StackRecord, StoreError>;

    /// Get a stack by natural key.
    async fn get_stack(&self, key: &StackKey) -> Result<Option<StackRecord>, StoreError>;

    /// List stacks in every account the owner holds a grant for.
    async fn list_stacks_for_owner(&self, owner_id: &str) -> Result<Vec<StackRecord>, StoreError>;

    /// Delete stacks of an account and region whose names are not in `keep`.
    ///
    /// Stacks with detection in progress are kept.
    async fn prune_stacks(
        &self,
        account_id: &str,
        region: &str,
        keep: &[String],
    ) -> Result<u64, StoreError>;

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Record a triggered job, superseding any outstanding job of the same stack.
    async fn create_job(&self, job: &NewDriftJob) -> Result<JobCreation, StoreError>;

    /// Get a job by remote operation id.
    async fn get_job(&self, remote_operation_id: &str) -> Result<Option<DriftJob>, StoreError>;

    /// Most recent jobs for a stack, newest first.
    async fn list_jobs_for_stack(
        &self,
        key: &StackKey,
        limit: i64,
    ) -> Result<Vec<DriftJob>, StoreError>;

    /// Latest job of every stack in the owner's accounts.
    async fn latest_jobs_for_owner(&self, owner_id: &str) -> Result<Vec<DriftJob>, StoreError>;

    /// Jobs the orchestrator still has to drive, oldest first.
    ///
    /// Returns jobs started after `started_after` that are `IN_PROGRESS`, or
    /// completed as drifted with details not yet written and no newer job for
    /// the same stack.
    async fn find_outstanding_jobs(
        &self,
        started_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<DriftJob>, StoreError>;

    /// Set the status of a job that is still `IN_PROGRESS`. Returns whether it changed.
    async fn update_job_status(
        &self,
        remote_operation_id: &str,
        status: JobStatus,
        failure_reason: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Apply a terminal outcome to a job still `IN_PROGRESS`, with its stack effect.
    async fn finish_job(
        &self,
        remote_operation_id: &str,
        outcome: &JobOutcome,
    ) -> Result<bool, StoreError>;

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Replace every resource drift row of a stack in one transaction.
    async fn replace_resource_drift_snapshot(
        &self,
        stack_id: &str,
        drifts: &[ResourceDriftDescriptor],
    ) -> Result<u64, StoreError>;

    /// Write a drifted job's snapshot, mark the stack drifted and stamp the job.
    async fn apply_drift_snapshot(
        &self,
        job: &DriftJob,
        drifts: &[ResourceDriftDescriptor],
    ) -> Result<SnapshotApply, StoreError>;

    /// Resource drift rows of a stack, ordered by logical id.
    async fn list_resource_drifts(&self, stack_id: &str) -> Result<Vec<ResourceDrift>, StoreError>;

    // ------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------

    /// Delete up to `limit` terminal jobs completed before `cutoff`.
    async fn delete_terminal_jobs_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, StoreError>;
}

// ============================================================================
// Row types shared by both backends
// ============================================================================

/// Grant row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct GrantRow {
    pub owner_id: String,
    pub account_id: String,
    pub role_arn: String,
    pub external_id: String,
    pub region: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<GrantRow> for AccountGrant {
    fn from(row: GrantRow) -> Self {
        AccountGrant {
            owner_id: row.owner_id,
            account_id: row.account_id,
            role_arn: row.role_arn,
            external_id: row.external_id,
            region: row.region,
            name: row.name,
            created_at: row.created_at,
        }
    }
}

/// Stack row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct StackRow {
    pub stack_id: String,
    pub account_id: String,
    pub stack_name: String,
    pub region: String,
    pub stack_arn: Option<String>,
    pub last_known_status: Option<String>,
    pub drift_status: String,
    pub detection_time: Option<DateTime<Utc>>,
    pub tags: String,
    pub outputs: String,
    pub parameters: String,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<StackRow> for StackRecord {
    type Error = StoreError;

    fn try_from(row: StackRow) -> Result<Self, Self::Error> {
        Ok(StackRecord {
            drift_status: row.drift_status.parse().map_err(StoreError::InvalidRecord)?,
            tags: decode_map(&row.tags)?,
            outputs: decode_map(&row.outputs)?,
            parameters: decode_map(&row.parameters)?,
            stack_id: row.stack_id,
            account_id: row.account_id,
            stack_name: row.stack_name,
            region: row.region,
            stack_arn: row.stack_arn,
            last_known_status: row.last_known_status,
            detection_time: row.detection_time,
            updated_at: row.updated_at,
        })
    }
}

/// Job row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub remote_operation_id: String,
    pub owner_id: String,
    pub account_id: String,
    pub stack_name: String,
    pub region: String,
    pub status: String,
    pub drift_status: Option<String>,
    pub failure_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub reconciled_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for DriftJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(DriftJob {
            status: row.status.parse().map_err(StoreError::InvalidRecord)?,
            drift_status: row
                .drift_status
                .map(|s| s.parse())
                .transpose()
                .map_err(StoreError::InvalidRecord)?,
            remote_operation_id: row.remote_operation_id,
            owner_id: row.owner_id,
            account_id: row.account_id,
            stack_name: row.stack_name,
            region: row.region,
            failure_reason: row.failure_reason,
            started_at: row.started_at,
            completed_at: row.completed_at,
            reconciled_at: row.reconciled_at,
        })
    }
}

/// Resource drift row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ResourceDriftRow {
    pub stack_id: String,
    pub logical_resource_id: String,
    pub resource_type: String,
    pub physical_resource_id: Option<String>,
    pub drift_status: String,
    pub actual_properties: Option<String>,
    pub expected_properties: Option<String>,
    pub property_differences: String,
}

impl TryFrom<ResourceDriftRow> for ResourceDrift {
    type Error = StoreError;

    fn try_from(row: ResourceDriftRow) -> Result<Self, Self::Error> {
        Ok(ResourceDrift {
            drift_status: row.drift_status.parse().map_err(StoreError::InvalidRecord)?,
            actual_properties: row
                .actual_properties
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            expected_properties: row
                .expected_properties
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            property_differences: serde_json::from_str::<Vec<PropertyDifference>>(
                &row.property_differences,
            )?,
            stack_id: row.stack_id,
            logical_resource_id: row.logical_resource_id,
            resource_type: row.resource_type,
            physical_resource_id: row.physical_resource_id,
        })
    }
}

/// A resource drift descriptor with its JSON columns encoded.
pub(crate) struct EncodedDrift<'a> {
    pub descriptor: &'a ResourceDriftDescriptor,
    pub actual_properties: Option<String>,
    pub expected_properties: Option<String>,
    pub property_differences: String,
}

impl<'a> EncodedDrift<'a> {
    pub fn encode(descriptor: &'a ResourceDriftDescriptor) -> Result<Self, StoreError> {
        Ok(Self {
            descriptor,
            actual_properties: descriptor
                .actual_properties
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            expected_properties: descriptor
                .expected_properties
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            property_differences: serde_json::to_string(&descriptor.property_differences)?,
        })
    }
}

pub(crate) fn encode_map(map: &BTreeMap<String, String>) -> Result<String, StoreError> {
    Ok(serde_json::to_string(map)?)
}

pub(crate) fn decode_map(raw: &str) -> Result<BTreeMap<String, String>, StoreError> {
    Ok(serde_json::from_str(raw)?)
}

/// Lower bound used when no polling cutoff is given.
pub(crate) fn cutoff_or_epoch(started_after: Option<DateTime<Utc>>) -> DateTime<Utc> {
    started_after.unwrap_or(DateTime::UNIX_EPOCH)
}

/// Descriptors sorted by logical id with duplicates removed (last one wins).
///
/// Snapshot rows are unique per (stack, logical id); remote pages are not
/// guaranteed to be.
pub(crate) fn dedup_drifts(drifts: &[ResourceDriftDescriptor]) -> Vec<&ResourceDriftDescriptor> {
    let mut by_id: BTreeMap<&str, &ResourceDriftDescriptor> = BTreeMap::new();
    for drift in drifts {
        by_id.insert(drift.logical_resource_id.as_str(), drift);
    }
    by_id.into_values().collect()
}

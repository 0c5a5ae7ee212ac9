// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain records shared by the store, orchestrator and service layers.
//!
//! Status enums are persisted as their upper-case string form (`IN_PROGRESS`,
//! `DRIFTED`, ...) so both database backends can store them as plain text.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a drift detection job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Remote detection has been triggered and not yet observed to finish.
    InProgress,
    /// Remote detection finished and reported a stack drift status.
    Complete,
    /// Remote detection failed, or the job could not be driven to completion.
    Failed,
}

impl JobStatus {
    /// Persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Complete => "COMPLETE",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Whether the job has left `IN_PROGRESS`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::InProgress)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_PROGRESS" => Ok(JobStatus::InProgress),
            "COMPLETE" => Ok(JobStatus::Complete),
            "FAILED" => Ok(JobStatus::Failed),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Drift status of a whole stack as tracked locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StackDriftStatus {
    /// Drift detection has never run for this stack.
    #[default]
    NotChecked,
    /// Every checked resource matches its template.
    InSync,
    /// At least one resource differs from its template.
    Drifted,
    /// The last detection could not determine a status.
    Unknown,
    /// A detection job is outstanding.
    DetectionInProgress,
}

impl StackDriftStatus {
    /// Persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            StackDriftStatus::NotChecked => "NOT_CHECKED",
            StackDriftStatus::InSync => "IN_SYNC",
            StackDriftStatus::Drifted => "DRIFTED",
            StackDriftStatus::Unknown => "UNKNOWN",
            StackDriftStatus::DetectionInProgress => "DETECTION_IN_PROGRESS",
        }
    }
}

impl std::fmt::Display for StackDriftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StackDriftStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_CHECKED" => Ok(StackDriftStatus::NotChecked),
            "IN_SYNC" => Ok(StackDriftStatus::InSync),
            "DRIFTED" => Ok(StackDriftStatus::Drifted),
            "UNKNOWN" => Ok(StackDriftStatus::Unknown),
            "DETECTION_IN_PROGRESS" => Ok(StackDriftStatus::DetectionInProgress),
            _ => Err(format!("Unknown stack drift status: {}", s)),
        }
    }
}

/// Drift status of a single resource inside a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceDriftStatus {
    /// Resource matches its template.
    InSync,
    /// Resource properties differ from the template.
    Modified,
    /// Resource no longer exists.
    Deleted,
    /// Resource type does not support drift detection.
    NotChecked,
}

impl ResourceDriftStatus {
    /// Persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceDriftStatus::InSync => "IN_SYNC",
            ResourceDriftStatus::Modified => "MODIFIED",
            ResourceDriftStatus::Deleted => "DELETED",
            ResourceDriftStatus::NotChecked => "NOT_CHECKED",
        }
    }
}

impl std::fmt::Display for ResourceDriftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceDriftStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_SYNC" => Ok(ResourceDriftStatus::InSync),
            "MODIFIED" => Ok(ResourceDriftStatus::Modified),
            "DELETED" => Ok(ResourceDriftStatus::Deleted),
            "NOT_CHECKED" => Ok(ResourceDriftStatus::NotChecked),
            _ => Err(format!("Unknown resource drift status: {}", s)),
        }
    }
}

/// A caller-granted cross-account role, unique per (owner, account).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountGrant {
    /// Internal identifier of the owning user.
    pub owner_id: String,
    /// 12-digit account identifier.
    pub account_id: String,
    /// Role to assume in the account.
    pub role_arn: String,
    /// External id required by the role's trust policy.
    pub external_id: String,
    /// Region stacks are listed and checked in.
    pub region: String,
    /// Optional display name.
    pub name: Option<String>,
    /// When the grant was first verified.
    pub created_at: DateTime<Utc>,
}

/// Natural key of a stack record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackKey {
    /// Account the stack lives in.
    pub account_id: String,
    /// Stack name.
    pub stack_name: String,
    /// Region the stack lives in.
    pub region: String,
}

impl StackKey {
    /// Build a key from its parts.
    pub fn new(
        account_id: impl Into<String>,
        stack_name: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            stack_name: stack_name.into(),
            region: region.into(),
        }
    }
}

impl std::fmt::Display for StackKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.account_id, self.region, self.stack_name)
    }
}

/// Current state of a stack, unique per (account, name, region).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackRecord {
    /// Internal stack identifier; snapshot rows reference it.
    pub stack_id: String,
    /// Account the stack lives in.
    pub account_id: String,
    /// Stack name.
    pub stack_name: String,
    /// Region the stack lives in.
    pub region: String,
    /// Remote stack ARN, once a listing has seen the stack.
    pub stack_arn: Option<String>,
    /// Last remote stack status (e.g. `CREATE_COMPLETE`).
    pub last_known_status: Option<String>,
    /// Locally tracked drift status.
    pub drift_status: StackDriftStatus,
    /// When drift was last determined.
    pub detection_time: Option<DateTime<Utc>>,
    /// Stack tags.
    pub tags: BTreeMap<String, String>,
    /// Stack outputs.
    pub outputs: BTreeMap<String, String>,
    /// Stack parameters.
    pub parameters: BTreeMap<String, String>,
    /// Last time the record was written.
    pub updated_at: DateTime<Utc>,
}

impl StackRecord {
    /// Natural key of this record.
    pub fn key(&self) -> StackKey {
        StackKey::new(&self.account_id, &self.stack_name, &self.region)
    }
}

/// Input for a listing-driven stack upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct StackUpsert {
    /// Natural key.
    pub key: StackKey,
    /// Remote stack ARN.
    pub stack_arn: Option<String>,
    /// Remote stack status.
    pub last_known_status: Option<String>,
    /// Drift status reported by the listing.
    pub drift_status: StackDriftStatus,
    /// Drift check time reported by the listing.
    pub detection_time: Option<DateTime<Utc>>,
    /// Stack tags.
    pub tags: BTreeMap<String, String>,
    /// Stack outputs.
    pub outputs: BTreeMap<String, String>,
    /// Stack parameters.
    pub parameters: BTreeMap<String, String>,
}

/// A drift detection job, keyed by the remote operation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftJob {
    /// Remote drift detection id.
    pub remote_operation_id: String,
    /// Owner whose grant triggered the job.
    pub owner_id: String,
    /// Account the stack lives in.
    pub account_id: String,
    /// Stack name.
    pub stack_name: String,
    /// Region the stack lives in.
    pub region: String,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Stack drift status reported on completion.
    pub drift_status: Option<StackDriftStatus>,
    /// Why the job failed.
    pub failure_reason: Option<String>,
    /// When the job was triggered.
    pub started_at: DateTime<Utc>,
    /// When the job left `IN_PROGRESS`.
    pub completed_at: Option<DateTime<Utc>>,
    /// When resource drift details were written for this job.
    pub reconciled_at: Option<DateTime<Utc>>,
}

impl DriftJob {
    /// Natural key of the stack this job belongs to.
    pub fn stack_key(&self) -> StackKey {
        StackKey::new(&self.account_id, &self.stack_name, &self.region)
    }

    /// An outstanding job older than the retention window is no longer polled.
    pub fn is_stale(&self, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        self.status == JobStatus::InProgress && self.started_at < now - retention
    }

    /// Completed as drifted, but resource details have not been written yet.
    pub fn needs_reconcile(&self) -> bool {
        self.status == JobStatus::Complete
            && self.drift_status == Some(StackDriftStatus::Drifted)
            && self.reconciled_at.is_none()
    }
}

/// Input for job creation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDriftJob {
    /// Remote drift detection id returned by the trigger call.
    pub remote_operation_id: String,
    /// Owner whose grant triggered the job.
    pub owner_id: String,
    /// Stack the job is for.
    pub key: StackKey,
    /// Trigger time.
    pub started_at: DateTime<Utc>,
}

/// Result of [`crate::store::JobStore::create_job`].
#[derive(Debug, Clone, PartialEq)]
pub struct JobCreation {
    /// The newly created job.
    pub job: DriftJob,
    /// Remote operation ids of jobs this one superseded.
    pub superseded: Vec<String>,
}

/// Terminal transition applied by [`crate::store::JobStore::finish_job`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Detection failed or the job could not be driven further.
    Failed {
        /// Recorded failure reason.
        reason: String,
    },
    /// Detection completed and the stack is in sync.
    InSync,
    /// Detection completed and the stack drifted; details follow via the reconciler.
    Drifted,
}

/// Result of an atomic snapshot application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotApply {
    /// Snapshot rows were replaced; carries the number of rows written.
    Applied(u64),
    /// A newer job exists for the stack; nothing was written.
    Superseded,
    /// The stack record no longer exists; the job was stamped reconciled without rows.
    StackMissing,
}

/// A single difference between expected and actual resource properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDifference {
    /// JSON path of the property.
    pub path: String,
    /// Template value.
    pub expected: String,
    /// Live value.
    pub actual: String,
    /// `ADD`, `REMOVE` or `NOT_EQUAL`.
    pub difference_type: String,
}

/// One resource in a stored drift snapshot, unique per (stack, logical id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDrift {
    /// Internal stack identifier.
    pub stack_id: String,
    /// Logical id within the template.
    pub logical_resource_id: String,
    /// Resource type, e.g. `AWS::S3::Bucket`.
    pub resource_type: String,
    /// Physical id, if the resource exists.
    pub physical_resource_id: Option<String>,
    /// Resource drift status.
    pub drift_status: ResourceDriftStatus,
    /// Live properties.
    pub actual_properties: Option<serde_json::Value>,
    /// Template properties.
    pub expected_properties: Option<serde_json::Value>,
    /// Property-level differences.
    pub property_differences: Vec<PropertyDifference>,
}

/// Trigger acknowledgement returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerOutcome {
    /// Remote drift detection id.
    pub remote_operation_id: String,
    /// Always `IN_PROGRESS` on success.
    pub status: JobStatus,
    /// Jobs replaced by this trigger.
    pub superseded: Vec<String>,
}

/// Read projection of a stack with its latest job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackView {
    /// The stack record.
    pub stack: StackRecord,
    /// Most recent job for the stack, if any.
    pub latest_job: Option<DriftJob>,
    /// The latest job is outstanding past the retention window.
    pub stale: bool,
}

/// Read projection of a single job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    /// The job.
    pub job: DriftJob,
    /// Outstanding past the retention window.
    pub stale: bool,
}

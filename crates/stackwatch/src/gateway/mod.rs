// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote operation gateway - typed wrappers around the drift detection calls.
//!
//! Every call is scoped to one region and one assumed session
//! ([`RemoteScope`]). Gateways are PURE remote clients: they do not touch the
//! job store. Persisting results is the caller's job.

pub mod cloudformation;
pub mod mock;

pub use cloudformation::CloudFormationGateway;
pub use mock::MockGateway;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::SessionCredentials;
use crate::types::{PropertyDifference, ResourceDriftStatus, StackDriftStatus};

/// Errors from remote calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// The stack or detection id does not exist remotely.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The session is not allowed to perform the call.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// The remote service throttled the call.
    #[error("Throttled: {0}")]
    Throttled(String),

    /// The remote service could not be reached or the call timed out.
    #[error("Remote service unreachable: {0}")]
    Unreachable(String),

    /// The remote service returned an unexpected error.
    #[error("Remote error: {0}")]
    Remote(String),

    /// The call was made in a state where it has no meaning.
    #[error("Invalid call: {0}")]
    InvalidCall(String),
}

impl GatewayError {
    /// Whether a later retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Throttled(_) | GatewayError::Unreachable(_) | GatewayError::Remote(_)
        )
    }
}

impl From<tokio::time::error::Elapsed> for GatewayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        GatewayError::Unreachable("remote call timed out".to_string())
    }
}

/// The session and region a remote call runs under.
#[derive(Debug, Clone)]
pub struct RemoteScope {
    /// Assumed session.
    pub credentials: SessionCredentials,
    /// Region to call.
    pub region: String,
}

impl RemoteScope {
    /// Build a scope.
    pub fn new(credentials: SessionCredentials, region: impl Into<String>) -> Self {
        Self {
            credentials,
            region: region.into(),
        }
    }
}

/// A stack as reported by the remote listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackDescriptor {
    /// Remote stack ARN.
    pub stack_arn: Option<String>,
    /// Stack name.
    pub stack_name: String,
    /// Stack status (e.g. `UPDATE_COMPLETE`).
    pub stack_status: String,
    /// Drift status from the last remote detection.
    pub drift_status: StackDriftStatus,
    /// Last remote drift check.
    pub last_drift_check: Option<DateTime<Utc>>,
    /// Stack tags.
    pub tags: BTreeMap<String, String>,
    /// Stack outputs.
    pub outputs: BTreeMap<String, String>,
    /// Stack parameters.
    pub parameters: BTreeMap<String, String>,
}

/// Remote state of a detection operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectionStatus {
    /// Still running.
    InProgress,
    /// Finished; the stack drift status is available.
    Complete,
    /// Finished without a result.
    Failed,
}

/// Result of `describe_drift_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionReport {
    /// Detection state.
    pub status: DetectionStatus,
    /// Stack drift status, present once the detection completes.
    pub drift_status: Option<StackDriftStatus>,
    /// Remote reason for a failure.
    pub failure_reason: Option<String>,
}

impl DetectionReport {
    /// A report for a detection that is still running.
    pub fn in_progress() -> Self {
        Self {
            status: DetectionStatus::InProgress,
            drift_status: None,
            failure_reason: None,
        }
    }

    /// A report for a completed detection.
    pub fn complete(drift_status: StackDriftStatus) -> Self {
        Self {
            status: DetectionStatus::Complete,
            drift_status: Some(drift_status),
            failure_reason: None,
        }
    }

    /// A report for a failed detection.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: DetectionStatus::Failed,
            drift_status: None,
            failure_reason: Some(reason.into()),
        }
    }
}

/// One resource's drift as reported remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDriftDescriptor {
    /// Logical id within the template.
    pub logical_resource_id: String,
    /// Resource type.
    pub resource_type: String,
    /// Physical id.
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

/// Remote drift detection operations.
#[async_trait]
pub trait DriftGateway: Send + Sync {
    /// Gateway type identifier (e.g., "cloudformation", "mock").
    fn gateway_type(&self) -> &'static str;

    /// List every live stack in the scope's region, following pagination.
    async fn list_stacks(&self, scope: &RemoteScope) -> Result<Vec<StackDescriptor>, GatewayError>;

    /// Start drift detection for a stack and return the remote operation id.
    ///
    /// Fails with [`GatewayError::NotFound`] if the stack does not exist.
    async fn trigger_drift(
        &self,
        scope: &RemoteScope,
        stack_name: &str,
    ) -> Result<String, GatewayError>;

    /// Report the state of a detection operation.
    async fn describe_drift_status(
        &self,
        scope: &RemoteScope,
        remote_operation_id: &str,
    ) -> Result<DetectionReport, GatewayError>;

    /// Fetch per-resource drift for a stack whose detection completed as drifted.
    async fn describe_resource_drifts(
        &self,
        scope: &RemoteScope,
        stack_name: &str,
    ) -> Result<Vec<ResourceDriftDescriptor>, GatewayError>;
}

/// Parse a remote property document, keeping unparseable text as a JSON string.
pub fn parse_properties(raw: Option<&str>) -> Option<serde_json::Value> {
    let raw = raw?;
    Some(
        serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_properties() {
        assert_eq!(parse_properties(None), None);
        assert_eq!(
            parse_properties(Some(r#"{"BucketName":"logs"}"#)),
            Some(serde_json::json!({"BucketName": "logs"}))
        );
        assert_eq!(
            parse_properties(Some("not json")),
            Some(serde_json::Value::String("not json".to_string()))
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(GatewayError::Throttled("rate".into()).is_transient());
        assert!(GatewayError::Remote("500".into()).is_transient());
        assert!(!GatewayError::NotFound("stack".into()).is_transient());
        assert!(!GatewayError::InvalidCall("detail".into()).is_transient());
    }

    #[test]
    fn test_report_constructors() {
        assert_eq!(DetectionReport::in_progress().status, DetectionStatus::InProgress);
        let complete = DetectionReport::complete(StackDriftStatus::Drifted);
        assert_eq!(complete.drift_status, Some(StackDriftStatus::Drifted));
        let failed = DetectionReport::failed("stack busy");
        assert_eq!(failed.failure_reason.as_deref(), Some("stack busy"));
    }
}

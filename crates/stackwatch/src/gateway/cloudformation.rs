// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CloudFormation-backed drift gateway.
//!
//! A client is built per call from the base SDK configuration, the scope's
//! region and the scope's assumed session. Clients are cheap to build and
//! sessions are never reused across ticks, so nothing is cached here.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_cloudformation::Client;
use aws_sdk_cloudformation::config::Region;
use aws_sdk_cloudformation::error::{ProvideErrorMetadata, SdkError};
use aws_smithy_types::timeout::TimeoutConfig;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{
    DetectionReport, DetectionStatus, DriftGateway, GatewayError, RemoteScope,
    ResourceDriftDescriptor, StackDescriptor, parse_properties,
};
use crate::types::{PropertyDifference, ResourceDriftStatus, StackDriftStatus};

/// Remote stack status of stacks that no longer exist.
const DELETED_STACK_STATUS: &str = "DELETE_COMPLETE";

/// CloudFormation gateway configuration.
#[derive(Debug, Clone)]
pub struct CloudFormationConfig {
    /// Per-operation timeout applied by the SDK.
    pub operation_timeout: Duration,
    /// Optional endpoint override (e.g. LocalStack).
    pub endpoint: Option<String>,
}

impl Default for CloudFormationConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
            endpoint: None,
        }
    }
}

/// Drift gateway talking to AWS CloudFormation.
#[derive(Clone)]
pub struct CloudFormationGateway {
    sdk_config: aws_config::SdkConfig,
    config: CloudFormationConfig,
}

impl std::fmt::Debug for CloudFormationGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudFormationGateway")
            .field("config", &self.config)
            .finish()
    }
}

impl CloudFormationGateway {
    /// Create a gateway inheriting HTTP client, retry and sleep settings from `sdk_config`.
    pub fn new(sdk_config: &aws_config::SdkConfig, config: CloudFormationConfig) -> Self {
        Self {
            sdk_config: sdk_config.clone(),
            config,
        }
    }

    fn client(&self, scope: &RemoteScope) -> Client {
        let creds = &scope.credentials;
        let provider = aws_credential_types::Credentials::new(
            creds.access_key_id.clone(),
            creds.secret_access_key.clone(),
            Some(creds.session_token.clone()),
            Some(creds.expires_at.into()),
            "stackwatch-assumed-role",
        );

        let timeout_config = TimeoutConfig::builder()
            .operation_timeout(self.config.operation_timeout)
            .build();

        let mut builder = aws_sdk_cloudformation::config::Builder::from(&self.sdk_config)
            .region(Region::new(scope.region.clone()))
            .credentials_provider(provider)
            .timeout_config(timeout_config);

        if let Some(endpoint) = &self.config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Client::from_conf(builder.build())
    }

    /// Map a CloudFormation SDK error into the gateway taxonomy.
    fn classify<E>(err: SdkError<E>) -> GatewayError
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
    {
        match &err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
                GatewayError::Unreachable(err.to_string())
            }
            SdkError::ServiceError(service_err) => {
                let message = service_err
                    .err()
                    .message()
                    .unwrap_or("no message")
                    .to_string();
                match service_err.err().code() {
                    Some("ValidationError") if message.contains("does not exist") => {
                        GatewayError::NotFound(message)
                    }
                    Some("Throttling" | "ThrottlingException" | "RequestLimitExceeded") => {
                        GatewayError::Throttled(message)
                    }
                    Some(
                        "AccessDenied"
                        | "AccessDeniedException"
                        | "ExpiredToken"
                        | "InvalidClientTokenId",
                    ) => GatewayError::AccessDenied(message),
                    Some(code) => GatewayError::Remote(format!("{}: {}", code, message)),
                    None => GatewayError::Remote(message),
                }
            }
            _ => GatewayError::Remote(err.to_string()),
        }
    }
}

fn to_chrono(ts: &aws_smithy_types::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
}

fn stack_drift_status(raw: &str) -> StackDriftStatus {
    raw.parse().unwrap_or(StackDriftStatus::Unknown)
}

fn resource_drift_status(raw: &str) -> ResourceDriftStatus {
    raw.parse().unwrap_or(ResourceDriftStatus::NotChecked)
}

/// Map a listed stack. Stacks without a name or status are skipped.
fn describe_stack(stack: &aws_sdk_cloudformation::types::Stack) -> Option<StackDescriptor> {
    let stack_name = stack.stack_name()?;
    let stack_status = stack.stack_status()?.as_str();

    let tags: BTreeMap<String, String> = stack
        .tags()
        .iter()
        .filter_map(|tag| {
            Some((
                tag.key()?.to_string(),
                tag.value().unwrap_or_default().to_string(),
            ))
        })
        .collect();

    let outputs: BTreeMap<String, String> = stack
        .outputs()
        .iter()
        .filter_map(|output| {
            Some((
                output.output_key()?.to_string(),
                output.output_value().unwrap_or_default().to_string(),
            ))
        })
        .collect();

    let parameters: BTreeMap<String, String> = stack
        .parameters()
        .iter()
        .filter_map(|param| {
            Some((
                param.parameter_key()?.to_string(),
                param.parameter_value().unwrap_or_default().to_string(),
            ))
        })
        .collect();

    let drift = stack.drift_information();

    Some(StackDescriptor {
        stack_arn: stack.stack_id().map(str::to_string),
        stack_name: stack_name.to_string(),
        stack_status: stack_status.to_string(),
        drift_status: drift
            .and_then(|d| d.stack_drift_status())
            .map(|s| stack_drift_status(s.as_str()))
            .unwrap_or_default(),
        last_drift_check: drift
            .and_then(|d| d.last_check_timestamp())
            .and_then(to_chrono),
        tags,
        outputs,
        parameters,
    })
}

/// Map a resource drift row. Rows without a logical id cannot be keyed and are skipped.
fn describe_resource(
    drift: &aws_sdk_cloudformation::types::StackResourceDrift,
) -> Option<ResourceDriftDescriptor> {
    Some(ResourceDriftDescriptor {
        logical_resource_id: drift.logical_resource_id()?.to_string(),
        resource_type: drift.resource_type().unwrap_or_default().to_string(),
        physical_resource_id: drift.physical_resource_id().map(str::to_string),
        drift_status: drift
            .stack_resource_drift_status()
            .map(|s| resource_drift_status(s.as_str()))
            .unwrap_or(ResourceDriftStatus::NotChecked),
        actual_properties: parse_properties(drift.actual_properties()),
        expected_properties: parse_properties(drift.expected_properties()),
        property_differences: drift
            .property_differences()
            .iter()
            .map(|diff| PropertyDifference {
                path: diff.property_path().unwrap_or_default().to_string(),
                expected: diff.expected_value().unwrap_or_default().to_string(),
                actual: diff.actual_value().unwrap_or_default().to_string(),
                difference_type: diff
                    .difference_type()
                    .map(|t| t.as_str().to_string())
                    .unwrap_or_default(),
            })
            .collect(),
    })
}

fn detection_status(raw: Option<&str>) -> Result<DetectionStatus, GatewayError> {
    match raw {
        Some("DETECTION_IN_PROGRESS") => Ok(DetectionStatus::InProgress),
        Some("DETECTION_COMPLETE") => Ok(DetectionStatus::Complete),
        Some("DETECTION_FAILED") => Ok(DetectionStatus::Failed),
        Some(other) => Err(GatewayError::Remote(format!(
            "unexpected detection status '{}'",
            other
        ))),
        None => Err(GatewayError::Remote(
            "detection status missing from response".to_string(),
        )),
    }
}

#[async_trait]
impl DriftGateway for CloudFormationGateway {
    fn gateway_type(&self) -> &'static str {
        "cloudformation"
    }

    async fn list_stacks(&self, scope: &RemoteScope) -> Result<Vec<StackDescriptor>, GatewayError> {
        let client = self.client(scope);
        let mut pages = client.describe_stacks().into_paginator().send();
        let mut stacks = Vec::new();

        while let Some(page) = pages.next().await {
            let page = page.map_err(Self::classify)?;
            stacks.extend(
                page.stacks()
                    .iter()
                    .filter(|s| {
                        s.stack_status().map(|status| status.as_str()) != Some(DELETED_STACK_STATUS)
                    })
                    .filter_map(describe_stack),
            );
        }

        debug!(
            account_id = %scope.credentials.account_id,
            region = %scope.region,
            count = stacks.len(),
            "Listed stacks"
        );

        Ok(stacks)
    }

    async fn trigger_drift(
        &self,
        scope: &RemoteScope,
        stack_name: &str,
    ) -> Result<String, GatewayError> {
        let output = self
            .client(scope)
            .detect_stack_drift()
            .stack_name(stack_name)
            .send()
            .await
            .map_err(Self::classify)?;

        output
            .stack_drift_detection_id()
            .map(str::to_string)
            .ok_or_else(|| {
                GatewayError::Remote("detection id missing from response".to_string())
            })
    }

    async fn describe_drift_status(
        &self,
        scope: &RemoteScope,
        remote_operation_id: &str,
    ) -> Result<DetectionReport, GatewayError> {
        let output = self
            .client(scope)
            .describe_stack_drift_detection_status()
            .stack_drift_detection_id(remote_operation_id)
            .send()
            .await
            .map_err(Self::classify)?;

        let status = detection_status(output.detection_status().map(|s| s.as_str()))?;

        Ok(DetectionReport {
            status,
            drift_status: output
                .stack_drift_status()
                .map(|s| stack_drift_status(s.as_str())),
            failure_reason: output.detection_status_reason().map(str::to_string),
        })
    }

    async fn describe_resource_drifts(
        &self,
        scope: &RemoteScope,
        stack_name: &str,
    ) -> Result<Vec<ResourceDriftDescriptor>, GatewayError> {
        let client = self.client(scope);
        let mut drifts = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let response = client
                .describe_stack_resource_drifts()
                .stack_name(stack_name)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(Self::classify)?;

            drifts.extend(
                response
                    .stack_resource_drifts()
                    .iter()
                    .filter_map(describe_resource),
            );

            match response.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(drifts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_cloudformation::types::{
        Stack, StackDriftInformation, StackResourceDrift, StackStatus, Tag,
    };

    #[test]
    fn test_config_default() {
        let config = CloudFormationConfig::default();
        assert_eq!(config.operation_timeout, Duration::from_secs(30));
        assert!(config.endpoint.is_none());
    }

    #[test]
    fn test_gateway_type() {
        let sdk_config = aws_config::SdkConfig::builder().build();
        let gateway = CloudFormationGateway::new(&sdk_config, CloudFormationConfig::default());
        assert_eq!(gateway.gateway_type(), "cloudformation");
    }

    #[test]
    fn test_status_mapping_falls_back() {
        assert_eq!(stack_drift_status("DRIFTED"), StackDriftStatus::Drifted);
        assert_eq!(stack_drift_status("SOMETHING_NEW"), StackDriftStatus::Unknown);
        assert_eq!(resource_drift_status("MODIFIED"), ResourceDriftStatus::Modified);
        assert_eq!(
            resource_drift_status("UNKNOWN"),
            ResourceDriftStatus::NotChecked
        );
    }

    #[test]
    fn test_detection_status_requires_known_value() {
        assert_eq!(
            detection_status(Some("DETECTION_COMPLETE")).unwrap(),
            DetectionStatus::Complete
        );
        assert_eq!(
            detection_status(Some("DETECTION_IN_PROGRESS")).unwrap(),
            DetectionStatus::InProgress
        );
        assert!(matches!(
            detection_status(Some("DETECTION_PAUSED")),
            Err(GatewayError::Remote(_))
        ));
        assert!(matches!(detection_status(None), Err(GatewayError::Remote(_))));
    }

    #[test]
    fn test_describe_stack_skips_incomplete_stacks() {
        let nameless = Stack::builder()
            .stack_status(StackStatus::CreateComplete)
            .build();
        assert!(describe_stack(&nameless).is_none());

        let statusless = Stack::builder().stack_name("demo-stack").build();
        assert!(describe_stack(&statusless).is_none());
    }

    #[test]
    fn test_describe_stack_defaults_optional_fields() {
        let stack = Stack::builder()
            .stack_name("demo-stack")
            .stack_status(StackStatus::UpdateComplete)
            .tags(Tag::builder().key("team").value("platform").build())
            .tags(Tag::builder().key("empty").build())
            .tags(Tag::builder().value("orphan").build())
            .build();

        let descriptor = describe_stack(&stack).unwrap();
        assert_eq!(descriptor.stack_name, "demo-stack");
        assert_eq!(descriptor.stack_status, "UPDATE_COMPLETE");
        assert_eq!(descriptor.drift_status, StackDriftStatus::default());
        assert!(descriptor.stack_arn.is_none());
        assert_eq!(descriptor.tags.len(), 2);
        assert_eq!(descriptor.tags["team"], "platform");
        assert_eq!(descriptor.tags["empty"], "");
    }

    #[test]
    fn test_describe_stack_reads_drift_information() {
        let stack = Stack::builder()
            .stack_name("drifted-stack")
            .stack_status(StackStatus::CreateComplete)
            .drift_information(
                StackDriftInformation::builder()
                    .stack_drift_status(aws_sdk_cloudformation::types::StackDriftStatus::Drifted)
                    .last_check_timestamp(aws_smithy_types::DateTime::from_secs(1_700_000_000))
                    .build(),
            )
            .build();

        let descriptor = describe_stack(&stack).unwrap();
        assert_eq!(descriptor.drift_status, StackDriftStatus::Drifted);
        assert_eq!(
            descriptor.last_drift_check.map(|t| t.timestamp()),
            Some(1_700_000_000)
        );
    }

    #[test]
    fn test_describe_resource_defaults_optional_fields() {
        let keyless = StackResourceDrift::builder()
            .resource_type("AWS::S3::Bucket")
            .build();
        assert!(describe_resource(&keyless).is_none());

        let drift = StackResourceDrift::builder()
            .logical_resource_id("Bucket")
            .actual_properties(r#"{"BucketName":"b"}"#)
            .property_differences(
                aws_sdk_cloudformation::types::PropertyDifference::builder()
                    .property_path("/BucketName")
                    .build(),
            )
            .build();

        let descriptor = describe_resource(&drift).unwrap();
        assert_eq!(descriptor.logical_resource_id, "Bucket");
        assert_eq!(descriptor.resource_type, "");
        assert_eq!(descriptor.drift_status, ResourceDriftStatus::NotChecked);
        assert_eq!(
            descriptor.actual_properties,
            Some(serde_json::json!({"BucketName": "b"}))
        );
        assert!(descriptor.expected_properties.is_none());
        assert_eq!(descriptor.property_differences.len(), 1);
        let diff = &descriptor.property_differences[0];
        assert_eq!(diff.path, "/BucketName");
        assert_eq!(diff.expected, "");
        assert_eq!(diff.actual, "");
        assert_eq!(diff.difference_type, "");
    }
}

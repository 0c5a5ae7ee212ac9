// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock gateway for testing.
//!
//! Holds scripted stacks, detection reports and resource drifts in memory.
//! Detection operations stay in progress until a report is scripted for them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    DetectionReport, DriftGateway, GatewayError, RemoteScope, ResourceDriftDescriptor,
    StackDescriptor,
};
use crate::types::{ResourceDriftStatus, StackDriftStatus};

/// (account id, region)
type ScopeKey = (String, String);

#[derive(Default)]
struct MockState {
    stacks: HashMap<ScopeKey, Vec<StackDescriptor>>,
    reports: HashMap<String, DetectionReport>,
    resource_drifts: HashMap<String, Vec<ResourceDriftDescriptor>>,
    operation_failures: HashMap<String, GatewayError>,
    stack_failures: HashMap<String, GatewayError>,
    stalled_operations: Vec<String>,
}

/// Mock drift gateway.
pub struct MockGateway {
    state: Arc<Mutex<MockState>>,
    next_operation: AtomicUsize,
    trigger_calls: AtomicUsize,
    status_calls: AtomicUsize,
    detail_calls: AtomicUsize,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    /// Create an empty mock gateway.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            next_operation: AtomicUsize::new(1),
            trigger_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            detail_calls: AtomicUsize::new(0),
        }
    }

    /// A minimal live stack descriptor.
    pub fn descriptor(stack_name: &str) -> StackDescriptor {
        StackDescriptor {
            stack_arn: Some(format!(
                "arn:aws:cloudformation:us-east-1:000000000000:stack/{}/mock",
                stack_name
            )),
            stack_name: stack_name.to_string(),
            stack_status: "CREATE_COMPLETE".to_string(),
            drift_status: StackDriftStatus::NotChecked,
            last_drift_check: None,
            tags: BTreeMap::new(),
            outputs: BTreeMap::new(),
            parameters: BTreeMap::new(),
        }
    }

    /// A modified resource with a single property difference.
    pub fn modified_resource(logical_id: &str, resource_type: &str) -> ResourceDriftDescriptor {
        ResourceDriftDescriptor {
            logical_resource_id: logical_id.to_string(),
            resource_type: resource_type.to_string(),
            physical_resource_id: Some(format!("{}-physical", logical_id.to_lowercase())),
            drift_status: ResourceDriftStatus::Modified,
            actual_properties: Some(serde_json::json!({"Enabled": false})),
            expected_properties: Some(serde_json::json!({"Enabled": true})),
            property_differences: vec![crate::types::PropertyDifference {
                path: "/Enabled".to_string(),
                expected: "true".to_string(),
                actual: "false".to_string(),
                difference_type: "NOT_EQUAL".to_string(),
            }],
        }
    }

    /// Register a live stack in an account and region.
    pub async fn add_stack(&self, account_id: &str, region: &str, stack: StackDescriptor) {
        let mut state = self.state.lock().await;
        let stacks = state
            .stacks
            .entry((account_id.to_string(), region.to_string()))
            .or_default();
        stacks.retain(|s| s.stack_name != stack.stack_name);
        stacks.push(stack);
    }

    /// Remove a stack from an account and region.
    pub async fn remove_stack(&self, account_id: &str, region: &str, stack_name: &str) {
        let mut state = self.state.lock().await;
        if let Some(stacks) = state
            .stacks
            .get_mut(&(account_id.to_string(), region.to_string()))
        {
            stacks.retain(|s| s.stack_name != stack_name);
        }
    }

    /// Script the report returned for a detection operation.
    pub async fn set_report(&self, remote_operation_id: &str, report: DetectionReport) {
        self.state
            .lock()
            .await
            .reports
            .insert(remote_operation_id.to_string(), report);
    }

    /// Script the resource drifts returned for a stack.
    pub async fn set_resource_drifts(&self, stack_name: &str, drifts: Vec<ResourceDriftDescriptor>) {
        self.state
            .lock()
            .await
            .resource_drifts
            .insert(stack_name.to_string(), drifts);
    }

    /// Make status calls for an operation fail.
    pub async fn fail_operation(&self, remote_operation_id: &str, error: GatewayError) {
        self.state
            .lock()
            .await
            .operation_failures
            .insert(remote_operation_id.to_string(), error);
    }

    /// Make trigger and detail calls for a stack fail.
    pub async fn fail_stack(&self, stack_name: &str, error: GatewayError) {
        self.state
            .lock()
            .await
            .stack_failures
            .insert(stack_name.to_string(), error);
    }

    /// Make status calls for an operation never return.
    pub async fn stall_operation(&self, remote_operation_id: &str) {
        self.state
            .lock()
            .await
            .stalled_operations
            .push(remote_operation_id.to_string());
    }

    /// Clear every scripted failure and stall.
    pub async fn heal(&self) {
        let mut state = self.state.lock().await;
        state.operation_failures.clear();
        state.stack_failures.clear();
        state.stalled_operations.clear();
    }

    /// Number of trigger calls.
    pub fn trigger_calls(&self) -> usize {
        self.trigger_calls.load(Ordering::SeqCst)
    }

    /// Number of status calls.
    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    /// Number of resource drift calls.
    pub fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }
}

fn scope_key(scope: &RemoteScope) -> ScopeKey {
    (scope.credentials.account_id.clone(), scope.region.clone())
}

#[async_trait]
impl DriftGateway for MockGateway {
    fn gateway_type(&self) -> &'static str {
        "mock"
    }

    async fn list_stacks(&self, scope: &RemoteScope) -> Result<Vec<StackDescriptor>, GatewayError> {
        let state = self.state.lock().await;
        Ok(state
            .stacks
            .get(&scope_key(scope))
            .cloned()
            .unwrap_or_default())
    }

    async fn trigger_drift(
        &self,
        scope: &RemoteScope,
        stack_name: &str,
    ) -> Result<String, GatewayError> {
        self.trigger_calls.fetch_add(1, Ordering::SeqCst);

        let state = self.state.lock().await;
        if let Some(error) = state.stack_failures.get(stack_name) {
            return Err(error.clone());
        }

        let exists = state
            .stacks
            .get(&scope_key(scope))
            .is_some_and(|stacks| stacks.iter().any(|s| s.stack_name == stack_name));
        if !exists {
            return Err(GatewayError::NotFound(format!(
                "Stack with id {} does not exist",
                stack_name
            )));
        }

        let n = self.next_operation.fetch_add(1, Ordering::SeqCst);
        Ok(format!("op-{}", n))
    }

    async fn describe_drift_status(
        &self,
        _scope: &RemoteScope,
        remote_operation_id: &str,
    ) -> Result<DetectionReport, GatewayError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);

        let stalled = {
            let state = self.state.lock().await;
            if let Some(error) = state.operation_failures.get(remote_operation_id) {
                return Err(error.clone());
            }
            state
                .stalled_operations
                .iter()
                .any(|op| op == remote_operation_id)
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        let state = self.state.lock().await;
        Ok(state
            .reports
            .get(remote_operation_id)
            .cloned()
            .unwrap_or_else(DetectionReport::in_progress))
    }

    async fn describe_resource_drifts(
        &self,
        _scope: &RemoteScope,
        stack_name: &str,
    ) -> Result<Vec<ResourceDriftDescriptor>, GatewayError> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);

        let state = self.state.lock().await;
        if let Some(error) = state.stack_failures.get(stack_name) {
            return Err(error.clone());
        }
        Ok(state
            .resource_drifts
            .get(stack_name)
            .cloned()
            .unwrap_or_default())
    }
}

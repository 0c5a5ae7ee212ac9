// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drift service.
//!
//! Request-side operations consumed by the API layer: account grants, stack
//! listing refresh, the drift trigger path and read projections. Every call is
//! scoped to the owner the caller was authenticated as.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broker::{CredentialBroker, validate_role_arn};
use crate::error::{Error, Result, deadline};
use crate::gateway::{DriftGateway, RemoteScope, StackDescriptor};
use crate::resource_kind::ResourceKind;
use crate::store::{JobStore, StoreError, now};
use crate::types::{
    AccountGrant, JobView, NewDriftJob, ResourceDrift, ResourceDriftStatus, StackKey, StackUpsert,
    StackView, TriggerOutcome,
};

/// Per-kind counts of a stack's drift snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindSummary {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resources of this kind in the snapshot.
    pub resources: usize,
    /// Resources reported `MODIFIED`.
    pub modified: usize,
    /// Resources reported `DELETED`.
    pub deleted: usize,
}

/// Group snapshot rows by resource kind, ordered by kind.
pub fn summarize_by_kind(drifts: &[ResourceDrift]) -> Vec<KindSummary> {
    let mut by_kind: BTreeMap<ResourceKind, KindSummary> = BTreeMap::new();

    for drift in drifts {
        let kind = ResourceKind::from_resource_type(&drift.resource_type);
        let entry = by_kind.entry(kind).or_insert(KindSummary {
            kind,
            resources: 0,
            modified: 0,
            deleted: 0,
        });
        entry.resources += 1;
        match drift.drift_status {
            ResourceDriftStatus::Modified => entry.modified += 1,
            ResourceDriftStatus::Deleted => entry.deleted += 1,
            _ => {}
        }
    }

    by_kind.into_values().collect()
}

fn stack_upsert(account_id: &str, region: &str, stack: StackDescriptor) -> StackUpsert {
    StackUpsert {
        key: StackKey::new(account_id, &stack.stack_name, region),
        stack_arn: stack.stack_arn,
        last_known_status: Some(stack.stack_status),
        drift_status: stack.drift_status,
        detection_time: stack.last_drift_check,
        tags: stack.tags,
        outputs: stack.outputs,
        parameters: stack.parameters,
    }
}

/// Owner-scoped drift operations.
#[derive(Clone)]
pub struct DriftService {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn CredentialBroker>,
    gateway: Arc<dyn DriftGateway>,
    remote_timeout: Duration,
    retention: chrono::Duration,
}

impl DriftService {
    /// Create a service with default timeouts (30s remote calls, 24h retention).
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn CredentialBroker>,
        gateway: Arc<dyn DriftGateway>,
    ) -> Self {
        Self {
            store,
            broker,
            gateway,
            remote_timeout: Duration::from_secs(30),
            retention: chrono::Duration::hours(24),
        }
    }

    /// Set the bound on every remote call.
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    /// Set the retention window used to derive `stale`.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention =
            chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::hours(24));
        self
    }

    // ========================================================================
    // Account grants
    // ========================================================================

    /// Verify a role by assuming it and record the grant.
    ///
    /// Re-connecting an account with the same role and external id updates
    /// its region and name. A different role or external id is rejected.
    pub async fn connect_account(
        &self,
        owner_id: &str,
        role_arn: &str,
        external_id: &str,
        region: &str,
        name: Option<&str>,
    ) -> Result<AccountGrant> {
        require("owner_id", owner_id)?;
        require("region", region)?;
        let arn_account = validate_role_arn(role_arn)?;

        if let Some(existing) = self.store.get_grant(owner_id, &arn_account).await? {
            if existing.role_arn != role_arn || existing.external_id != external_id {
                return Err(Error::InvalidRequest(format!(
                    "account {} is already connected with a different role",
                    arn_account
                )));
            }
        }

        let credentials = deadline(self.remote_timeout, self.broker.acquire(role_arn, external_id))
            .await?;

        let grant = self
            .store
            .upsert_grant(&AccountGrant {
                owner_id: owner_id.to_string(),
                account_id: credentials.account_id,
                role_arn: role_arn.to_string(),
                external_id: external_id.to_string(),
                region: region.to_string(),
                name: name.map(str::to_string),
                created_at: now(),
            })
            .await?;

        info!(
            owner_id = %owner_id,
            account_id = %grant.account_id,
            region = %grant.region,
            "Account connected"
        );

        Ok(grant)
    }

    /// Change the region or display name of a grant.
    pub async fn update_account(
        &self,
        owner_id: &str,
        account_id: &str,
        region: Option<&str>,
        name: Option<&str>,
    ) -> Result<AccountGrant> {
        let mut grant = self.grant(owner_id, account_id).await?;

        if let Some(region) = region {
            require("region", region)?;
            grant.region = region.to_string();
        }
        if let Some(name) = name {
            grant.name = Some(name.to_string());
        }

        Ok(self.store.upsert_grant(&grant).await?)
    }

    /// Revoke a grant. Returns whether it existed.
    ///
    /// Outstanding jobs of the account are failed by the next tick.
    pub async fn disconnect_account(&self, owner_id: &str, account_id: &str) -> Result<bool> {
        let deleted = self.store.delete_grant(owner_id, account_id).await?;
        if deleted {
            info!(owner_id = %owner_id, account_id = %account_id, "Account disconnected");
        }
        Ok(deleted)
    }

    /// List the owner's grants.
    pub async fn list_accounts(&self, owner_id: &str) -> Result<Vec<AccountGrant>> {
        Ok(self.store.list_grants(owner_id).await?)
    }

    // ========================================================================
    // Stacks
    // ========================================================================

    /// Re-list the account's stacks, upsert each and prune vanished ones.
    ///
    /// Returns the number of live stacks.
    pub async fn refresh_stacks(&self, owner_id: &str, account_id: &str) -> Result<usize> {
        let grant = self.grant(owner_id, account_id).await?;
        let scope = self.scope(&grant).await?;

        let stacks = deadline(self.remote_timeout, self.gateway.list_stacks(&scope)).await?;
        let names: Vec<String> = stacks.iter().map(|s| s.stack_name.clone()).collect();
        let count = stacks.len();

        for stack in stacks {
            self.store
                .upsert_stack(&stack_upsert(account_id, &grant.region, stack))
                .await?;
        }

        let pruned = self
            .store
            .prune_stacks(account_id, &grant.region, &names)
            .await?;

        info!(
            account_id = %account_id,
            region = %grant.region,
            stacks = count,
            pruned = pruned,
            "Stack listing refreshed"
        );

        Ok(count)
    }

    /// Stacks of every connected account, each with its latest job.
    pub async fn list_stacks_with_drift_status(&self, owner_id: &str) -> Result<Vec<StackView>> {
        let stacks = self.store.list_stacks_for_owner(owner_id).await?;
        let mut latest: HashMap<StackKey, _> = self
            .store
            .latest_jobs_for_owner(owner_id)
            .await?
            .into_iter()
            .map(|job| (job.stack_key(), job))
            .collect();

        let now = now();
        Ok(stacks
            .into_iter()
            .map(|stack| {
                let latest_job = latest.remove(&stack.key());
                let stale = latest_job
                    .as_ref()
                    .is_some_and(|job| job.is_stale(now, self.retention));
                StackView {
                    stack,
                    latest_job,
                    stale,
                }
            })
            .collect())
    }

    // ========================================================================
    // Drift detection
    // ========================================================================

    /// Start drift detection for a stack.
    ///
    /// Returns once the remote accepted the trigger. An outstanding job for the
    /// same stack is superseded.
    pub async fn trigger(
        &self,
        owner_id: &str,
        account_id: &str,
        stack_name: &str,
    ) -> Result<TriggerOutcome> {
        require("stack_name", stack_name)?;
        let grant = self.grant(owner_id, account_id).await?;
        let scope = self.scope(&grant).await?;

        let remote_operation_id = deadline(
            self.remote_timeout,
            self.gateway.trigger_drift(&scope, stack_name),
        )
        .await?;

        let new_job = NewDriftJob {
            remote_operation_id: remote_operation_id.clone(),
            owner_id: owner_id.to_string(),
            key: StackKey::new(account_id, stack_name, &grant.region),
            started_at: now(),
        };

        let creation = match self.store.create_job(&new_job).await {
            Err(StoreError::Conflict(message)) => {
                warn!(
                    remote_operation_id = %remote_operation_id,
                    error = %message,
                    "Concurrent trigger for the same stack, retrying"
                );
                self.store.create_job(&new_job).await?
            }
            other => other?,
        };

        for superseded in &creation.superseded {
            debug!(
                remote_operation_id = %superseded,
                superseded_by = %remote_operation_id,
                "Drift job superseded"
            );
        }

        info!(
            remote_operation_id = %remote_operation_id,
            stack = %new_job.key,
            "Drift detection triggered"
        );

        Ok(TriggerOutcome {
            remote_operation_id,
            status: creation.job.status,
            superseded: creation.superseded,
        })
    }

    /// Get one of the owner's jobs.
    pub async fn get_job(&self, owner_id: &str, remote_operation_id: &str) -> Result<JobView> {
        let not_found = || Error::JobNotFound(remote_operation_id.to_string());
        let job = self
            .store
            .get_job(remote_operation_id)
            .await?
            .ok_or_else(not_found)?;

        if job.owner_id != owner_id
            && self
                .store
                .get_grant(owner_id, &job.account_id)
                .await?
                .is_none()
        {
            return Err(not_found());
        }

        let stale = job.is_stale(now(), self.retention);
        Ok(JobView { job, stale })
    }

    /// Resource drift snapshot of a stack in the grant's region.
    pub async fn list_resource_drifts(
        &self,
        owner_id: &str,
        account_id: &str,
        stack_name: &str,
    ) -> Result<Vec<ResourceDrift>> {
        let grant = self.grant(owner_id, account_id).await?;
        let key = StackKey::new(account_id, stack_name, &grant.region);
        let stack = self
            .store
            .get_stack(&key)
            .await?
            .ok_or_else(|| Error::StackNotFound(key.to_string()))?;

        Ok(self.store.list_resource_drifts(&stack.stack_id).await?)
    }

    /// Snapshot of a stack grouped by resource kind.
    pub async fn drift_summary(
        &self,
        owner_id: &str,
        account_id: &str,
        stack_name: &str,
    ) -> Result<Vec<KindSummary>> {
        let drifts = self
            .list_resource_drifts(owner_id, account_id, stack_name)
            .await?;
        Ok(summarize_by_kind(&drifts))
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn grant(&self, owner_id: &str, account_id: &str) -> Result<AccountGrant> {
        self.store
            .get_grant(owner_id, account_id)
            .await?
            .ok_or_else(|| Error::AccountDisconnected {
                owner_id: owner_id.to_string(),
                account_id: account_id.to_string(),
            })
    }

    async fn scope(&self, grant: &AccountGrant) -> Result<RemoteScope> {
        let credentials = deadline(
            self.remote_timeout,
            self.broker.acquire(&grant.role_arn, &grant.external_id),
        )
        .await?;
        Ok(RemoteScope::new(credentials, &grant.region))
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidRequest(format!("{} must not be empty", field)));
    }
    Ok(())
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the PostgreSQL job store.
//!
//! Skipped unless `TEST_STACKWATCH_DATABASE_URL` points at a database. Every
//! test works in its own random account so tests can share one database.

use std::collections::BTreeMap;

use stackwatch::gateway::MockGateway;
use stackwatch::store::{JobStore, PostgresStore, SUPERSEDED_REASON, StoreError, now};
use stackwatch::types::{
    AccountGrant, JobOutcome, JobStatus, NewDriftJob, SnapshotApply, StackDriftStatus, StackKey,
    StackUpsert,
};
use uuid::Uuid;

/// Helper macro to skip tests if database URL is not set.
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_STACKWATCH_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_STACKWATCH_DATABASE_URL not set");
            return;
        }
    };
}

async fn get_test_store() -> Option<PostgresStore> {
    let database_url = std::env::var("TEST_STACKWATCH_DATABASE_URL").ok()?;
    PostgresStore::connect(&database_url).await.ok()
}

/// A random 12-digit account id.
fn random_account() -> String {
    format!("{:012}", Uuid::new_v4().as_u128() % 1_000_000_000_000)
}

fn new_job(op: &str, key: &StackKey) -> NewDriftJob {
    NewDriftJob {
        remote_operation_id: op.to_string(),
        owner_id: "pg-owner".to_string(),
        key: key.clone(),
        started_at: now(),
    }
}

fn unique_op() -> String {
    format!("op-{}", Uuid::new_v4())
}

#[tokio::test]
async fn test_grant_roundtrip_and_delete() {
    skip_if_no_db!();
    let Some(store) = get_test_store().await else {
        eprintln!("Skipping test: failed to connect");
        return;
    };
    let account = random_account();

    let grant = store
        .upsert_grant(&AccountGrant {
            owner_id: "pg-owner".to_string(),
            account_id: account.clone(),
            role_arn: format!("arn:aws:iam::{}:role/Reader", account),
            external_id: "external-1".to_string(),
            region: "us-east-1".to_string(),
            name: None,
            created_at: now(),
        })
        .await
        .unwrap();

    let loaded = store.get_grant("pg-owner", &account).await.unwrap().unwrap();
    assert_eq!(loaded, grant);

    store
        .upsert_stack(&StackUpsert {
            key: StackKey::new(&account, "demo-stack", "us-east-1"),
            stack_arn: None,
            last_known_status: Some("CREATE_COMPLETE".to_string()),
            drift_status: StackDriftStatus::NotChecked,
            detection_time: None,
            tags: BTreeMap::new(),
            outputs: BTreeMap::new(),
            parameters: BTreeMap::new(),
        })
        .await
        .unwrap();

    assert!(store.delete_grant("pg-owner", &account).await.unwrap());
    assert!(store.get_grant("pg-owner", &account).await.unwrap().is_none());
    assert!(
        store
            .get_stack(&StackKey::new(&account, "demo-stack", "us-east-1"))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_create_job_supersedes_outstanding() {
    skip_if_no_db!();
    let Some(store) = get_test_store().await else {
        eprintln!("Skipping test: failed to connect");
        return;
    };
    let key = StackKey::new(random_account(), "demo-stack", "us-east-1");
    let first = unique_op();
    let second = unique_op();

    let created = store.create_job(&new_job(&first, &key)).await.unwrap();
    assert!(created.superseded.is_empty());
    assert_eq!(created.job.status, JobStatus::InProgress);

    let created = store.create_job(&new_job(&second, &key)).await.unwrap();
    assert_eq!(created.superseded, vec![first.clone()]);

    let old = store.get_job(&first).await.unwrap().unwrap();
    assert_eq!(old.status, JobStatus::Failed);
    assert_eq!(old.failure_reason.as_deref(), Some(SUPERSEDED_REASON));

    let stack = store.get_stack(&key).await.unwrap().unwrap();
    assert_eq!(stack.drift_status, StackDriftStatus::DetectionInProgress);

    // Reusing an operation id conflicts.
    let err = store.create_job(&new_job(&second, &key)).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
}

#[tokio::test]
async fn test_finish_and_apply_snapshot() {
    skip_if_no_db!();
    let Some(store) = get_test_store().await else {
        eprintln!("Skipping test: failed to connect");
        return;
    };
    let key = StackKey::new(random_account(), "drifted-stack", "us-east-1");
    let op = unique_op();

    store.create_job(&new_job(&op, &key)).await.unwrap();
    assert!(store.finish_job(&op, &JobOutcome::Drifted).await.unwrap());
    assert!(!store.finish_job(&op, &JobOutcome::InSync).await.unwrap());

    let job = store.get_job(&op).await.unwrap().unwrap();
    assert!(job.needs_reconcile());

    let drifts = vec![
        MockGateway::modified_resource("Bucket", "AWS::S3::Bucket"),
        MockGateway::modified_resource("Fn", "AWS::Lambda::Function"),
    ];
    assert_eq!(
        store.apply_drift_snapshot(&job, &drifts).await.unwrap(),
        SnapshotApply::Applied(2)
    );
    assert_eq!(
        store.apply_drift_snapshot(&job, &drifts[..1]).await.unwrap(),
        SnapshotApply::Applied(1)
    );

    let stack = store.get_stack(&key).await.unwrap().unwrap();
    assert_eq!(stack.drift_status, StackDriftStatus::Drifted);
    let rows = store.list_resource_drifts(&stack.stack_id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].logical_resource_id, "Bucket");

    let job = store.get_job(&op).await.unwrap().unwrap();
    assert!(job.reconciled_at.is_some());
}

#[tokio::test]
async fn test_outstanding_jobs_respect_cutoff() {
    skip_if_no_db!();
    let Some(store) = get_test_store().await else {
        eprintln!("Skipping test: failed to connect");
        return;
    };
    let account = random_account();
    let fresh = unique_op();
    let old = unique_op();

    store
        .create_job(&new_job(&fresh, &StackKey::new(&account, "fresh", "us-east-1")))
        .await
        .unwrap();
    store
        .create_job(&NewDriftJob {
            started_at: now() - chrono::Duration::hours(25),
            ..new_job(&old, &StackKey::new(&account, "old", "us-east-1"))
        })
        .await
        .unwrap();

    let outstanding = store
        .find_outstanding_jobs(Some(now() - chrono::Duration::hours(24)))
        .await
        .unwrap();
    assert!(outstanding.iter().any(|j| j.remote_operation_id == fresh));
    assert!(!outstanding.iter().any(|j| j.remote_operation_id == old));
}

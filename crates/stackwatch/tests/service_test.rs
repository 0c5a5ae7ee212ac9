// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the drift service: grants, listing refresh, trigger path and reads.

mod common;

use common::{ACCOUNT, EXTERNAL_ID, OWNER, REGION, ROLE, TestContext};
use stackwatch::broker::BrokerError;
use stackwatch::error::{Error, ErrorClass};
use stackwatch::gateway::{DetectionReport, GatewayError, MockGateway};
use stackwatch::resource_kind::ResourceKind;
use stackwatch::store::{JobStore, SUPERSEDED_REASON};
use stackwatch::types::{JobStatus, StackDriftStatus, StackKey};

#[tokio::test]
async fn test_connect_account_records_grant() {
    let ctx = TestContext::new().await;
    let grant = ctx.connect_account().await;

    assert_eq!(grant.owner_id, OWNER);
    assert_eq!(grant.account_id, ACCOUNT);
    assert_eq!(grant.region, REGION);
    assert_eq!(grant.name.as_deref(), Some("test account"));

    let grants = ctx.service.list_accounts(OWNER).await.unwrap();
    assert_eq!(grants.len(), 1);
}

#[tokio::test]
async fn test_reconnect_updates_region_only_with_same_role() {
    let ctx = TestContext::new().await;
    let original = ctx.connect_account().await;

    let updated = ctx
        .service
        .connect_account(OWNER, ROLE, EXTERNAL_ID, "eu-west-1", None)
        .await
        .unwrap();
    assert_eq!(updated.region, "eu-west-1");
    assert_eq!(updated.created_at, original.created_at);

    let err = ctx
        .service
        .connect_account(OWNER, ROLE, "another-external-id", REGION, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    let err = ctx
        .service
        .connect_account(
            OWNER,
            "arn:aws:iam::123456789012:role/SomethingElse",
            EXTERNAL_ID,
            REGION,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
}

#[tokio::test]
async fn test_connect_rejects_malformed_role_before_remote_call() {
    let ctx = TestContext::new().await;

    let err = ctx
        .service
        .connect_account(OWNER, "arn:aws:iam::12345:role/Short", EXTERNAL_ID, REGION, None)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "MALFORMED");
    assert_eq!(err.class(), ErrorClass::Permanent);
    assert_eq!(ctx.broker.acquisitions(), 0);
}

#[tokio::test]
async fn test_connect_identity_mismatch_stores_nothing() {
    let ctx = TestContext::new().await;
    ctx.broker.report_identity(ROLE, "999999999999").await;

    let err = ctx
        .service
        .connect_account(OWNER, ROLE, EXTERNAL_ID, REGION, None)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "IDENTITY_MISMATCH");
    assert_eq!(err.class(), ErrorClass::Permanent);
    assert!(ctx.service.list_accounts(OWNER).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_connect_access_denied() {
    let ctx = TestContext::new().await;
    ctx.broker
        .fail_role(ROLE, BrokerError::AccessDenied("not trusted".into()))
        .await;

    let err = ctx
        .service
        .connect_account(OWNER, ROLE, EXTERNAL_ID, REGION, None)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "ACCESS_DENIED");
    assert!(ctx.service.list_accounts(OWNER).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_update_account() {
    let ctx = TestContext::new().await;
    ctx.connect_account().await;

    let grant = ctx
        .service
        .update_account(OWNER, ACCOUNT, Some("ap-southeast-2"), Some("prod"))
        .await
        .unwrap();
    assert_eq!(grant.region, "ap-southeast-2");
    assert_eq!(grant.name.as_deref(), Some("prod"));
    assert_eq!(grant.role_arn, ROLE);

    let err = ctx
        .service
        .update_account(OWNER, ACCOUNT, Some(" "), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    let err = ctx
        .service
        .update_account("someone-else", ACCOUNT, Some("eu-west-1"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AccountDisconnected { .. }));
}

#[tokio::test]
async fn test_trigger_without_grant_is_account_disconnected() {
    let ctx = TestContext::new().await;
    ctx.add_remote_stack("demo-stack").await;

    let err = ctx
        .service
        .trigger(OWNER, ACCOUNT, "demo-stack")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AccountDisconnected { .. }));
    assert_eq!(err.class(), ErrorClass::Permanent);
    assert_eq!(err.error_code(), "ACCOUNT_DISCONNECTED");
    assert_eq!(ctx.gateway.trigger_calls(), 0);
}

#[tokio::test]
async fn test_trigger_unknown_stack_creates_no_job() {
    let ctx = TestContext::new().await;
    ctx.connect_account().await;

    let err = ctx
        .service
        .trigger(OWNER, ACCOUNT, "missing-stack")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Gateway(GatewayError::NotFound(_))));
    assert_eq!(err.error_code(), "STACK_NOT_FOUND");
    assert_eq!(err.class(), ErrorClass::Permanent);

    let jobs = ctx
        .store
        .list_jobs_for_stack(&StackKey::new(ACCOUNT, "missing-stack", REGION), 10)
        .await
        .unwrap();
    assert!(jobs.is_empty());
    assert!(ctx.stack("missing-stack").await.is_none());
}

#[tokio::test]
async fn test_trigger_transient_failure_is_reported() {
    let ctx = TestContext::new().await;
    ctx.connect_account().await;
    ctx.add_remote_stack("demo-stack").await;
    ctx.gateway
        .fail_stack("demo-stack", GatewayError::Throttled("Rate exceeded".into()))
        .await;

    let err = ctx
        .service
        .trigger(OWNER, ACCOUNT, "demo-stack")
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Transient);
    assert_eq!(err.error_code(), "THROTTLED");
}

#[tokio::test]
async fn test_second_trigger_supersedes_outstanding_job() {
    let ctx = TestContext::new().await;
    let first = ctx.triggered("demo-stack").await;

    let outcome = ctx
        .service
        .trigger(OWNER, ACCOUNT, "demo-stack")
        .await
        .unwrap();
    assert_eq!(outcome.status, JobStatus::InProgress);
    assert_eq!(outcome.superseded, vec![first.clone()]);

    let old = ctx.job(&first).await;
    assert_eq!(old.status, JobStatus::Failed);
    assert_eq!(old.failure_reason.as_deref(), Some(SUPERSEDED_REASON));

    let jobs = ctx
        .store
        .list_jobs_for_stack(&StackKey::new(ACCOUNT, "demo-stack", REGION), 10)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(
        jobs.iter()
            .filter(|j| j.status == JobStatus::InProgress)
            .count(),
        1
    );
    assert_eq!(
        ctx.stack("demo-stack").await.unwrap().drift_status,
        StackDriftStatus::DetectionInProgress
    );
}

#[tokio::test]
async fn test_refresh_stacks_upserts_and_prunes() {
    let ctx = TestContext::new().await;
    ctx.connect_account().await;
    for name in ["stack-a", "stack-b", "stack-c"] {
        ctx.add_remote_stack(name).await;
    }

    assert_eq!(ctx.service.refresh_stacks(OWNER, ACCOUNT).await.unwrap(), 3);
    let stack = ctx.stack("stack-a").await.unwrap();
    assert_eq!(stack.drift_status, StackDriftStatus::NotChecked);
    assert_eq!(stack.last_known_status.as_deref(), Some("CREATE_COMPLETE"));

    // stack-c has detection outstanding and survives pruning.
    ctx.trigger("stack-c").await;
    ctx.gateway.remove_stack(ACCOUNT, REGION, "stack-b").await;
    ctx.gateway.remove_stack(ACCOUNT, REGION, "stack-c").await;

    assert_eq!(ctx.service.refresh_stacks(OWNER, ACCOUNT).await.unwrap(), 1);
    assert!(ctx.stack("stack-a").await.is_some());
    assert!(ctx.stack("stack-b").await.is_none());
    assert_eq!(
        ctx.stack("stack-c").await.unwrap().drift_status,
        StackDriftStatus::DetectionInProgress
    );
}

#[tokio::test]
async fn test_list_stacks_with_latest_job() {
    let ctx = TestContext::new().await;
    ctx.connect_account().await;
    ctx.add_remote_stack("stack-a").await;
    ctx.add_remote_stack("stack-b").await;
    ctx.service.refresh_stacks(OWNER, ACCOUNT).await.unwrap();
    let op = ctx.trigger("stack-b").await;

    let views = ctx.service.list_stacks_with_drift_status(OWNER).await.unwrap();
    assert_eq!(views.len(), 2);

    let a = views.iter().find(|v| v.stack.stack_name == "stack-a").unwrap();
    assert!(a.latest_job.is_none());
    assert!(!a.stale);

    let b = views.iter().find(|v| v.stack.stack_name == "stack-b").unwrap();
    assert_eq!(
        b.latest_job.as_ref().map(|j| j.remote_operation_id.as_str()),
        Some(op.as_str())
    );
    assert!(!b.stale);

    assert!(
        ctx.service
            .list_stacks_with_drift_status("someone-else")
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_get_job_is_owner_scoped() {
    let ctx = TestContext::new().await;
    let op = ctx.triggered("demo-stack").await;

    let view = ctx.service.get_job(OWNER, &op).await.unwrap();
    assert_eq!(view.job.remote_operation_id, op);
    assert!(!view.stale);

    let err = ctx.service.get_job("someone-else", &op).await.unwrap_err();
    assert!(matches!(err, Error::JobNotFound(_)));

    let err = ctx.service.get_job(OWNER, "op-unknown").await.unwrap_err();
    assert!(matches!(err, Error::JobNotFound(_)));
}

#[tokio::test]
async fn test_disconnect_removes_stacks_but_keeps_jobs() {
    let ctx = TestContext::new().await;
    let op = ctx.triggered("demo-stack").await;

    assert!(ctx.service.disconnect_account(OWNER, ACCOUNT).await.unwrap());
    assert!(!ctx.service.disconnect_account(OWNER, ACCOUNT).await.unwrap());

    assert!(ctx.stack("demo-stack").await.is_none());
    assert_eq!(ctx.job(&op).await.status, JobStatus::InProgress);

    let err = ctx
        .service
        .list_resource_drifts(OWNER, ACCOUNT, "demo-stack")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AccountDisconnected { .. }));
}

#[tokio::test]
async fn test_resource_drifts_and_summary() {
    let ctx = TestContext::new().await;
    let op = ctx.triggered("drifted-stack").await;

    let err = ctx
        .service
        .list_resource_drifts(OWNER, ACCOUNT, "unknown-stack")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StackNotFound(_)));

    ctx.gateway
        .set_resource_drifts(
            "drifted-stack",
            vec![
                MockGateway::modified_resource("Bucket", "AWS::S3::Bucket"),
                MockGateway::modified_resource("Instance", "AWS::EC2::Instance"),
                MockGateway::modified_resource("Web", "AWS::EC2::Instance"),
            ],
        )
        .await;
    ctx.gateway
        .set_report(&op, DetectionReport::complete(StackDriftStatus::Drifted))
        .await;
    ctx.orchestrator().tick().await;

    let drifts = ctx
        .service
        .list_resource_drifts(OWNER, ACCOUNT, "drifted-stack")
        .await
        .unwrap();
    assert_eq!(drifts.len(), 3);
    assert!(drifts[0].actual_properties.is_some());
    assert_eq!(drifts[0].property_differences.len(), 1);

    let summary = ctx
        .service
        .drift_summary(OWNER, ACCOUNT, "drifted-stack")
        .await
        .unwrap();
    let instances = summary
        .iter()
        .find(|s| s.kind == ResourceKind::Ec2Instance)
        .unwrap();
    assert_eq!(instances.resources, 2);
    assert_eq!(instances.modified, 2);
    let buckets = summary
        .iter()
        .find(|s| s.kind == ResourceKind::S3Bucket)
        .unwrap();
    assert_eq!(buckets.resources, 1);
}

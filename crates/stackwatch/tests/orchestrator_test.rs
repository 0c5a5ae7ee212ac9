// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the drift orchestrator tick.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ACCOUNT, OWNER, REGION, ROLE, TestContext};
use stackwatch::broker::BrokerError;
use stackwatch::gateway::{DetectionReport, GatewayError, MockGateway};
use stackwatch::orchestrator::{ACCOUNT_DISCONNECTED_REASON, OrchestratorConfig};
use stackwatch::store::{JobStore, now};
use stackwatch::types::{JobStatus, NewDriftJob, StackDriftStatus, StackKey};

#[tokio::test]
async fn test_in_sync_completion() {
    let ctx = TestContext::new().await;
    let op = ctx.triggered("demo-stack").await;

    let job = ctx.job(&op).await;
    assert_eq!(job.status, JobStatus::InProgress);
    assert_eq!(
        ctx.stack("demo-stack").await.unwrap().drift_status,
        StackDriftStatus::DetectionInProgress
    );

    ctx.gateway
        .set_report(&op, DetectionReport::complete(StackDriftStatus::InSync))
        .await;

    let report = ctx.orchestrator().tick().await;
    assert_eq!(report.polled, 1);
    assert_eq!(report.completed, 1);
    assert_eq!(report.reconciled, 0);

    let job = ctx.job(&op).await;
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.drift_status, Some(StackDriftStatus::InSync));
    assert!(job.completed_at.is_some());

    let stack = ctx.stack("demo-stack").await.unwrap();
    assert_eq!(stack.drift_status, StackDriftStatus::InSync);
    assert!(stack.detection_time.is_some());
    assert!(
        ctx.store
            .list_resource_drifts(&stack.stack_id)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(ctx.gateway.detail_calls(), 0);
}

#[tokio::test]
async fn test_remote_in_progress_is_a_no_op() {
    let ctx = TestContext::new().await;
    let op = ctx.triggered("demo-stack").await;

    let report = ctx.orchestrator().tick().await;
    assert_eq!(report.pending, 1);
    assert_eq!(ctx.job(&op).await.status, JobStatus::InProgress);
}

#[tokio::test]
async fn test_drifted_snapshot_replaces_prior_rows() {
    let ctx = TestContext::new().await;
    let orchestrator = ctx.orchestrator();

    // First detection leaves three drifted resources.
    let first = ctx.triggered("drifted-stack").await;
    ctx.gateway
        .set_resource_drifts(
            "drifted-stack",
            vec![
                MockGateway::modified_resource("Bucket", "AWS::S3::Bucket"),
                MockGateway::modified_resource("Queue", "AWS::SQS::Queue"),
                MockGateway::modified_resource("Fn", "AWS::Lambda::Function"),
            ],
        )
        .await;
    ctx.gateway
        .set_report(&first, DetectionReport::complete(StackDriftStatus::Drifted))
        .await;
    let report = orchestrator.tick().await;
    assert_eq!(report.completed, 1);
    assert_eq!(report.reconciled, 1);

    let stack = ctx.stack("drifted-stack").await.unwrap();
    assert_eq!(stack.drift_status, StackDriftStatus::Drifted);
    assert_eq!(
        ctx.store
            .list_resource_drifts(&stack.stack_id)
            .await
            .unwrap()
            .len(),
        3
    );

    // Second detection reports two.
    let second = ctx.trigger("drifted-stack").await;
    ctx.gateway
        .set_resource_drifts(
            "drifted-stack",
            vec![
                MockGateway::modified_resource("Bucket", "AWS::S3::Bucket"),
                MockGateway::modified_resource("Instance", "AWS::EC2::Instance"),
            ],
        )
        .await;
    ctx.gateway
        .set_report(&second, DetectionReport::complete(StackDriftStatus::Drifted))
        .await;
    orchestrator.tick().await;

    let rows = ctx.store.list_resource_drifts(&stack.stack_id).await.unwrap();
    let ids: Vec<_> = rows.iter().map(|r| r.logical_resource_id.as_str()).collect();
    assert_eq!(ids, vec!["Bucket", "Instance"]);

    let job = ctx.job(&second).await;
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.drift_status, Some(StackDriftStatus::Drifted));
    assert!(job.reconciled_at.is_some());
}

#[tokio::test]
async fn test_detail_fetch_failure_retried_next_tick() {
    let ctx = TestContext::new().await;
    let orchestrator = ctx.orchestrator();
    let op = ctx.triggered("drifted-stack").await;

    ctx.gateway
        .set_resource_drifts(
            "drifted-stack",
            vec![MockGateway::modified_resource("Bucket", "AWS::S3::Bucket")],
        )
        .await;
    ctx.gateway
        .set_report(&op, DetectionReport::complete(StackDriftStatus::Drifted))
        .await;
    ctx.gateway
        .fail_stack("drifted-stack", GatewayError::Throttled("Rate exceeded".into()))
        .await;

    let report = orchestrator.tick().await;
    assert_eq!(report.completed, 1);
    assert_eq!(report.reconciled, 0);

    // Detail-fetch failure is not a detection failure.
    let job = ctx.job(&op).await;
    assert_eq!(job.status, JobStatus::Complete);
    assert!(job.needs_reconcile());
    assert_eq!(
        ctx.stack("drifted-stack").await.unwrap().drift_status,
        StackDriftStatus::DetectionInProgress
    );

    ctx.gateway.heal().await;
    let report = orchestrator.tick().await;
    assert_eq!(report.polled, 1);
    assert_eq!(report.reconciled, 1);

    let stack = ctx.stack("drifted-stack").await.unwrap();
    assert_eq!(stack.drift_status, StackDriftStatus::Drifted);
    assert_eq!(
        ctx.store
            .list_resource_drifts(&stack.stack_id)
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(!ctx.job(&op).await.needs_reconcile());

    // Nothing left to do.
    assert_eq!(orchestrator.tick().await.polled, 0);
}

#[tokio::test]
async fn test_remote_failure_marks_job_failed() {
    let ctx = TestContext::new().await;
    let op = ctx.triggered("demo-stack").await;
    ctx.gateway
        .set_report(&op, DetectionReport::failed("Stack is being updated"))
        .await;

    let report = ctx.orchestrator().tick().await;
    assert_eq!(report.failed, 1);

    let job = ctx.job(&op).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_reason.as_deref(), Some("Stack is being updated"));
    assert_eq!(
        ctx.stack("demo-stack").await.unwrap().drift_status,
        StackDriftStatus::Unknown
    );
}

#[tokio::test]
async fn test_fault_isolation_between_jobs() {
    let ctx = TestContext::new().await;
    ctx.connect_account().await;
    for name in ["stack-a", "stack-b", "stack-c"] {
        ctx.add_remote_stack(name).await;
    }
    let op_a = ctx.trigger("stack-a").await;
    let op_b = ctx.trigger("stack-b").await;
    let op_c = ctx.trigger("stack-c").await;

    ctx.gateway
        .fail_operation(&op_a, GatewayError::Remote("InternalFailure".into()))
        .await;
    ctx.gateway
        .fail_operation(&op_b, GatewayError::AccessDenied("not authorized".into()))
        .await;
    ctx.gateway
        .set_report(&op_c, DetectionReport::complete(StackDriftStatus::InSync))
        .await;

    let report = ctx.orchestrator().tick().await;
    assert_eq!(report.polled, 3);
    assert_eq!(report.deferred, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.completed, 1);

    // Transient: left for the next tick.
    assert_eq!(ctx.job(&op_a).await.status, JobStatus::InProgress);

    // Permanent: failed with its error code.
    let job_b = ctx.job(&op_b).await;
    assert_eq!(job_b.status, JobStatus::Failed);
    assert!(
        job_b
            .failure_reason
            .as_deref()
            .unwrap()
            .starts_with("ACCESS_DENIED: ")
    );

    assert_eq!(ctx.job(&op_c).await.status, JobStatus::Complete);
}

#[tokio::test]
async fn test_account_disconnected_mid_flight() {
    let ctx = TestContext::new().await;
    let op = ctx.triggered("demo-stack").await;

    assert!(ctx.service.disconnect_account(OWNER, ACCOUNT).await.unwrap());

    let acquisitions = ctx.broker.acquisitions();
    let report = ctx.orchestrator().tick().await;
    assert_eq!(report.failed, 1);
    assert_eq!(ctx.broker.acquisitions(), acquisitions);

    let job = ctx.job(&op).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.failure_reason.as_deref(),
        Some(ACCOUNT_DISCONNECTED_REASON)
    );
}

#[tokio::test]
async fn test_credential_errors_are_classified() {
    let ctx = TestContext::new().await;
    let op = ctx.triggered("demo-stack").await;
    let orchestrator = ctx.orchestrator();

    ctx.broker
        .fail_role(ROLE, BrokerError::Throttled("Rate exceeded".into()))
        .await;
    let report = orchestrator.tick().await;
    assert_eq!(report.deferred, 1);
    assert_eq!(ctx.job(&op).await.status, JobStatus::InProgress);

    ctx.broker
        .fail_role(ROLE, BrokerError::AccessDenied("trust policy changed".into()))
        .await;
    let report = orchestrator.tick().await;
    assert_eq!(report.failed, 1);

    let job = ctx.job(&op).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(
        job.failure_reason
            .as_deref()
            .unwrap()
            .starts_with("ACCESS_DENIED: ")
    );
}

#[tokio::test]
async fn test_credentials_acquired_every_tick() {
    let ctx = TestContext::new().await;
    ctx.triggered("demo-stack").await;
    let orchestrator = ctx.orchestrator();

    let before = ctx.broker.acquisitions();
    orchestrator.tick().await;
    orchestrator.tick().await;
    assert_eq!(ctx.broker.acquisitions(), before + 2);
}

#[tokio::test]
async fn test_inconsistent_completion_skips_job() {
    let ctx = TestContext::new().await;
    let op = ctx.triggered("demo-stack").await;
    ctx.gateway
        .set_report(&op, DetectionReport::complete(StackDriftStatus::Unknown))
        .await;

    let report = ctx.orchestrator().tick().await;
    assert_eq!(report.ignored, 1);

    let job = ctx.job(&op).await;
    assert_eq!(job.status, JobStatus::InProgress);
    assert_eq!(
        ctx.stack("demo-stack").await.unwrap().drift_status,
        StackDriftStatus::DetectionInProgress
    );
}

#[tokio::test]
async fn test_stale_job_excluded_and_reported() {
    let ctx = TestContext::new().await;
    ctx.connect_account().await;

    ctx.store
        .create_job(&NewDriftJob {
            remote_operation_id: "op-stale".to_string(),
            owner_id: OWNER.to_string(),
            key: StackKey::new(ACCOUNT, "old-stack", REGION),
            started_at: now() - chrono::Duration::hours(25),
        })
        .await
        .unwrap();

    let report = ctx.orchestrator().tick().await;
    assert_eq!(report.polled, 0);
    assert_eq!(ctx.gateway.status_calls(), 0);

    let view = ctx.service.get_job(OWNER, "op-stale").await.unwrap();
    assert_eq!(view.job.status, JobStatus::InProgress);
    assert!(view.stale);

    let stacks = ctx.service.list_stacks_with_drift_status(OWNER).await.unwrap();
    let old = stacks
        .iter()
        .find(|s| s.stack.stack_name == "old-stack")
        .unwrap();
    assert!(old.stale);
}

#[tokio::test]
async fn test_hung_call_leaves_job_in_progress() {
    let ctx = TestContext::new().await;
    let op = ctx.triggered("demo-stack").await;
    ctx.gateway.stall_operation(&op).await;

    let orchestrator = ctx.orchestrator_with(OrchestratorConfig {
        remote_timeout: Duration::from_millis(100),
        ..Default::default()
    });

    let report = orchestrator.tick().await;
    assert_eq!(report.deferred, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(ctx.job(&op).await.status, JobStatus::InProgress);
}

#[tokio::test]
async fn test_overlapping_tick_is_skipped() {
    let ctx = TestContext::new().await;
    let op = ctx.triggered("demo-stack").await;
    ctx.gateway.stall_operation(&op).await;

    let orchestrator = Arc::new(ctx.orchestrator_with(OrchestratorConfig {
        remote_timeout: Duration::from_millis(500),
        ..Default::default()
    }));

    let running = orchestrator.clone();
    let first = tokio::spawn(async move { running.tick().await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = orchestrator.tick().await;
    assert!(second.skipped);
    assert_eq!(second.polled, 0);

    let first = first.await.unwrap();
    assert!(!first.skipped);
    assert_eq!(first.polled, 1);
    assert_eq!(first.deferred, 1);
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let ctx = TestContext::new().await;
    let op = ctx.triggered("demo-stack").await;
    ctx.gateway
        .set_report(&op, DetectionReport::complete(StackDriftStatus::InSync))
        .await;

    let orchestrator = Arc::new(ctx.orchestrator_with(OrchestratorConfig {
        poll_interval: Duration::from_millis(20),
        remote_timeout: Duration::from_secs(5),
        ..Default::default()
    }));
    let shutdown = orchestrator.shutdown_handle();

    let running = orchestrator.clone();
    let handle = tokio::spawn(async move { running.run().await });

    let mut completed = false;
    for _ in 0..100 {
        if ctx.job(&op).await.status == JobStatus::Complete {
            completed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(completed, "job was not completed by the running loop");

    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("orchestrator did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_file_store_completes_every_job_in_one_tick() {
    let ctx = TestContext::file_backed().await;
    ctx.connect_account().await;

    let mut ops = Vec::new();
    for i in 0..40 {
        let name = format!("stack-{}", i);
        ctx.add_remote_stack(&name).await;
        let op = ctx.trigger(&name).await;
        ctx.gateway
            .set_report(&op, DetectionReport::complete(StackDriftStatus::InSync))
            .await;
        ops.push((name, op));
    }

    let report = ctx.orchestrator().tick().await;
    assert_eq!(report.polled, 40);
    assert_eq!(report.completed, 40, "{:?}", report);
    assert_eq!(report.deferred, 0);

    for (name, op) in &ops {
        assert_eq!(ctx.job(op).await.status, JobStatus::Complete);
        assert_eq!(
            ctx.stack(name).await.unwrap().drift_status,
            StackDriftStatus::InSync
        );
    }
}

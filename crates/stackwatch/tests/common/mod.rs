// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for stackwatch integration tests.
//!
//! Provides a TestContext wiring a SQLite store (in-memory by default, or a
//! temporary file) to the mock broker and mock gateway.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use stackwatch::broker::MockBroker;
use stackwatch::gateway::MockGateway;
use stackwatch::orchestrator::{DriftOrchestrator, OrchestratorConfig};
use stackwatch::service::DriftService;
use stackwatch::store::{JobStore, SqliteStore};
use stackwatch::types::{AccountGrant, DriftJob, StackKey, StackRecord};

pub const OWNER: &str = "owner-1";
pub const ACCOUNT: &str = "123456789012";
pub const ROLE: &str = "arn:aws:iam::123456789012:role/StackwatchReader";
pub const EXTERNAL_ID: &str = "stackwatch-external-1";
pub const REGION: &str = "us-east-1";

/// Test context sharing one store, broker and gateway between service and orchestrator.
pub struct TestContext {
    pub store: Arc<SqliteStore>,
    pub broker: Arc<MockBroker>,
    pub gateway: Arc<MockGateway>,
    pub service: DriftService,
    /// Keeps a file-backed database alive for the lifetime of the context.
    _db_dir: Option<tempfile::TempDir>,
}

impl TestContext {
    /// Create a new test context backed by an in-memory database.
    pub async fn new() -> Self {
        let store = SqliteStore::connect("sqlite::memory:")
            .await
            .expect("Failed to open in-memory store");
        Self::with_store(store, None)
    }

    /// Create a new test context backed by a database file in a temporary directory.
    pub async fn file_backed() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let url = format!("sqlite://{}", dir.path().join("stackwatch.db").display());
        let store = SqliteStore::connect(&url)
            .await
            .expect("Failed to open file store");
        Self::with_store(store, Some(dir))
    }

    fn with_store(store: SqliteStore, db_dir: Option<tempfile::TempDir>) -> Self {
        let store = Arc::new(store);
        let broker = Arc::new(MockBroker::new());
        let gateway = Arc::new(MockGateway::new());
        let service = DriftService::new(store.clone(), broker.clone(), gateway.clone())
            .with_remote_timeout(Duration::from_secs(5));

        Self {
            store,
            broker,
            gateway,
            service,
            _db_dir: db_dir,
        }
    }

    /// Orchestrator with default retention and a short remote timeout.
    pub fn orchestrator(&self) -> DriftOrchestrator {
        self.orchestrator_with(OrchestratorConfig {
            remote_timeout: Duration::from_secs(5),
            ..Default::default()
        })
    }

    /// Orchestrator with explicit configuration.
    pub fn orchestrator_with(&self, config: OrchestratorConfig) -> DriftOrchestrator {
        DriftOrchestrator::new(
            self.store.clone(),
            self.broker.clone(),
            self.gateway.clone(),
            config,
        )
    }

    /// Connect the default account for the default owner.
    pub async fn connect_account(&self) -> AccountGrant {
        self.service
            .connect_account(OWNER, ROLE, EXTERNAL_ID, REGION, Some("test account"))
            .await
            .expect("Failed to connect account")
    }

    /// Make a stack exist remotely in the default account.
    pub async fn add_remote_stack(&self, stack_name: &str) {
        self.gateway
            .add_stack(ACCOUNT, REGION, MockGateway::descriptor(stack_name))
            .await;
    }

    /// Trigger detection for a stack and return the remote operation id.
    pub async fn trigger(&self, stack_name: &str) -> String {
        self.service
            .trigger(OWNER, ACCOUNT, stack_name)
            .await
            .expect("Failed to trigger drift detection")
            .remote_operation_id
    }

    /// Connected account with one live stack and a triggered job for it.
    pub async fn triggered(&self, stack_name: &str) -> String {
        self.connect_account().await;
        self.add_remote_stack(stack_name).await;
        self.trigger(stack_name).await
    }

    /// Load a job, panicking if it is missing.
    pub async fn job(&self, remote_operation_id: &str) -> DriftJob {
        self.store
            .get_job(remote_operation_id)
            .await
            .expect("Failed to load job")
            .expect("Job not found")
    }

    /// Load a stack record of the default account, if present.
    pub async fn stack(&self, stack_name: &str) -> Option<StackRecord> {
        self.store
            .get_stack(&StackKey::new(ACCOUNT, stack_name, REGION))
            .await
            .expect("Failed to load stack")
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for stackwatch.
//!
//! [`StackwatchRuntime`] owns the background drift orchestrator and the job
//! cleanup worker, and hands out a [`DriftService`] wired to the same store,
//! broker and gateway.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stackwatch::runtime::StackwatchRuntime;
//! use stackwatch::store::PostgresStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(PostgresStore::connect("postgres://...").await?);
//!
//!     let runtime = StackwatchRuntime::builder()
//!         .store(store)
//!         .broker(broker)
//!         .gateway(gateway)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let service = runtime.service();
//!     // ... serve requests ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::broker::CredentialBroker;
use crate::config::Config;
use crate::gateway::DriftGateway;
use crate::job_cleanup_worker::{JobCleanupWorker, JobCleanupWorkerConfig};
use crate::orchestrator::{DriftOrchestrator, OrchestratorConfig};
use crate::service::DriftService;
use crate::store::JobStore;

/// Builder for creating a [`StackwatchRuntime`].
#[derive(Default)]
pub struct StackwatchRuntimeBuilder {
    store: Option<Arc<dyn JobStore>>,
    broker: Option<Arc<dyn CredentialBroker>>,
    gateway: Option<Arc<dyn DriftGateway>>,
    orchestrator_config: OrchestratorConfig,
    cleanup_config: JobCleanupWorkerConfig,
}

impl StackwatchRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the job store (required).
    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the credential broker (required).
    pub fn broker(mut self, broker: Arc<dyn CredentialBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Set the drift gateway (required).
    pub fn gateway(mut self, gateway: Arc<dyn DriftGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Take orchestrator and cleanup settings from a loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.orchestrator_config = OrchestratorConfig::from(config);
        self.cleanup_config = JobCleanupWorkerConfig::from(config);
        self
    }

    /// Set the orchestrator configuration.
    ///
    /// Default: [`OrchestratorConfig::default()`]
    pub fn orchestrator_config(mut self, config: OrchestratorConfig) -> Self {
        self.orchestrator_config = config;
        self
    }

    /// Set the job cleanup worker configuration.
    ///
    /// Default: disabled
    pub fn cleanup_config(mut self, config: JobCleanupWorkerConfig) -> Self {
        self.cleanup_config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<StackwatchRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let broker = self
            .broker
            .ok_or_else(|| anyhow::anyhow!("broker is required"))?;
        let gateway = self
            .gateway
            .ok_or_else(|| anyhow::anyhow!("gateway is required"))?;

        Ok(StackwatchRuntimeConfig {
            store,
            broker,
            gateway,
            orchestrator_config: self.orchestrator_config,
            cleanup_config: self.cleanup_config,
        })
    }
}

/// Configuration for a [`StackwatchRuntime`].
pub struct StackwatchRuntimeConfig {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn CredentialBroker>,
    gateway: Arc<dyn DriftGateway>,
    orchestrator_config: OrchestratorConfig,
    cleanup_config: JobCleanupWorkerConfig,
}

impl StackwatchRuntimeConfig {
    /// Start the runtime, spawning the orchestrator and cleanup worker tasks.
    pub async fn start(self) -> Result<StackwatchRuntime> {
        info!(
            broker_type = self.broker.broker_type(),
            gateway_type = self.gateway.gateway_type(),
            "Remote backends initialized"
        );

        let service = DriftService::new(
            self.store.clone(),
            self.broker.clone(),
            self.gateway.clone(),
        )
        .with_remote_timeout(self.orchestrator_config.remote_timeout)
        .with_retention(self.orchestrator_config.job_retention);

        let orchestrator = Arc::new(DriftOrchestrator::new(
            self.store.clone(),
            self.broker,
            self.gateway,
            self.orchestrator_config,
        ));
        let orchestrator_shutdown = orchestrator.shutdown_handle();

        let loop_orchestrator = orchestrator.clone();
        let orchestrator_handle = tokio::spawn(async move {
            loop_orchestrator.run().await;
        });

        let cleanup_worker = JobCleanupWorker::new(self.store, self.cleanup_config);
        let cleanup_shutdown = cleanup_worker.shutdown_handle();

        let cleanup_handle = tokio::spawn(async move {
            cleanup_worker.run().await;
        });

        info!("StackwatchRuntime started");

        Ok(StackwatchRuntime {
            orchestrator,
            orchestrator_handle,
            cleanup_handle,
            orchestrator_shutdown,
            cleanup_shutdown,
            service,
        })
    }
}

/// A running stackwatch instance that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct StackwatchRuntime {
    orchestrator: Arc<DriftOrchestrator>,
    orchestrator_handle: JoinHandle<()>,
    cleanup_handle: JoinHandle<()>,
    orchestrator_shutdown: Arc<Notify>,
    cleanup_shutdown: Arc<Notify>,
    service: DriftService,
}

impl StackwatchRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> StackwatchRuntimeBuilder {
        StackwatchRuntimeBuilder::new()
    }

    /// Service wired to the runtime's store, broker and gateway.
    pub fn service(&self) -> DriftService {
        self.service.clone()
    }

    /// The running orchestrator.
    pub fn orchestrator(&self) -> &Arc<DriftOrchestrator> {
        &self.orchestrator
    }

    /// Gracefully shut down the runtime.
    ///
    /// An in-flight tick finishes before the orchestrator stops.
    pub async fn shutdown(self) -> Result<()> {
        info!("StackwatchRuntime shutting down...");

        self.orchestrator_shutdown.notify_one();
        self.cleanup_shutdown.notify_one();

        let mut panicked = false;

        if let Err(e) = self.orchestrator_handle.await {
            error!("Drift orchestrator task panicked: {}", e);
            panicked = true;
        }

        if let Err(e) = self.cleanup_handle.await {
            error!("Job cleanup worker task panicked: {}", e);
            panicked = true;
        }

        if panicked {
            return Err(anyhow::anyhow!("background task panicked"));
        }

        info!("StackwatchRuntime shutdown complete");
        Ok(())
    }

    /// Check if the background tasks are still running.
    ///
    /// A disabled cleanup worker exits right away and does not count.
    pub fn is_running(&self) -> bool {
        !self.orchestrator_handle.is_finished()
    }
}

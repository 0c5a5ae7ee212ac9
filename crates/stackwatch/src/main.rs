// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stackwatch - cross-account drift detection daemon
//!
//! Runs the drift orchestrator against the configured job store:
//! - polls outstanding drift detection jobs on a fixed period
//! - writes resource drift snapshots for drifted stacks
//! - optionally deletes old terminal jobs

use std::sync::Arc;
use tracing::{info, warn};

use stackwatch::broker::StsBroker;
use stackwatch::config::Config;
use stackwatch::gateway::CloudFormationGateway;
use stackwatch::gateway::cloudformation::CloudFormationConfig;
use stackwatch::runtime::StackwatchRuntime;
use stackwatch::store::{JobStore, PostgresStore, SqliteStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stackwatch=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        poll_interval_secs = config.poll_interval.as_secs(),
        retention_hours = config.job_retention.as_secs() / 3600,
        max_concurrent_jobs = config.max_concurrent_jobs,
        sqlite = config.uses_sqlite(),
        "Starting Stackwatch"
    );

    // Connect to database (migrations run on connect)
    let store: Arc<dyn JobStore> = if config.uses_sqlite() {
        Arc::new(SqliteStore::connect(&config.database_url).await?)
    } else {
        Arc::new(PostgresStore::connect(&config.database_url).await?)
    };

    info!("Connected to database");

    let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .load()
        .await;

    let broker = Arc::new(StsBroker::new(
        &sdk_config,
        &config.session_name,
        config.remote_timeout,
        config.aws_endpoint_url.as_deref(),
    ));
    let gateway = Arc::new(CloudFormationGateway::new(
        &sdk_config,
        CloudFormationConfig {
            operation_timeout: config.remote_timeout,
            endpoint: config.aws_endpoint_url.clone(),
        },
    ));

    let runtime = StackwatchRuntime::builder()
        .store(store)
        .broker(broker)
        .gateway(gateway)
        .config(&config)
        .build()?
        .start()
        .await?;

    info!("Stackwatch ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Stackwatch shut down");

    Ok(())
}

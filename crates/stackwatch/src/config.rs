// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for stackwatch.

use std::str::FromStr;
use std::time::Duration;

/// Upper bound on retention windows, keeping cutoff arithmetic within calendar range.
const MAX_WINDOW_SECS: u64 = 100 * 365 * 24 * 3600;

/// Stackwatch configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL. `sqlite:` URLs select the SQLite store, anything else PostgreSQL.
    pub database_url: String,
    /// Period of the orchestrator tick.
    pub poll_interval: Duration,
    /// Jobs started longer ago are no longer polled and are reported as stale.
    pub job_retention: Duration,
    /// Bound on every remote call.
    pub remote_timeout: Duration,
    /// Jobs processed concurrently within one tick.
    pub max_concurrent_jobs: usize,
    /// Session name used when assuming customer roles.
    pub session_name: String,
    /// Endpoint override for the remote services (LocalStack and similar).
    pub aws_endpoint_url: Option<String>,
    /// Whether old terminal jobs are deleted.
    pub job_cleanup_enabled: bool,
    /// Age after which terminal jobs are deleted.
    pub job_cleanup_max_age: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("STACKWATCH_DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::MissingEnvVar("STACKWATCH_DATABASE_URL"))?;

        let poll_interval_secs: u64 = parse_var(&lookup, "STACKWATCH_POLL_INTERVAL_SECS", 60)?;
        let retention_hours: u64 = parse_var(&lookup, "STACKWATCH_JOB_RETENTION_HOURS", 24)?;
        let remote_timeout_secs: u64 = parse_var(&lookup, "STACKWATCH_REMOTE_TIMEOUT_SECS", 30)?;
        let max_concurrent_jobs: usize = parse_var(&lookup, "STACKWATCH_MAX_CONCURRENT_JOBS", 8)?;
        let cleanup_max_age_days: u64 =
            parse_var(&lookup, "STACKWATCH_JOB_CLEANUP_MAX_AGE_DAYS", 30)?;

        reject_zero("STACKWATCH_POLL_INTERVAL_SECS", poll_interval_secs)?;
        reject_zero("STACKWATCH_JOB_RETENTION_HOURS", retention_hours)?;
        reject_zero("STACKWATCH_REMOTE_TIMEOUT_SECS", remote_timeout_secs)?;
        reject_zero("STACKWATCH_MAX_CONCURRENT_JOBS", max_concurrent_jobs as u64)?;

        let job_retention = window("STACKWATCH_JOB_RETENTION_HOURS", retention_hours, 3600)?;
        let job_cleanup_max_age = window(
            "STACKWATCH_JOB_CLEANUP_MAX_AGE_DAYS",
            cleanup_max_age_days,
            24 * 3600,
        )?;

        let session_name =
            lookup("STACKWATCH_SESSION_NAME").unwrap_or_else(|| "stackwatch".to_string());

        let aws_endpoint_url = lookup("STACKWATCH_AWS_ENDPOINT_URL").filter(|v| !v.is_empty());

        let job_cleanup_enabled = lookup("STACKWATCH_JOB_CLEANUP_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(Self {
            database_url,
            poll_interval: Duration::from_secs(poll_interval_secs),
            job_retention,
            remote_timeout: Duration::from_secs(remote_timeout_secs),
            max_concurrent_jobs,
            session_name,
            aws_endpoint_url,
            job_cleanup_enabled,
            job_cleanup_max_age,
        })
    }

    /// Whether the database URL selects the SQLite store.
    pub fn uses_sqlite(&self) -> bool {
        self.database_url.starts_with("sqlite:")
    }
}

fn parse_var<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name)),
        None => Ok(default),
    }
}

fn reject_zero(name: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue(name));
    }
    Ok(())
}

/// Convert `value` units of `unit_secs` seconds into a bounded duration.
fn window(name: &'static str, value: u64, unit_secs: u64) -> Result<Duration, ConfigError> {
    value
        .checked_mul(unit_secs)
        .filter(|secs| *secs <= MAX_WINDOW_SECS)
        .map(Duration::from_secs)
        .ok_or(ConfigError::InvalidValue(name))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable has an unusable value.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Credential broker - exchanges a (role ARN, external id) pair for a short-lived session.
//!
//! Sessions are never cached or renewed in place. Every step that talks to a
//! remote account acquires a fresh session, because drift detection can run
//! for minutes and ticks are minutes apart.

pub mod mock;
pub mod sts;

pub use mock::MockBroker;
pub use sts::StsBroker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Lifetime requested for every assumed session.
pub const SESSION_DURATION_SECS: i32 = 3600;

/// Errors from credential acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// The role or external id was rejected. Permanent.
    #[error("Access denied assuming role: {0}")]
    AccessDenied(String),

    /// The identity service throttled the request. Retry later.
    #[error("Throttled by identity service: {0}")]
    Throttled(String),

    /// The identity service could not be reached or the call timed out. Retry later.
    #[error("Identity service unreachable: {0}")]
    Unreachable(String),

    /// The role ARN or external id is syntactically invalid. Permanent.
    #[error("Malformed credential grant: {0}")]
    Malformed(String),

    /// The session resolved to a different account than the assume call reported.
    #[error("Identity mismatch: assumed account {expected}, session reports {actual}")]
    IdentityMismatch {
        /// Account id derived from the assume-role response.
        expected: String,
        /// Account id reported by the session itself.
        actual: String,
    },
}

impl BrokerError {
    /// Whether a later retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Throttled(_) | BrokerError::Unreachable(_))
    }
}

impl From<tokio::time::error::Elapsed> for BrokerError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        BrokerError::Unreachable("credential acquisition timed out".to_string())
    }
}

/// Short-lived credentials for one assumed session.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Session token.
    pub session_token: String,
    /// Account the session belongs to.
    pub account_id: String,
    /// Session expiry.
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("account_id", &self.account_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of assumed-role sessions.
///
/// Implementations must validate the role ARN and external id before any
/// remote call, and must verify that the session identity belongs to the
/// account the assume call reported.
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    /// Broker type identifier (e.g., "sts", "mock").
    fn broker_type(&self) -> &'static str;

    /// Assume `role_arn` with `external_id` and return a verified session.
    async fn acquire(
        &self,
        role_arn: &str,
        external_id: &str,
    ) -> Result<SessionCredentials, BrokerError>;
}

/// Validate a role ARN and return the account id embedded in it.
///
/// Accepts `arn:<partition>:iam::<12 digits>:role/<path/name>`.
pub fn validate_role_arn(role_arn: &str) -> Result<String, BrokerError> {
    let malformed = || BrokerError::Malformed(format!("invalid role ARN '{}'", role_arn));

    let mut parts = role_arn.splitn(6, ':');
    let (Some("arn"), Some(partition), Some("iam"), Some(""), Some(account), Some(resource)) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return Err(malformed());
    };

    if partition.is_empty() || !is_account_id(account) {
        return Err(malformed());
    }

    let Some(role_path) = resource.strip_prefix("role/") else {
        return Err(malformed());
    };
    let name = role_path.rsplit('/').next().unwrap_or_default();
    if name.is_empty()
        || !role_path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "+=,.@_-/".contains(c))
    {
        return Err(malformed());
    }

    Ok(account.to_string())
}

/// Validate an external id (2-1224 characters from `[\w+=,.@:/-]`).
pub fn validate_external_id(external_id: &str) -> Result<(), BrokerError> {
    let len = external_id.chars().count();
    let valid_chars = external_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_+=,.@:/-".contains(c));

    if !(2..=1224).contains(&len) || !valid_chars {
        return Err(BrokerError::Malformed(
            "external id must be 2-1224 characters of [A-Za-z0-9_+=,.@:/-]".to_string(),
        ));
    }

    Ok(())
}

/// Whether `value` is a 12-digit account identifier.
pub fn is_account_id(value: &str) -> bool {
    value.len() == 12 && value.bytes().all(|b| b.is_ascii_digit())
}

/// Extract the account id from an assumed-role or IAM ARN.
pub fn account_from_arn(arn: &str) -> Option<&str> {
    let account = arn.split(':').nth(4)?;
    is_account_id(account).then_some(account)
}

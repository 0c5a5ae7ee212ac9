// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stackwatch.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::error::Elapsed;

use crate::broker::BrokerError;
use crate::gateway::GatewayError;
use crate::store::StoreError;

/// How a failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Never retried; reported to the caller or recorded against the job.
    Permanent,
    /// Retried on the next tick.
    Transient,
    /// The remote reported a state the local model does not expect; logged and skipped.
    Inconsistent,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Permanent => write!(f, "permanent"),
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Inconsistent => write!(f, "inconsistent"),
        }
    }
}

/// Stackwatch errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Job store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Credential acquisition failed.
    #[error("Credential error: {0}")]
    Broker(#[from] BrokerError),

    /// Remote call failed.
    #[error("Remote error: {0}")]
    Gateway(#[from] GatewayError),

    /// The owner holds no grant for the account.
    #[error("Account '{account_id}' is not connected for owner '{owner_id}'")]
    AccountDisconnected {
        /// Owner that asked.
        owner_id: String,
        /// Account that is not connected.
        account_id: String,
    },

    /// Stack is not known locally.
    #[error("Stack not found: {0}")]
    StackNotFound(String),

    /// Job is not known locally, or not visible to the owner.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// A concurrent writer won a uniqueness race.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Remote and local state disagree.
    #[error("Inconsistent state: {0}")]
    Inconsistent(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    /// Classify this error for retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Broker(e) if e.is_transient() => ErrorClass::Transient,
            Self::Broker(_) => ErrorClass::Permanent,
            Self::Gateway(GatewayError::InvalidCall(_)) => ErrorClass::Inconsistent,
            Self::Gateway(e) if e.is_transient() => ErrorClass::Transient,
            Self::Gateway(_) => ErrorClass::Permanent,
            Self::Store(_) | Self::Conflict(_) => ErrorClass::Transient,
            Self::Inconsistent(_) => ErrorClass::Inconsistent,
            Self::Config(_)
            | Self::AccountDisconnected { .. }
            | Self::StackNotFound(_)
            | Self::JobNotFound(_)
            | Self::InvalidRequest(_) => ErrorClass::Permanent,
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIGURATION_ERROR",
            Self::Store(StoreError::Conflict(_)) | Self::Conflict(_) => "CONFLICT",
            Self::Store(_) => "DATABASE_ERROR",
            Self::Broker(e) => match e {
                BrokerError::AccessDenied(_) => "ACCESS_DENIED",
                BrokerError::Throttled(_) => "THROTTLED",
                BrokerError::Unreachable(_) => "UNREACHABLE",
                BrokerError::Malformed(_) => "MALFORMED",
                BrokerError::IdentityMismatch { .. } => "IDENTITY_MISMATCH",
            },
            Self::Gateway(e) => match e {
                GatewayError::NotFound(_) => "STACK_NOT_FOUND",
                GatewayError::AccessDenied(_) => "ACCESS_DENIED",
                GatewayError::Throttled(_) => "THROTTLED",
                GatewayError::Unreachable(_) => "UNREACHABLE",
                GatewayError::Remote(_) => "REMOTE_ERROR",
                GatewayError::InvalidCall(_) => "INVALID_CALL",
            },
            Self::AccountDisconnected { .. } => "ACCOUNT_DISCONNECTED",
            Self::StackNotFound(_) => "STACK_NOT_FOUND",
            Self::JobNotFound(_) => "JOB_NOT_FOUND",
            Self::Inconsistent(_) => "INCONSISTENT_STATE",
            Self::InvalidRequest(_) => "VALIDATION_ERROR",
        }
    }

    /// Failure reason recorded on a job that fails because of this error.
    pub fn failure_reason(&self) -> String {
        format!("{}: {}", self.error_code(), self)
    }
}

/// Result type using stackwatch Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Bound a remote call; an elapsed call becomes the component's unreachable error.
pub(crate) async fn deadline<T, E, F>(limit: Duration, fut: F) -> std::result::Result<T, E>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: From<Elapsed>,
{
    tokio::time::timeout(limit, fut).await?
}

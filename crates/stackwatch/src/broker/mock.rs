// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock broker for testing.
//!
//! Issues fake sessions for known role ARNs without contacting any identity
//! service. Failures can be scripted per role.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{
    BrokerError, CredentialBroker, SESSION_DURATION_SECS, SessionCredentials, validate_external_id,
    validate_role_arn,
};

/// Mock credential broker.
pub struct MockBroker {
    failures: Arc<Mutex<HashMap<String, BrokerError>>>,
    identity_overrides: Arc<Mutex<HashMap<String, String>>>,
    acquisitions: AtomicUsize,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    /// Create a mock broker that grants every well-formed role.
    pub fn new() -> Self {
        Self {
            failures: Arc::new(Mutex::new(HashMap::new())),
            identity_overrides: Arc::new(Mutex::new(HashMap::new())),
            acquisitions: AtomicUsize::new(0),
        }
    }

    /// Make every acquisition for `role_arn` fail with `error`.
    pub async fn fail_role(&self, role_arn: &str, error: BrokerError) {
        self.failures
            .lock()
            .await
            .insert(role_arn.to_string(), error);
    }

    /// Remove a scripted failure.
    pub async fn heal_role(&self, role_arn: &str) {
        self.failures.lock().await.remove(role_arn);
    }

    /// Make the session for `role_arn` report `account_id` as its identity.
    pub async fn report_identity(&self, role_arn: &str, account_id: &str) {
        self.identity_overrides
            .lock()
            .await
            .insert(role_arn.to_string(), account_id.to_string());
    }

    /// Number of acquisitions attempted so far.
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialBroker for MockBroker {
    fn broker_type(&self) -> &'static str {
        "mock"
    }

    async fn acquire(
        &self,
        role_arn: &str,
        external_id: &str,
    ) -> Result<SessionCredentials, BrokerError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);

        let account_id = validate_role_arn(role_arn)?;
        validate_external_id(external_id)?;

        if let Some(error) = self.failures.lock().await.get(role_arn) {
            return Err(error.clone());
        }

        if let Some(actual) = self.identity_overrides.lock().await.get(role_arn)
            && *actual != account_id
        {
            return Err(BrokerError::IdentityMismatch {
                expected: account_id,
                actual: actual.clone(),
            });
        }

        let n = self.acquisitions();
        Ok(SessionCredentials {
            access_key_id: format!("ASIAMOCK{:08}", n),
            secret_access_key: "mock-secret".to_string(),
            session_token: format!("mock-session-{}", n),
            account_id,
            expires_at: Utc::now() + chrono::Duration::seconds(i64::from(SESSION_DURATION_SECS)),
        })
    }
}

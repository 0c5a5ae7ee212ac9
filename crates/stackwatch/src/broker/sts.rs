// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! STS-backed credential broker.
//!
//! Assumes the granted role with its external id, then calls
//! `GetCallerIdentity` with the new session and compares the reported account
//! against the one in the assumed-role ARN.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sts::Client;
use aws_sdk_sts::error::{ProvideErrorMetadata, SdkError};
use aws_smithy_types::timeout::TimeoutConfig;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{
    BrokerError, CredentialBroker, SESSION_DURATION_SECS, SessionCredentials, account_from_arn,
    validate_external_id, validate_role_arn,
};

/// Broker that assumes roles through AWS STS.
#[derive(Clone)]
pub struct StsBroker {
    sdk_config: aws_config::SdkConfig,
    client: Client,
    session_name: String,
    timeout: Duration,
    endpoint: Option<String>,
}

impl std::fmt::Debug for StsBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StsBroker")
            .field("session_name", &self.session_name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl StsBroker {
    /// Create a broker from the process's base SDK configuration.
    ///
    /// The base credentials are the ones allowed to assume customer roles.
    pub fn new(
        sdk_config: &aws_config::SdkConfig,
        session_name: impl Into<String>,
        timeout: Duration,
        endpoint: Option<&str>,
    ) -> Self {
        let mut builder = aws_sdk_sts::config::Builder::from(sdk_config)
            .timeout_config(Self::timeout_config(timeout));
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Self {
            sdk_config: sdk_config.clone(),
            client: Client::from_conf(builder.build()),
            session_name: session_name.into(),
            timeout,
            endpoint: endpoint.map(str::to_string),
        }
    }

    fn timeout_config(timeout: Duration) -> TimeoutConfig {
        TimeoutConfig::builder().operation_timeout(timeout).build()
    }

    /// STS client signed with an assumed session, used for the identity check.
    fn session_client(&self, creds: &SessionCredentials) -> Client {
        let provider = aws_credential_types::Credentials::new(
            creds.access_key_id.clone(),
            creds.secret_access_key.clone(),
            Some(creds.session_token.clone()),
            Some(creds.expires_at.into()),
            "stackwatch-assumed-role",
        );

        let mut builder = aws_sdk_sts::config::Builder::from(&self.sdk_config)
            .credentials_provider(provider)
            .timeout_config(Self::timeout_config(self.timeout));
        if let Some(endpoint) = &self.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Client::from_conf(builder.build())
    }

    /// Map an STS SDK error into the broker taxonomy.
    fn classify<E>(err: SdkError<E>) -> BrokerError
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
    {
        match &err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
                BrokerError::Unreachable(err.to_string())
            }
            SdkError::ResponseError(_) => BrokerError::Unreachable(err.to_string()),
            SdkError::ServiceError(service_err) => {
                let message = service_err
                    .err()
                    .message()
                    .unwrap_or("no message")
                    .to_string();
                match service_err.err().code() {
                    Some("AccessDenied" | "InvalidClientTokenId" | "ExpiredToken") => {
                        BrokerError::AccessDenied(message)
                    }
                    Some("Throttling" | "ThrottlingException" | "RequestLimitExceeded") => {
                        BrokerError::Throttled(message)
                    }
                    Some(
                        "ValidationError" | "MalformedPolicyDocument" | "PackedPolicyTooLarge",
                    ) => BrokerError::Malformed(message),
                    Some("RegionDisabledException") => BrokerError::AccessDenied(message),
                    _ => BrokerError::Unreachable(message),
                }
            }
            _ => BrokerError::Unreachable(err.to_string()),
        }
    }
}

fn to_chrono(ts: &aws_smithy_types::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
}

#[async_trait]
impl CredentialBroker for StsBroker {
    fn broker_type(&self) -> &'static str {
        "sts"
    }

    async fn acquire(
        &self,
        role_arn: &str,
        external_id: &str,
    ) -> Result<SessionCredentials, BrokerError> {
        validate_role_arn(role_arn)?;
        validate_external_id(external_id)?;

        let output = self
            .client
            .assume_role()
            .role_arn(role_arn)
            .role_session_name(&self.session_name)
            .external_id(external_id)
            .duration_seconds(SESSION_DURATION_SECS)
            .send()
            .await
            .map_err(Self::classify)?;

        let assumed_account = output
            .assumed_role_user()
            .and_then(|user| account_from_arn(user.arn()))
            .map(str::to_string)
            .ok_or_else(|| {
                BrokerError::Unreachable("assume-role response has no assumed role ARN".into())
            })?;

        let issued = output.credentials().ok_or_else(|| {
            BrokerError::Unreachable("assume-role response has no credentials".into())
        })?;

        let expires_at = to_chrono(issued.expiration()).unwrap_or_else(|| {
            Utc::now() + chrono::Duration::seconds(i64::from(SESSION_DURATION_SECS))
        });

        let creds = SessionCredentials {
            access_key_id: issued.access_key_id().to_string(),
            secret_access_key: issued.secret_access_key().to_string(),
            session_token: issued.session_token().to_string(),
            account_id: assumed_account.clone(),
            expires_at,
        };

        let identity = self
            .session_client(&creds)
            .get_caller_identity()
            .send()
            .await
            .map_err(Self::classify)?;

        let actual = identity.account().unwrap_or_default();
        if actual != assumed_account {
            warn!(
                role_arn = %role_arn,
                expected = %assumed_account,
                actual = %actual,
                "Assumed session reports a different account"
            );
            return Err(BrokerError::IdentityMismatch {
                expected: assumed_account,
                actual: actual.to_string(),
            });
        }

        debug!(
            account_id = %creds.account_id,
            expires_at = %creds.expires_at,
            "Assumed role session"
        );

        Ok(creds)
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed job store.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{
    EncodedDrift, GrantRow, JobRow, JobStore, ResourceDriftRow, SUPERSEDED_REASON, StackRow,
    StoreError, cutoff_or_epoch, dedup_drifts, encode_map, now,
};
use crate::gateway::ResourceDriftDescriptor;
use crate::types::{
    AccountGrant, DriftJob, JobCreation, JobOutcome, JobStatus, NewDriftJob, ResourceDrift,
    SnapshotApply, StackDriftStatus, StackKey, StackRecord, StackUpsert,
};

/// SQLite-backed job store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url`, creating the database if needed, and run migrations.
    ///
    /// The pool holds a single connection. In-memory databases need it so every
    /// caller sees the same database; file databases need it because concurrent
    /// read-then-write transactions fail lock upgrades with `SQLITE_BUSY`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let mut pool_options = SqlitePoolOptions::new().max_connections(1);
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        } else {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .busy_timeout(Duration::from_secs(5));
        }

        let pool = pool_options.connect_with(options).await?;
        crate::migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Delete every snapshot row of a stack and insert `drifts` in their place.
async fn write_snapshot(
    conn: &mut SqliteConnection,
    stack_id: &str,
    drifts: &[ResourceDriftDescriptor],
) -> Result<u64, StoreError> {
    sqlx::query("DELETE FROM resource_drifts WHERE stack_id = ?")
        .bind(stack_id)
        .execute(&mut *conn)
        .await?;

    let mut written = 0u64;
    for drift in dedup_drifts(drifts) {
        let encoded = EncodedDrift::encode(drift)?;
        let result = sqlx::query(
            r#"
            INSERT INTO resource_drifts (
                stack_id, logical_resource_id, resource_type, physical_resource_id,
                drift_status, actual_properties, expected_properties, property_differences
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(stack_id)
        .bind(&drift.logical_resource_id)
        .bind(&drift.resource_type)
        .bind(&drift.physical_resource_id)
        .bind(drift.drift_status.as_str())
        .bind(&encoded.actual_properties)
        .bind(&encoded.expected_properties)
        .bind(&encoded.property_differences)
        .execute(&mut *conn)
        .await?;
        written += result.rows_affected();
    }

    Ok(written)
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn upsert_grant(&self, grant: &AccountGrant) -> Result<AccountGrant, StoreError> {
        let row = sqlx::query_as::<_, GrantRow>(
            r#"
            INSERT INTO account_grants (
                owner_id, account_id, role_arn, external_id, region, name, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (owner_id, account_id) DO UPDATE SET
                role_arn = excluded.role_arn,
                external_id = excluded.external_id,
                region = excluded.region,
                name = excluded.name,
                updated_at = excluded.updated_at
            RETURNING owner_id, account_id, role_arn, external_id, region, name, created_at
            "#,
        )
        .bind(&grant.owner_id)
        .bind(&grant.account_id)
        .bind(&grant.role_arn)
        .bind(&grant.external_id)
        .bind(&grant.region)
        .bind(&grant.name)
        .bind(grant.created_at)
        .bind(now())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn get_grant(
        &self,
        owner_id: &str,
        account_id: &str,
    ) -> Result<Option<AccountGrant>, StoreError> {
        let row = sqlx::query_as::<_, GrantRow>(
            r#"
            SELECT owner_id, account_id, role_arn, external_id, region, name, created_at
            FROM account_grants
            WHERE owner_id = ? AND account_id = ?
            "#,
        )
        .bind(owner_id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn list_grants(&self, owner_id: &str) -> Result<Vec<AccountGrant>, StoreError> {
        let rows = sqlx::query_as::<_, GrantRow>(
            r#"
            SELECT owner_id, account_id, role_arn, external_id, region, name, created_at
            FROM account_grants
            WHERE owner_id = ?
            ORDER BY account_id
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_grant(&self, owner_id: &str, account_id: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM account_grants WHERE owner_id = ? AND account_id = ?")
            .bind(owner_id)
            .bind(account_id)
            .execute(&mut *tx)
            .await?;

        if deleted.rows_affected() == 0 {
            return Ok(false);
        }

        let (remaining,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM account_grants WHERE account_id = ?")
                .bind(account_id)
                .fetch_one(&mut *tx)
                .await?;

        if remaining == 0 {
            sqlx::query(
                r#"
                DELETE FROM resource_drifts
                WHERE stack_id IN (SELECT stack_id FROM stacks WHERE account_id = ?)
                "#,
            )
            .bind(account_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM stacks WHERE account_id = ?")
                .bind(account_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn upsert_stack(&self, stack: &StackUpsert) -> Result<StackRecord, StoreError> {
        let row = sqlx::query_as::<_, StackRow>(
            r#"
            INSERT INTO stacks (
                stack_id, account_id, stack_name, region, stack_arn, last_known_status,
                drift_status, detection_time, tags, outputs, parameters, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (account_id, stack_name, region) DO UPDATE SET
                stack_arn = excluded.stack_arn,
                last_known_status = excluded.last_known_status,
                drift_status = CASE
                    WHEN stacks.drift_status = 'DETECTION_IN_PROGRESS' THEN stacks.drift_status
                    WHEN stacks.detection_time IS NULL
                        OR excluded.detection_time > stacks.detection_time
                        THEN excluded.drift_status
                    ELSE stacks.drift_status
                END,
                detection_time = CASE
                    WHEN stacks.drift_status = 'DETECTION_IN_PROGRESS' THEN stacks.detection_time
                    WHEN stacks.detection_time IS NULL
                        OR excluded.detection_time > stacks.detection_time
                        THEN excluded.detection_time
                    ELSE stacks.detection_time
                END,
                tags = excluded.tags,
                outputs = excluded.outputs,
                parameters = excluded.parameters,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&stack.key.account_id)
        .bind(&stack.key.stack_name)
        .bind(&stack.key.region)
        .bind(&stack.stack_arn)
        .bind(&stack.last_known_status)
        .bind(stack.drift_status.as_str())
        .bind(stack.detection_time)
        .bind(encode_map(&stack.tags)?)
        .bind(encode_map(&stack.outputs)?)
        .bind(encode_map(&stack.parameters)?)
        .bind(now())
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_stack(&self, key: &StackKey) -> Result<Option<StackRecord>, StoreError> {
        let row = sqlx::query_as::<_, StackRow>(
            "SELECT * FROM stacks WHERE account_id = ? AND stack_name = ? AND region = ?",
        )
        .bind(&key.account_id)
        .bind(&key.stack_name)
        .bind(&key.region)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list_stacks_for_owner(&self, owner_id: &str) -> Result<Vec<StackRecord>, StoreError> {
        let rows = sqlx::query_as::<_, StackRow>(
            r#"
            SELECT s.* FROM stacks s
            WHERE s.account_id IN (SELECT account_id FROM account_grants WHERE owner_id = ?)
            ORDER BY s.account_id, s.region, s.stack_name
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn prune_stacks(
        &self,
        account_id: &str,
        region: &str,
        keep: &[String],
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let existing: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT stack_id, stack_name, drift_status FROM stacks WHERE account_id = ? AND region = ?",
        )
        .bind(account_id)
        .bind(region)
        .fetch_all(&mut *tx)
        .await?;

        let mut pruned = 0u64;
        for (stack_id, stack_name, drift_status) in existing {
            if keep.contains(&stack_name)
                || drift_status == StackDriftStatus::DetectionInProgress.as_str()
            {
                continue;
            }

            sqlx::query("DELETE FROM resource_drifts WHERE stack_id = ?")
                .bind(&stack_id)
                .execute(&mut *tx)
                .await?;
            pruned += sqlx::query("DELETE FROM stacks WHERE stack_id = ?")
                .bind(&stack_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        Ok(pruned)
    }

    async fn create_job(&self, job: &NewDriftJob) -> Result<JobCreation, StoreError> {
        let key = &job.key;
        let mut tx = self.pool.begin().await?;

        let superseded: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT remote_operation_id FROM drift_jobs
            WHERE account_id = ? AND stack_name = ? AND region = ? AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(&key.account_id)
        .bind(&key.stack_name)
        .bind(&key.region)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE drift_jobs SET status = 'FAILED', failure_reason = ?, completed_at = ?
            WHERE account_id = ? AND stack_name = ? AND region = ? AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(SUPERSEDED_REASON)
        .bind(job.started_at)
        .bind(&key.account_id)
        .bind(&key.stack_name)
        .bind(&key.region)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO drift_jobs (
                remote_operation_id, owner_id, account_id, stack_name, region, status, started_at
            )
            VALUES (?, ?, ?, ?, ?, 'IN_PROGRESS', ?)
            RETURNING *
            "#,
        )
        .bind(&job.remote_operation_id)
        .bind(&job.owner_id)
        .bind(&key.account_id)
        .bind(&key.stack_name)
        .bind(&key.region)
        .bind(job.started_at)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO stacks (stack_id, account_id, stack_name, region, drift_status, updated_at)
            VALUES (?, ?, ?, ?, 'DETECTION_IN_PROGRESS', ?)
            ON CONFLICT (account_id, stack_name, region) DO UPDATE SET
                drift_status = 'DETECTION_IN_PROGRESS',
                updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&key.account_id)
        .bind(&key.stack_name)
        .bind(&key.region)
        .bind(job.started_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(JobCreation {
            job: row.try_into()?,
            superseded: superseded.into_iter().map(|(id,)| id).collect(),
        })
    }

    async fn get_job(&self, remote_operation_id: &str) -> Result<Option<DriftJob>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM drift_jobs WHERE remote_operation_id = ?",
        )
        .bind(remote_operation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list_jobs_for_stack(
        &self,
        key: &StackKey,
        limit: i64,
    ) -> Result<Vec<DriftJob>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM drift_jobs
            WHERE account_id = ? AND stack_name = ? AND region = ?
            ORDER BY started_at DESC
            LIMIT ?
            "#,
        )
        .bind(&key.account_id)
        .bind(&key.stack_name)
        .bind(&key.region)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn latest_jobs_for_owner(&self, owner_id: &str) -> Result<Vec<DriftJob>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT j.* FROM drift_jobs j
            WHERE j.account_id IN (SELECT account_id FROM account_grants WHERE owner_id = ?)
              AND NOT EXISTS (
                  SELECT 1 FROM drift_jobs n
                  WHERE n.account_id = j.account_id
                    AND n.stack_name = j.stack_name
                    AND n.region = j.region
                    AND n.started_at > j.started_at
              )
            ORDER BY j.account_id, j.region, j.stack_name
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn find_outstanding_jobs(
        &self,
        started_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<DriftJob>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT j.* FROM drift_jobs j
            WHERE j.started_at > ?
              AND (
                  j.status = 'IN_PROGRESS'
                  OR (
                      j.status = 'COMPLETE'
                      AND j.drift_status = 'DRIFTED'
                      AND j.reconciled_at IS NULL
                      AND NOT EXISTS (
                          SELECT 1 FROM drift_jobs n
                          WHERE n.account_id = j.account_id
                            AND n.stack_name = j.stack_name
                            AND n.region = j.region
                            AND n.started_at > j.started_at
                      )
                  )
              )
            ORDER BY j.started_at
            "#,
        )
        .bind(cutoff_or_epoch(started_after))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn update_job_status(
        &self,
        remote_operation_id: &str,
        status: JobStatus,
        failure_reason: Option<&str>,
    ) -> Result<bool, StoreError> {
        let completed_at = status.is_terminal().then(now);

        let result = sqlx::query(
            r#"
            UPDATE drift_jobs SET status = ?, failure_reason = ?, completed_at = ?
            WHERE remote_operation_id = ? AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(status.as_str())
        .bind(failure_reason)
        .bind(completed_at)
        .bind(remote_operation_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finish_job(
        &self,
        remote_operation_id: &str,
        outcome: &JobOutcome,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let Some(row) = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM drift_jobs WHERE remote_operation_id = ? AND status = 'IN_PROGRESS'",
        )
        .bind(remote_operation_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(false);
        };

        let finished_at = now();

        match outcome {
            JobOutcome::Failed { reason } => {
                sqlx::query(
                    r#"
                    UPDATE drift_jobs SET status = 'FAILED', failure_reason = ?, completed_at = ?
                    WHERE remote_operation_id = ?
                    "#,
                )
                .bind(reason)
                .bind(finished_at)
                .bind(remote_operation_id)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    r#"
                    UPDATE stacks SET drift_status = 'UNKNOWN', updated_at = ?
                    WHERE account_id = ? AND stack_name = ? AND region = ?
                    "#,
                )
                .bind(finished_at)
                .bind(&row.account_id)
                .bind(&row.stack_name)
                .bind(&row.region)
                .execute(&mut *tx)
                .await?;
            }
            JobOutcome::InSync => {
                sqlx::query(
                    r#"
                    UPDATE drift_jobs
                    SET status = 'COMPLETE', drift_status = 'IN_SYNC',
                        completed_at = ?, reconciled_at = ?
                    WHERE remote_operation_id = ?
                    "#,
                )
                .bind(finished_at)
                .bind(finished_at)
                .bind(remote_operation_id)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    r#"
                    DELETE FROM resource_drifts
                    WHERE stack_id IN (
                        SELECT stack_id FROM stacks
                        WHERE account_id = ? AND stack_name = ? AND region = ?
                    )
                    "#,
                )
                .bind(&row.account_id)
                .bind(&row.stack_name)
                .bind(&row.region)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    r#"
                    UPDATE stacks SET drift_status = 'IN_SYNC', detection_time = ?, updated_at = ?
                    WHERE account_id = ? AND stack_name = ? AND region = ?
                    "#,
                )
                .bind(finished_at)
                .bind(finished_at)
                .bind(&row.account_id)
                .bind(&row.stack_name)
                .bind(&row.region)
                .execute(&mut *tx)
                .await?;
            }
            JobOutcome::Drifted => {
                sqlx::query(
                    r#"
                    UPDATE drift_jobs
                    SET status = 'COMPLETE', drift_status = 'DRIFTED', completed_at = ?
                    WHERE remote_operation_id = ?
                    "#,
                )
                .bind(finished_at)
                .bind(remote_operation_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn replace_resource_drift_snapshot(
        &self,
        stack_id: &str,
        drifts: &[ResourceDriftDescriptor],
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let written = write_snapshot(&mut tx, stack_id, drifts).await?;
        tx.commit().await?;
        Ok(written)
    }

    async fn apply_drift_snapshot(
        &self,
        job: &DriftJob,
        drifts: &[ResourceDriftDescriptor],
    ) -> Result<SnapshotApply, StoreError> {
        let mut tx = self.pool.begin().await?;

        let (newer,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM drift_jobs
            WHERE account_id = ? AND stack_name = ? AND region = ? AND started_at > ?
            "#,
        )
        .bind(&job.account_id)
        .bind(&job.stack_name)
        .bind(&job.region)
        .bind(job.started_at)
        .fetch_one(&mut *tx)
        .await?;

        if newer > 0 {
            return Ok(SnapshotApply::Superseded);
        }

        let reconciled_at = now();

        let stack_id: Option<(String,)> = sqlx::query_as(
            "SELECT stack_id FROM stacks WHERE account_id = ? AND stack_name = ? AND region = ?",
        )
        .bind(&job.account_id)
        .bind(&job.stack_name)
        .bind(&job.region)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match stack_id {
            Some((stack_id,)) => {
                let written = write_snapshot(&mut tx, &stack_id, drifts).await?;

                sqlx::query(
                    r#"
                    UPDATE stacks SET drift_status = 'DRIFTED', detection_time = ?, updated_at = ?
                    WHERE stack_id = ?
                    "#,
                )
                .bind(job.completed_at.unwrap_or(reconciled_at))
                .bind(reconciled_at)
                .bind(&stack_id)
                .execute(&mut *tx)
                .await?;

                SnapshotApply::Applied(written)
            }
            None => SnapshotApply::StackMissing,
        };

        sqlx::query("UPDATE drift_jobs SET reconciled_at = ? WHERE remote_operation_id = ?")
            .bind(reconciled_at)
            .bind(&job.remote_operation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(outcome)
    }

    async fn list_resource_drifts(&self, stack_id: &str) -> Result<Vec<ResourceDrift>, StoreError> {
        let rows = sqlx::query_as::<_, ResourceDriftRow>(
            "SELECT * FROM resource_drifts WHERE stack_id = ? ORDER BY logical_resource_id",
        )
        .bind(stack_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn delete_terminal_jobs_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM drift_jobs
            WHERE remote_operation_id IN (
                SELECT remote_operation_id FROM drift_jobs
                WHERE status <> 'IN_PROGRESS' AND completed_at < ?
                ORDER BY completed_at
                LIMIT ?
            )
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

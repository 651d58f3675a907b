//! Postgres-backed batch store.
//!
//! The lease is a single conditional `UPDATE` evaluated against the database
//! clock, so workers on different machines agree on expiry. Lifecycle writes
//! lock the row (`FOR UPDATE`), run the same domain transition as the
//! in-memory store, and append the progress log in the same transaction.
//! Per-activity marks never rewrite the batch row: the ref update and the
//! `count = count + 1` increment commit together.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, PgPool, Row};
use tracing::{debug, instrument};

use batchflow_batch::{
    ActivityRef, ActivityStatus, BatchFilter, BatchJob, BatchProgress, BatchStatus, ProgressLogEntry,
};
use batchflow_core::{ActivityId, BatchId, DomainError, OrgId, WorkerId};

use super::{BatchStore, BatchStoreError, BatchStoreResult};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS batch_jobs (
        id UUID PRIMARY KEY,
        org_id UUID NOT NULL,
        workspace_id UUID NOT NULL,
        status TEXT NOT NULL,
        activity_count INTEGER NOT NULL CHECK (activity_count >= 0),
        success_count INTEGER NOT NULL DEFAULT 0,
        error_count INTEGER NOT NULL DEFAULT 0,
        total_emissions DOUBLE PRECISION NOT NULL DEFAULT 0,
        concurrency INTEGER NOT NULL DEFAULT 1,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        priority INTEGER NOT NULL DEFAULT 5,
        locked_by TEXT,
        locked_until TIMESTAMPTZ,
        error_message TEXT,
        CHECK (success_count + error_count <= activity_count)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_batch_jobs_claim ON batch_jobs (status, priority DESC, created_at ASC)",
    "CREATE INDEX IF NOT EXISTS idx_batch_jobs_org ON batch_jobs (org_id, created_at DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS batch_activity_refs (
        batch_id UUID NOT NULL REFERENCES batch_jobs(id) ON DELETE CASCADE,
        activity_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        error_message TEXT,
        emissions DOUBLE PRECISION,
        created_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (batch_id, activity_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS batch_progress_log (
        id BIGSERIAL PRIMARY KEY,
        batch_id UUID NOT NULL REFERENCES batch_jobs(id) ON DELETE CASCADE,
        event_type TEXT NOT NULL,
        processed_count INTEGER NOT NULL,
        error_count INTEGER NOT NULL,
        total_emissions DOUBLE PRECISION NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_batch_progress_log_batch ON batch_progress_log (batch_id, timestamp)",
];

const JOB_COLUMNS: &str = "id, org_id, workspace_id, status, activity_count, success_count, \
     error_count, total_emissions, concurrency, created_at, updated_at, started_at, completed_at, \
     retry_count, max_retries, priority, locked_by, locked_until, error_message";

/// A lease that is absent or already in the past.
const LEASE_FREE: &str = "(locked_by IS NULL OR locked_until IS NULL OR locked_until < NOW())";

/// Postgres batch store.
#[derive(Debug, Clone)]
pub struct PostgresBatchStore {
    pool: Arc<PgPool>,
}

impl PostgresBatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn ensure_schema(&self) -> BatchStoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn exists(&self, id: BatchId) -> BatchStoreResult<bool> {
        let row = sqlx::query("SELECT 1 FROM batch_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("exists", e))?;
        Ok(row.is_some())
    }

    async fn require(&self, id: BatchId) -> BatchStoreResult<()> {
        if self.exists(id).await? {
            Ok(())
        } else {
            Err(BatchStoreError::NotFound(id))
        }
    }

    async fn select_jobs(&self, operation: &str, where_clause: &str, limit: usize) -> BatchStoreResult<Vec<BatchJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM batch_jobs WHERE {where_clause} \
             ORDER BY priority DESC, created_at ASC, id ASC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(decode_job).collect()
    }

    async fn mark(
        &self,
        batch_id: BatchId,
        activity_id: &ActivityId,
        outcome: Result<f64, &str>,
    ) -> BatchStoreResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("mark_activity.begin", e))?;

        let (status, emissions, error) = match outcome {
            Ok(emissions) => (ActivityStatus::Complete, Some(emissions), None),
            Err(error) => (ActivityStatus::Failed, None, Some(error)),
        };
        let updated = sqlx::query(
            r#"
            UPDATE batch_activity_refs
            SET status = $3, emissions = $4, error_message = $5
            WHERE batch_id = $1 AND activity_id = $2 AND status = 'pending'
            "#,
        )
        .bind(batch_id.as_uuid())
        .bind(activity_id.as_str())
        .bind(status.as_str())
        .bind(emissions)
        .bind(error)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_activity.ref", e))?;

        if updated.rows_affected() == 0 {
            drop(tx);
            return self.explain_unmarked(batch_id, activity_id).await;
        }

        let counter = match emissions {
            Some(emissions) => sqlx::query(
                "UPDATE batch_jobs SET success_count = success_count + 1, \
                 total_emissions = total_emissions + $2, updated_at = NOW() \
                 WHERE id = $1 AND success_count + error_count < activity_count",
            )
            .bind(batch_id.as_uuid())
            .bind(emissions),
            None => sqlx::query(
                "UPDATE batch_jobs SET error_count = error_count + 1, updated_at = NOW() \
                 WHERE id = $1 AND success_count + error_count < activity_count",
            )
            .bind(batch_id.as_uuid()),
        };
        let bumped = counter
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("mark_activity.counter", e))?;
        if bumped.rows_affected() == 0 {
            return Err(DomainError::invariant(format!(
                "batch {batch_id} already accounted for all activities"
            ))
            .into());
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("mark_activity.commit", e))?;
        Ok(true)
    }

    /// Distinguish "already marked" from a missing batch or ref.
    async fn explain_unmarked(&self, batch_id: BatchId, activity_id: &ActivityId) -> BatchStoreResult<bool> {
        self.require(batch_id).await?;
        let found = sqlx::query("SELECT 1 FROM batch_activity_refs WHERE batch_id = $1 AND activity_id = $2")
            .bind(batch_id.as_uuid())
            .bind(activity_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_activity.lookup", e))?;
        match found {
            Some(_) => {
                debug!(batch_id = %batch_id, activity_id = %activity_id, "activity already marked");
                Ok(false)
            }
            None => Err(BatchStoreError::ActivityNotFound {
                batch_id,
                activity_id: activity_id.clone(),
            }),
        }
    }
}

/// Lock the batch row for the rest of the transaction; returns it with the
/// database clock.
async fn fetch_for_update(conn: &mut PgConnection, id: BatchId) -> BatchStoreResult<(BatchJob, DateTime<Utc>)> {
    let sql = format!("SELECT {JOB_COLUMNS}, NOW() AS db_now FROM batch_jobs WHERE id = $1 FOR UPDATE");
    let row = sqlx::query(&sql)
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("fetch_for_update", e))?
        .ok_or(BatchStoreError::NotFound(id))?;
    let now: DateTime<Utc> = row
        .try_get("db_now")
        .map_err(|e| map_sqlx_error("fetch_for_update", e))?;
    Ok((decode_job(&row)?, now))
}

/// Write back every field a lifecycle transition may touch. Caller holds the row lock.
async fn save_lifecycle(conn: &mut PgConnection, job: &BatchJob) -> BatchStoreResult<()> {
    sqlx::query(
        r#"
        UPDATE batch_jobs
        SET status = $2,
            success_count = $3,
            error_count = $4,
            total_emissions = $5,
            updated_at = $6,
            started_at = $7,
            completed_at = $8,
            retry_count = $9,
            error_message = $10,
            locked_by = $11,
            locked_until = $12
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.status.as_str())
    .bind(to_i32(job.success_count, "success_count")?)
    .bind(to_i32(job.error_count, "error_count")?)
    .bind(job.total_emissions)
    .bind(job.updated_at)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(to_i32(job.retry_count, "retry_count")?)
    .bind(job.error_message.as_deref())
    .bind(job.locked_by.as_ref().map(WorkerId::as_str))
    .bind(job.locked_until)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("save_lifecycle", e))?;
    Ok(())
}

/// Snapshot the row's counters into the progress log.
async fn append_log(conn: &mut PgConnection, id: BatchId, event_type: &str) -> BatchStoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO batch_progress_log
            (batch_id, event_type, processed_count, error_count, total_emissions, timestamp)
        SELECT id, $2, success_count, error_count, total_emissions, updated_at
        FROM batch_jobs
        WHERE id = $1
        "#,
    )
    .bind(id.as_uuid())
    .bind(event_type)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("append_log", e))?;
    Ok(())
}

async fn insert_job(conn: &mut PgConnection, job: &BatchJob) -> BatchStoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO batch_jobs (
            id, org_id, workspace_id, status, activity_count, success_count, error_count,
            total_emissions, concurrency, created_at, updated_at, retry_count, max_retries, priority
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW(), $10, $11, $12)
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.org_id.as_uuid())
    .bind(job.workspace_id.as_uuid())
    .bind(job.status.as_str())
    .bind(to_i32(job.activity_count, "activity_count")?)
    .bind(to_i32(job.success_count, "success_count")?)
    .bind(to_i32(job.error_count, "error_count")?)
    .bind(job.total_emissions)
    .bind(to_i32(job.concurrency, "concurrency")?)
    .bind(to_i32(job.retry_count, "retry_count")?)
    .bind(to_i32(job.max_retries, "max_retries")?)
    .bind(job.priority)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_job", e))?;
    append_log(conn, job.id, job.status.as_str()).await
}

async fn insert_ref(conn: &mut PgConnection, batch_id: BatchId, activity_id: &ActivityId, seq: i32) -> BatchStoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO batch_activity_refs (batch_id, activity_id, seq, status, created_at)
        VALUES ($1, $2, $3, 'pending', NOW())
        "#,
    )
    .bind(batch_id.as_uuid())
    .bind(activity_id.as_str())
    .bind(seq)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_ref", e))?;
    Ok(())
}

#[async_trait]
impl BatchStore for PostgresBatchStore {
    #[instrument(skip_all, fields(batch_id = %job.id), err)]
    async fn create_batch(&self, job: BatchJob) -> BatchStoreResult<BatchId> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("create_batch.begin", e))?;
        insert_job(&mut tx, &job).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("create_batch.commit", e))?;
        Ok(job.id)
    }

    #[instrument(skip_all, fields(batch_id = %job.id, activities = activities.len()), err)]
    async fn create_batch_with_activities(
        &self,
        job: BatchJob,
        activities: &[ActivityId],
    ) -> BatchStoreResult<BatchId> {
        if activities.len() as u64 > u64::from(job.activity_count) {
            return Err(DomainError::conflict(format!(
                "{} activities exceed activity_count {}",
                activities.len(),
                job.activity_count
            ))
            .into());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("create_batch_with_activities.begin", e))?;
        insert_job(&mut tx, &job).await?;
        for (seq, activity_id) in activities.iter().enumerate() {
            let seq = i32::try_from(seq).map_err(|_| DomainError::validation("too many activities"))?;
            insert_ref(&mut tx, job.id, activity_id, seq).await?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("create_batch_with_activities.commit", e))?;
        Ok(job.id)
    }

    async fn get_batch(&self, id: BatchId) -> BatchStoreResult<BatchJob> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM batch_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_batch", e))?
            .ok_or(BatchStoreError::NotFound(id))?;
        decode_job(&row)
    }

    async fn list_batches(&self, org_id: OrgId, filter: &BatchFilter) -> BatchStoreResult<Vec<BatchJob>> {
        filter.validate()?;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM batch_jobs \
             WHERE org_id = $1 AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY created_at DESC, id DESC LIMIT $3 OFFSET $4"
        );
        let limit = (filter.limit > 0).then(|| filter.limit as i64);
        let rows = sqlx::query(&sql)
            .bind(org_id.as_uuid())
            .bind(filter.status.map(|s| s.as_str()))
            .bind(limit)
            .bind(filter.offset as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_batches", e))?;
        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip_all, fields(batch_id = %id, status = %status), err)]
    async fn update_status(
        &self,
        id: BatchId,
        status: BatchStatus,
        progress: Option<BatchProgress>,
    ) -> BatchStoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("update_status.begin", e))?;
        let (mut job, now) = fetch_for_update(&mut tx, id).await?;
        if !job.apply_status(status, progress.as_ref(), now)? {
            debug!(batch_id = %id, status = %status, "batch is terminal; status update ignored");
            return Ok(());
        }
        save_lifecycle(&mut tx, &job).await?;
        append_log(&mut tx, id, status.as_str()).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("update_status.commit", e))?;
        Ok(())
    }

    async fn add_activity_ref(&self, batch_id: BatchId, activity_id: &ActivityId) -> BatchStoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("add_activity_ref.begin", e))?;
        let (job, _) = fetch_for_update(&mut tx, batch_id).await?;
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM batch_activity_refs WHERE batch_id = $1")
            .bind(batch_id.as_uuid())
            .fetch_one(&mut *tx)
            .await
            .and_then(|row| row.try_get("n"))
            .map_err(|e| map_sqlx_error("add_activity_ref.count", e))?;
        if count >= i64::from(job.activity_count) {
            return Err(DomainError::conflict(format!(
                "batch {batch_id} already references {} activities",
                job.activity_count
            ))
            .into());
        }
        let seq = i32::try_from(count).map_err(|_| DomainError::validation("too many activities"))?;
        insert_ref(&mut tx, batch_id, activity_id, seq)
            .await
            .map_err(|e| match e {
                BatchStoreError::AlreadyExists(_) => {
                    BatchStoreError::AlreadyExists(format!("activity {activity_id} in batch {batch_id}"))
                }
                other => other,
            })?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("add_activity_ref.commit", e))?;
        Ok(())
    }

    async fn mark_activity_complete(
        &self,
        batch_id: BatchId,
        activity_id: &ActivityId,
        emissions: f64,
    ) -> BatchStoreResult<bool> {
        self.mark(batch_id, activity_id, Ok(emissions)).await
    }

    async fn mark_activity_failed(
        &self,
        batch_id: BatchId,
        activity_id: &ActivityId,
        error: &str,
    ) -> BatchStoreResult<bool> {
        self.mark(batch_id, activity_id, Err(error)).await
    }

    async fn list_activity_refs(&self, batch_id: BatchId) -> BatchStoreResult<Vec<ActivityRef>> {
        self.require(batch_id).await?;
        let rows = sqlx::query(
            r#"
            SELECT batch_id, activity_id, status, error_message, emissions, created_at
            FROM batch_activity_refs
            WHERE batch_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(batch_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_activity_refs", e))?;

        rows.iter()
            .map(|row| -> BatchStoreResult<ActivityRef> {
                ActivityRefRow::from_row(row)
                    .map_err(|e| map_sqlx_error("list_activity_refs.decode", e))?
                    .try_into()
            })
            .collect()
    }

    async fn get_pending_batches(&self, limit: usize) -> BatchStoreResult<Vec<BatchJob>> {
        let clause = format!("status IN ('pending', 'queued') AND {LEASE_FREE}");
        self.select_jobs("get_pending_batches", &clause, limit).await
    }

    async fn get_reclaimable_batches(&self, limit: usize) -> BatchStoreResult<Vec<BatchJob>> {
        let clause = format!("status = 'processing' AND {LEASE_FREE}");
        self.select_jobs("get_reclaimable_batches", &clause, limit).await
    }

    #[instrument(skip_all, fields(batch_id = %batch_id, worker_id = %worker_id), err)]
    async fn acquire_lock(
        &self,
        batch_id: BatchId,
        worker_id: &WorkerId,
        lease: Duration,
    ) -> BatchStoreResult<bool> {
        let sql = format!(
            "UPDATE batch_jobs \
             SET locked_by = $2, locked_until = NOW() + make_interval(secs => $3) \
             WHERE id = $1 AND ({LEASE_FREE} OR locked_by = $2)"
        );
        let result = sqlx::query(&sql)
            .bind(batch_id.as_uuid())
            .bind(worker_id.as_str())
            .bind(lease.as_secs_f64())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("acquire_lock", e))?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.require(batch_id).await?;
        Ok(false)
    }

    async fn release_lock(&self, batch_id: BatchId) -> BatchStoreResult<()> {
        let result = sqlx::query("UPDATE batch_jobs SET locked_by = NULL, locked_until = NULL WHERE id = $1")
            .bind(batch_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("release_lock", e))?;
        if result.rows_affected() == 0 {
            return Err(BatchStoreError::NotFound(batch_id));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(batch_id = %batch_id), err)]
    async fn requeue_batch(&self, batch_id: BatchId, error: &str) -> BatchStoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("requeue_batch.begin", e))?;
        let (mut job, now) = fetch_for_update(&mut tx, batch_id).await?;
        job.requeue(error, now)?;
        save_lifecycle(&mut tx, &job).await?;
        append_log(&mut tx, batch_id, ProgressLogEntry::REQUEUED).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("requeue_batch.commit", e))?;
        Ok(())
    }

    #[instrument(skip_all, fields(batch_id = %batch_id), err)]
    async fn fail_batch(
        &self,
        batch_id: BatchId,
        error: &str,
        progress: Option<BatchProgress>,
    ) -> BatchStoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("fail_batch.begin", e))?;
        let (mut job, now) = fetch_for_update(&mut tx, batch_id).await?;
        if !job.fail(error, progress.as_ref(), now)? {
            return Ok(());
        }
        save_lifecycle(&mut tx, &job).await?;
        append_log(&mut tx, batch_id, BatchStatus::Failed.as_str()).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("fail_batch.commit", e))?;
        Ok(())
    }

    #[instrument(skip_all, fields(batch_id = %id), err)]
    async fn delete_batch(&self, id: BatchId) -> BatchStoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("delete_batch.begin", e))?;
        for sql in [
            "DELETE FROM batch_progress_log WHERE batch_id = $1",
            "DELETE FROM batch_activity_refs WHERE batch_id = $1",
        ] {
            sqlx::query(sql)
                .bind(id.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_batch.children", e))?;
        }
        let deleted = sqlx::query("DELETE FROM batch_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_batch", e))?;
        if deleted.rows_affected() == 0 {
            return Err(BatchStoreError::NotFound(id));
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("delete_batch.commit", e))?;
        Ok(())
    }

    async fn get_progress_log(&self, id: BatchId) -> BatchStoreResult<Vec<ProgressLogEntry>> {
        self.require(id).await?;
        let rows = sqlx::query(
            r#"
            SELECT id, batch_id, event_type, processed_count, error_count, total_emissions, timestamp
            FROM batch_progress_log
            WHERE batch_id = $1
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_progress_log", e))?;

        rows.iter()
            .map(|row| -> BatchStoreResult<ProgressLogEntry> {
                let row = ProgressLogRow::from_row(row)
                    .map_err(|e| map_sqlx_error("get_progress_log.decode", e))?;
                Ok(ProgressLogEntry {
                    id: row.id,
                    batch_id: BatchId::from_uuid(row.batch_id),
                    event_type: row.event_type,
                    processed_count: from_i32(row.processed_count, "processed_count")?,
                    error_count: from_i32(row.error_count, "error_count")?,
                    total_emissions: row.total_emissions,
                    timestamp: row.timestamp,
                })
            })
            .collect()
    }
}

// Row types

#[derive(Debug)]
struct BatchJobRow {
    id: uuid::Uuid,
    org_id: uuid::Uuid,
    workspace_id: uuid::Uuid,
    status: String,
    activity_count: i32,
    success_count: i32,
    error_count: i32,
    total_emissions: f64,
    concurrency: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    retry_count: i32,
    max_retries: i32,
    priority: i32,
    locked_by: Option<String>,
    locked_until: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for BatchJobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(BatchJobRow {
            id: row.try_get("id")?,
            org_id: row.try_get("org_id")?,
            workspace_id: row.try_get("workspace_id")?,
            status: row.try_get("status")?,
            activity_count: row.try_get("activity_count")?,
            success_count: row.try_get("success_count")?,
            error_count: row.try_get("error_count")?,
            total_emissions: row.try_get("total_emissions")?,
            concurrency: row.try_get("concurrency")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            priority: row.try_get("priority")?,
            locked_by: row.try_get("locked_by")?,
            locked_until: row.try_get("locked_until")?,
            error_message: row.try_get("error_message")?,
        })
    }
}

impl TryFrom<BatchJobRow> for BatchJob {
    type Error = BatchStoreError;

    fn try_from(row: BatchJobRow) -> Result<Self, Self::Error> {
        Ok(BatchJob {
            id: BatchId::from_uuid(row.id),
            org_id: OrgId::from_uuid(row.org_id),
            workspace_id: row.workspace_id.into(),
            status: row.status.parse()?,
            activity_count: from_i32(row.activity_count, "activity_count")?,
            success_count: from_i32(row.success_count, "success_count")?,
            error_count: from_i32(row.error_count, "error_count")?,
            total_emissions: row.total_emissions,
            concurrency: from_i32(row.concurrency, "concurrency")?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            retry_count: from_i32(row.retry_count, "retry_count")?,
            max_retries: from_i32(row.max_retries, "max_retries")?,
            priority: row.priority,
            locked_by: row.locked_by.map(WorkerId::parse).transpose()?,
            locked_until: row.locked_until,
            error_message: row.error_message,
        })
    }
}

#[derive(Debug)]
struct ActivityRefRow {
    batch_id: uuid::Uuid,
    activity_id: String,
    status: String,
    error_message: Option<String>,
    emissions: Option<f64>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ActivityRefRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ActivityRefRow {
            batch_id: row.try_get("batch_id")?,
            activity_id: row.try_get("activity_id")?,
            status: row.try_get("status")?,
            error_message: row.try_get("error_message")?,
            emissions: row.try_get("emissions")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<ActivityRefRow> for ActivityRef {
    type Error = BatchStoreError;

    fn try_from(row: ActivityRefRow) -> Result<Self, Self::Error> {
        Ok(ActivityRef {
            batch_id: BatchId::from_uuid(row.batch_id),
            activity_id: ActivityId::parse(&row.activity_id)?,
            status: row.status.parse()?,
            error_message: row.error_message,
            emissions: row.emissions,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct ProgressLogRow {
    id: i64,
    batch_id: uuid::Uuid,
    event_type: String,
    processed_count: i32,
    error_count: i32,
    total_emissions: f64,
    timestamp: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ProgressLogRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ProgressLogRow {
            id: row.try_get("id")?,
            batch_id: row.try_get("batch_id")?,
            event_type: row.try_get("event_type")?,
            processed_count: row.try_get("processed_count")?,
            error_count: row.try_get("error_count")?,
            total_emissions: row.try_get("total_emissions")?,
            timestamp: row.try_get("timestamp")?,
        })
    }
}

fn decode_job(row: &PgRow) -> BatchStoreResult<BatchJob> {
    BatchJobRow::from_row(row)
        .map_err(|e| map_sqlx_error("decode_job", e))?
        .try_into()
}

fn to_i32(value: u32, field: &str) -> BatchStoreResult<i32> {
    i32::try_from(value)
        .map_err(|_| DomainError::validation(format!("{field} out of range: {value}")).into())
}

fn from_i32(value: i32, field: &str) -> BatchStoreResult<u32> {
    u32::try_from(value)
        .map_err(|_| DomainError::invariant(format!("negative {field} in storage: {value}")).into())
}

/// Map sqlx errors into batch store errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> BatchStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique violation
                Some("23505") => BatchStoreError::AlreadyExists(msg),
                // Check constraint violation
                Some("23514") => BatchStoreError::Domain(DomainError::invariant(msg)),
                _ => BatchStoreError::Transient(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            BatchStoreError::Transient(format!("connection pool closed in {}", operation))
        }
        _ => BatchStoreError::Transient(format!("sqlx error in {}: {}", operation, err)),
    }
}

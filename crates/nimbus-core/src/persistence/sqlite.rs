// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! Multi-statement operations open with a write so SQLite takes the write
//! lock up front; the claim CAS is then a single conditional UPDATE.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::CoreError;
use crate::job::{
    ASYNC_JOB_CONTENT, JobStatusChange, JoinStatus, StatusUpdate, SubmitJob, SyncKey,
};

use super::{
    AsyncJobRecord, JoinRecord, NodeRecord, Persistence, SyncQueueItemRecord, SyncQueueRecord,
    refused_update,
};

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// The caller is responsible for running [`crate::migrations::run_sqlite`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs the core migrations.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/nimbus.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        crate::migrations::run_sqlite(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// The underlying pool, shared with crates that add their own tables.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Upsert the queue for a key and append an item carrying the content.
async fn enqueue_on(
    conn: &mut SqliteConnection,
    object_type: &str,
    object_id: i64,
    content_type: &str,
    content_id: i64,
    now: DateTime<Utc>,
) -> Result<SyncQueueItemRecord, CoreError> {
    sqlx::query(
        r#"
        INSERT INTO sync_queue (sync_objtype, sync_objid, last_process_number, created)
        VALUES (?, ?, 0, ?)
        ON CONFLICT (sync_objtype, sync_objid) DO NOTHING
        "#,
    )
    .bind(object_type)
    .bind(object_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let (queue_id,): (i64,) =
        sqlx::query_as("SELECT id FROM sync_queue WHERE sync_objtype = ? AND sync_objid = ?")
            .bind(object_type)
            .bind(object_id)
            .fetch_one(&mut *conn)
            .await?;

    sqlx::query(
        r#"
        INSERT INTO sync_queue_item (queue_id, content_type, content_id, created)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (content_type, content_id) DO NOTHING
        "#,
    )
    .bind(queue_id)
    .bind(content_type)
    .bind(content_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let item = sqlx::query_as::<_, SyncQueueItemRecord>(
        "SELECT * FROM sync_queue_item WHERE content_type = ? AND content_id = ?",
    )
    .bind(content_type)
    .bind(content_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(item)
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn get_queue(
        &self,
        object_type: &str,
        object_id: i64,
    ) -> Result<Option<SyncQueueRecord>, CoreError> {
        let record = sqlx::query_as::<_, SyncQueueRecord>(
            "SELECT * FROM sync_queue WHERE sync_objtype = ? AND sync_objid = ?",
        )
        .bind(object_type)
        .bind(object_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn enqueue_item(
        &self,
        object_type: &str,
        object_id: i64,
        content_type: &str,
        content_id: i64,
        now: DateTime<Utc>,
    ) -> Result<SyncQueueItemRecord, CoreError> {
        let mut tx = self.pool.begin().await?;
        let item = enqueue_on(
            &mut tx,
            object_type,
            object_id,
            content_type,
            content_id,
            now,
        )
        .await?;
        tx.commit().await?;
        Ok(item)
    }

    async fn list_claimable_queues(&self, limit: i64) -> Result<Vec<SyncQueueRecord>, CoreError> {
        let records = sqlx::query_as::<_, SyncQueueRecord>(
            r#"
            SELECT q.* FROM sync_queue q
            WHERE EXISTS (
                SELECT 1 FROM sync_queue_item i
                WHERE i.queue_id = q.id AND i.last_process_msid IS NULL
            )
            AND NOT EXISTS (
                SELECT 1 FROM sync_queue_item i
                WHERE i.queue_id = q.id AND i.last_process_msid IS NOT NULL
            )
            ORDER BY (SELECT MIN(i.id) FROM sync_queue_item i WHERE i.queue_id = q.id)
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn claim_next_item(
        &self,
        queue_id: i64,
        msid: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<SyncQueueItemRecord>, CoreError> {
        let mut tx = self.pool.begin().await?;

        let number: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE sync_queue
            SET last_process_number = last_process_number + 1,
                last_process_msid = ?,
                last_process_time = ?
            WHERE id = ?
              AND NOT EXISTS (
                  SELECT 1 FROM sync_queue_item i
                  WHERE i.queue_id = sync_queue.id AND i.last_process_msid IS NOT NULL
              )
              AND EXISTS (
                  SELECT 1 FROM sync_queue_item i
                  WHERE i.queue_id = sync_queue.id AND i.last_process_msid IS NULL
              )
            RETURNING last_process_number
            "#,
        )
        .bind(msid)
        .bind(now)
        .bind(queue_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((number,)) = number else {
            return Ok(None);
        };

        let item = sqlx::query_as::<_, SyncQueueItemRecord>(
            r#"
            UPDATE sync_queue_item
            SET last_process_msid = ?, last_process_number = ?, last_process_time = ?
            WHERE id = (
                SELECT id FROM sync_queue_item
                WHERE queue_id = ? AND last_process_msid IS NULL
                ORDER BY id
                LIMIT 1
            )
            AND last_process_msid IS NULL
            RETURNING *
            "#,
        )
        .bind(msid)
        .bind(number)
        .bind(now)
        .bind(queue_id)
        .fetch_optional(&mut *tx)
        .await?;

        match item {
            Some(item) => {
                tx.commit().await?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    async fn get_queue_item(&self, item_id: i64) -> Result<Option<SyncQueueItemRecord>, CoreError> {
        let record =
            sqlx::query_as::<_, SyncQueueItemRecord>("SELECT * FROM sync_queue_item WHERE id = ?")
                .bind(item_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(record)
    }

    async fn get_item_by_content(
        &self,
        content_type: &str,
        content_id: i64,
    ) -> Result<Option<SyncQueueItemRecord>, CoreError> {
        let record = sqlx::query_as::<_, SyncQueueItemRecord>(
            "SELECT * FROM sync_queue_item WHERE content_type = ? AND content_id = ?",
        )
        .bind(content_type)
        .bind(content_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_queue_items(
        &self,
        queue_id: i64,
    ) -> Result<Vec<SyncQueueItemRecord>, CoreError> {
        let records = sqlx::query_as::<_, SyncQueueItemRecord>(
            "SELECT * FROM sync_queue_item WHERE queue_id = ? ORDER BY id",
        )
        .bind(queue_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_items_claimed_by(
        &self,
        msid: i64,
    ) -> Result<Vec<SyncQueueItemRecord>, CoreError> {
        let records = sqlx::query_as::<_, SyncQueueItemRecord>(
            "SELECT * FROM sync_queue_item WHERE last_process_msid = ? ORDER BY id",
        )
        .bind(msid)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn delete_queue_item(&self, item_id: i64) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM sync_queue_item WHERE id = ?")
            .bind(item_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn return_queue_item(&self, item_id: i64) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue_item
            SET last_process_msid = NULL, last_process_number = NULL, last_process_time = NULL
            WHERE id = ? AND last_process_msid IS NOT NULL
            "#,
        )
        .bind(item_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn reset_items_claimed_by(&self, msid: i64) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue_item
            SET last_process_msid = NULL, last_process_number = NULL, last_process_time = NULL
            WHERE last_process_msid = ?
              AND NOT EXISTS (
                  SELECT 1 FROM async_job j
                  WHERE sync_queue_item.content_type = 'AsyncJob'
                    AND j.id = sync_queue_item.content_id
                    AND j.status = 'in_progress'
                    AND j.init_msid = ?
              )
            "#,
        )
        .bind(msid)
        .bind(msid)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn purge_empty_queues(&self, idle_before: DateTime<Utc>) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM sync_queue
            WHERE NOT EXISTS (SELECT 1 FROM sync_queue_item i WHERE i.queue_id = sync_queue.id)
              AND COALESCE(last_process_time, created) < ?
            "#,
        )
        .bind(idle_before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn create_job(
        &self,
        job: &SubmitJob,
        now: DateTime<Utc>,
    ) -> Result<(AsyncJobRecord, SyncQueueItemRecord), CoreError> {
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, AsyncJobRecord>(
            r#"
            INSERT INTO async_job (user_id, account_id, cmd, cmd_info, status,
                                   instance_type, instance_id, created, last_updated)
            VALUES (?, ?, ?, ?, 'queued', ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(job.user_id)
        .bind(job.account_id)
        .bind(&job.cmd)
        .bind(&job.cmd_info)
        .bind(&job.instance_type)
        .bind(job.instance_id)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let key = SyncKey::for_job(&record);
        let item = enqueue_on(
            &mut tx,
            &key.object_type,
            key.object_id,
            ASYNC_JOB_CONTENT,
            record.id,
            now,
        )
        .await?;

        tx.commit().await?;
        Ok((record, item))
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<AsyncJobRecord>, CoreError> {
        let record = sqlx::query_as::<_, AsyncJobRecord>("SELECT * FROM async_job WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn mark_job_in_progress(
        &self,
        job_id: i64,
        msid: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE async_job
            SET status = 'in_progress', init_msid = ?, last_updated = ?
            WHERE id = ? AND status = 'queued' AND waiting_on_join = 0 AND removed IS NULL
            "#,
        )
        .bind(msid)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_job_status(
        &self,
        job_id: i64,
        change: &JobStatusChange,
        msid: i64,
        now: DateTime<Utc>,
    ) -> Result<StatusUpdate, CoreError> {
        let terminal = change.status.is_terminal();
        let mut tx = self.pool.begin().await?;

        let result = if terminal {
            sqlx::query(
                r#"
                UPDATE async_job
                SET status = ?, process_status = ?, result_code = ?, result = ?,
                    complete_msid = ?, waiting_on_join = 0, last_updated = ?
                WHERE id = ? AND status NOT IN ('succeeded', 'failed')
                  AND (? IS NULL OR (status = 'in_progress' AND init_msid = ?))
                  AND NOT EXISTS (
                      SELECT 1 FROM async_job_join_map m
                      WHERE m.job_id = async_job.id AND m.join_status = 'pending'
                  )
                "#,
            )
            .bind(change.status.as_str())
            .bind(change.process_status)
            .bind(change.result_code)
            .bind(&change.result)
            .bind(msid)
            .bind(now)
            .bind(job_id)
            .bind(change.owner)
            .bind(change.owner)
            .execute(&mut *tx)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE async_job
                SET process_status = ?, last_updated = ?
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(change.process_status)
            .bind(now)
            .bind(job_id)
            .bind(change.status.as_str())
            .execute(&mut *tx)
            .await?
        };

        if result.rows_affected() == 0 {
            let current: Option<(String, Option<i64>, i64)> = sqlx::query_as(
                r#"
                SELECT status, init_msid,
                       (SELECT COUNT(*) FROM async_job_join_map m
                        WHERE m.job_id = async_job.id AND m.join_status = 'pending')
                FROM async_job WHERE id = ?
                "#,
            )
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;
            return match current {
                None => Err(CoreError::JobNotFound { job_id }),
                Some(current) => Ok(refused_update(change, current)),
            };
        }

        if terminal {
            sqlx::query("DELETE FROM sync_queue_item WHERE content_type = ? AND content_id = ?")
                .bind(ASYNC_JOB_CONTENT)
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(StatusUpdate::Applied)
    }

    async fn park_job(
        &self,
        job_id: i64,
        keep_item: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE async_job
            SET status = 'queued', waiting_on_join = 1, init_msid = NULL, last_updated = ?
            WHERE id = ? AND status = 'in_progress'
            "#,
        )
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        if !keep_item {
            sqlx::query("DELETE FROM sync_queue_item WHERE content_type = ? AND content_id = ?")
                .bind(ASYNC_JOB_CONTENT)
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn wake_job(&self, job_id: i64, now: DateTime<Utc>) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, AsyncJobRecord>(
            r#"
            UPDATE async_job
            SET waiting_on_join = 0, last_updated = ?
            WHERE id = ? AND waiting_on_join = 1 AND status = 'queued'
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = job else {
            return Ok(false);
        };

        let returned = sqlx::query(
            r#"
            UPDATE sync_queue_item
            SET last_process_msid = NULL, last_process_number = NULL, last_process_time = NULL
            WHERE content_type = ? AND content_id = ?
            "#,
        )
        .bind(ASYNC_JOB_CONTENT)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        if returned.rows_affected() == 0 {
            let key = SyncKey::for_job(&job);
            enqueue_on(
                &mut tx,
                &key.object_type,
                key.object_id,
                ASYNC_JOB_CONTENT,
                job_id,
                now,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn record_job_poll(&self, job_id: i64, now: DateTime<Utc>) -> Result<bool, CoreError> {
        let result = sqlx::query("UPDATE async_job SET last_polled = ? WHERE id = ?")
            .bind(now)
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn request_job_cancel(
        &self,
        job_id: i64,
        _now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE async_job SET cancel_requested = 1
            WHERE id = ? AND status NOT IN ('succeeded', 'failed') AND removed IS NULL
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn requeue_stale_jobs(
        &self,
        msid: i64,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, CoreError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            UPDATE async_job
            SET status = 'queued', init_msid = NULL, last_updated = ?
            WHERE init_msid = ? AND status = 'in_progress' AND last_updated < ?
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(msid)
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn list_wakeable_jobs(&self, limit: i64) -> Result<Vec<i64>, CoreError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT j.id FROM async_job j
            WHERE j.status = 'queued' AND j.waiting_on_join = 1
              AND NOT EXISTS (
                  SELECT 1 FROM async_job_join_map m
                  WHERE m.job_id = j.id AND m.join_status = 'pending'
              )
            ORDER BY j.id
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn remove_terminal_jobs(
        &self,
        finished_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE async_job SET removed = ?
            WHERE id IN (
                SELECT id FROM async_job
                WHERE removed IS NULL
                  AND status IN ('succeeded', 'failed')
                  AND last_updated < ?
                ORDER BY id
                LIMIT ?
            )
            "#,
        )
        .bind(now)
        .bind(finished_before)
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn insert_join(
        &self,
        job_id: i64,
        join_job_id: i64,
        status: JoinStatus,
        result: Option<&str>,
        msid: i64,
        now: DateTime<Utc>,
    ) -> Result<JoinRecord, CoreError> {
        let complete_msid = (status != JoinStatus::Pending).then_some(msid);

        sqlx::query(
            r#"
            INSERT INTO async_job_join_map (job_id, join_job_id, join_status, join_result,
                                            join_msid, complete_msid, created, last_updated)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (job_id, join_job_id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(join_job_id)
        .bind(status.as_str())
        .bind(result)
        .bind(msid)
        .bind(complete_msid)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let record = sqlx::query_as::<_, JoinRecord>(
            "SELECT * FROM async_job_join_map WHERE job_id = ? AND join_job_id = ?",
        )
        .bind(job_id)
        .bind(join_job_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_join(
        &self,
        job_id: i64,
        join_job_id: i64,
    ) -> Result<Option<JoinRecord>, CoreError> {
        let record = sqlx::query_as::<_, JoinRecord>(
            "SELECT * FROM async_job_join_map WHERE job_id = ? AND join_job_id = ?",
        )
        .bind(job_id)
        .bind(join_job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_joins(&self, job_id: i64) -> Result<Vec<JoinRecord>, CoreError> {
        let records = sqlx::query_as::<_, JoinRecord>(
            "SELECT * FROM async_job_join_map WHERE job_id = ? ORDER BY id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_joiners(&self, join_job_id: i64) -> Result<Vec<i64>, CoreError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT DISTINCT job_id FROM async_job_join_map WHERE join_job_id = ? ORDER BY job_id",
        )
        .bind(join_job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn count_pending_joins(&self, job_id: i64) -> Result<i64, CoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM async_job_join_map WHERE job_id = ? AND join_status = 'pending'",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn resolve_joins(
        &self,
        join_job_id: i64,
        status: JoinStatus,
        result: Option<&str>,
        msid: i64,
        now: DateTime<Utc>,
    ) -> Result<u64, CoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE async_job_join_map
            SET join_status = ?, join_result = ?, complete_msid = ?, last_updated = ?
            WHERE join_job_id = ? AND join_status = 'pending'
            "#,
        )
        .bind(status.as_str())
        .bind(result)
        .bind(msid)
        .bind(now)
        .bind(join_job_id)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected())
    }

    async fn resolve_join(
        &self,
        join_id: i64,
        status: JoinStatus,
        result: Option<&str>,
        msid: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE async_job_join_map
            SET join_status = ?, join_result = ?, complete_msid = ?, last_updated = ?
            WHERE id = ? AND join_status = 'pending'
            "#,
        )
        .bind(status.as_str())
        .bind(result)
        .bind(msid)
        .bind(now)
        .bind(join_id)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }

    async fn list_orphaned_joins(&self, limit: i64) -> Result<Vec<JoinRecord>, CoreError> {
        let records = sqlx::query_as::<_, JoinRecord>(
            r#"
            SELECT m.* FROM async_job_join_map m
            LEFT JOIN async_job j ON j.id = m.join_job_id
            WHERE m.join_status = 'pending'
              AND (j.id IS NULL OR j.removed IS NOT NULL OR j.status IN ('succeeded', 'failed'))
            ORDER BY m.id
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn register_node(
        &self,
        msid: i64,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO mshost (msid, name, state, last_heartbeat, created)
            VALUES (?, ?, 'up', ?, ?)
            ON CONFLICT (msid) DO UPDATE
            SET name = excluded.name, state = 'up', last_heartbeat = excluded.last_heartbeat
            "#,
        )
        .bind(msid)
        .bind(name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn heartbeat_node(&self, msid: i64, now: DateTime<Utc>) -> Result<bool, CoreError> {
        let result = sqlx::query("UPDATE mshost SET last_heartbeat = ?, state = 'up' WHERE msid = ?")
            .bind(now)
            .bind(msid)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_node(&self, msid: i64) -> Result<Option<NodeRecord>, CoreError> {
        let record = sqlx::query_as::<_, NodeRecord>("SELECT * FROM mshost WHERE msid = ?")
            .bind(msid)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn list_silent_nodes(&self, cutoff: DateTime<Utc>) -> Result<Vec<NodeRecord>, CoreError> {
        let records = sqlx::query_as::<_, NodeRecord>(
            "SELECT * FROM mshost WHERE last_heartbeat < ? ORDER BY msid",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn mark_node_down(&self, msid: i64, cutoff: DateTime<Utc>) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE mshost SET state = 'down' WHERE msid = ? AND state = 'up' AND last_heartbeat < ?",
        )
        .bind(msid)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let result: Result<(i64,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}

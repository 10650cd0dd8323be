// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for nimbus-core.
//!
//! Every cross-node guarantee of the job framework comes from the
//! conditional updates behind this trait; callers never lock rows.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::job::{JobStatus, JobStatusChange, JoinStatus, StatusUpdate, SubmitJob};

/// Sync queue row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SyncQueueRecord {
    /// Database primary key.
    pub id: i64,
    /// Object type of the serialization domain.
    pub sync_objtype: String,
    /// Object id of the serialization domain.
    pub sync_objid: i64,
    /// Claim counter, bumped by every successful claim.
    pub last_process_number: i64,
    /// Node that made the last claim.
    pub last_process_msid: Option<i64>,
    /// When the last claim happened.
    pub last_process_time: Option<DateTime<Utc>>,
    /// When the queue was created.
    pub created: DateTime<Utc>,
}

/// Sync queue item row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SyncQueueItemRecord {
    /// Database primary key; also the FIFO position.
    pub id: i64,
    /// Owning queue.
    pub queue_id: i64,
    /// What the item carries (`"AsyncJob"` for jobs).
    pub content_type: String,
    /// Id of the carried content.
    pub content_id: i64,
    /// Claiming node, `None` while waiting.
    pub last_process_msid: Option<i64>,
    /// Queue claim number this item was claimed under.
    pub last_process_number: Option<i64>,
    /// When the item was claimed.
    pub last_process_time: Option<DateTime<Utc>>,
    /// When the item was enqueued.
    pub created: DateTime<Utc>,
}

impl SyncQueueItemRecord {
    /// An item is active while a node holds it.
    pub fn is_active(&self) -> bool {
        self.last_process_msid.is_some()
    }
}

/// Async job row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AsyncJobRecord {
    /// Job id.
    pub id: i64,
    /// Submitting user.
    pub user_id: i64,
    /// Owning account.
    pub account_id: i64,
    /// Command name.
    pub cmd: String,
    /// Serialized command parameters.
    pub cmd_info: String,
    /// Current status (queued, in_progress, succeeded, failed).
    pub status: String,
    /// Handler-defined progress marker.
    pub process_status: i32,
    /// Result code, 0 on success.
    pub result_code: i32,
    /// Serialized result or error.
    pub result: Option<String>,
    /// Entity type the job is bound to.
    pub instance_type: Option<String>,
    /// Entity id the job is bound to.
    pub instance_id: Option<i64>,
    /// Node that owns (or last owned) the execution.
    pub init_msid: Option<i64>,
    /// Node that completed the job.
    pub complete_msid: Option<i64>,
    /// Parked until its joins resolve.
    pub waiting_on_join: bool,
    /// Advisory cancellation flag.
    pub cancel_requested: bool,
    /// When the job was submitted.
    pub created: DateTime<Utc>,
    /// Last state change.
    pub last_updated: DateTime<Utc>,
    /// Last time a client polled the job.
    pub last_polled: Option<DateTime<Utc>>,
    /// Soft-removal timestamp.
    pub removed: Option<DateTime<Utc>>,
}

impl AsyncJobRecord {
    /// Typed status. Unknown values are reported as failed.
    pub fn job_status(&self) -> JobStatus {
        JobStatus::parse(&self.status).unwrap_or(JobStatus::Failed)
    }

    /// Whether the job has reached SUCCEEDED or FAILED.
    pub fn is_terminal(&self) -> bool {
        self.job_status().is_terminal()
    }
}

/// Join map row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JoinRecord {
    /// Database primary key.
    pub id: i64,
    /// The waiting job.
    pub job_id: i64,
    /// The job being waited upon.
    pub join_job_id: i64,
    /// pending, succeeded or failed.
    pub join_status: String,
    /// Copy of the joinee's result once resolved.
    pub join_result: Option<String>,
    /// Node that created the edge.
    pub join_msid: Option<i64>,
    /// Node that resolved the edge.
    pub complete_msid: Option<i64>,
    /// When the edge was created.
    pub created: DateTime<Utc>,
    /// Last change.
    pub last_updated: DateTime<Utc>,
}

impl JoinRecord {
    /// Typed join status.
    pub fn status(&self) -> JoinStatus {
        JoinStatus::parse(&self.join_status)
    }
}

/// Management server liveness row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NodeRecord {
    /// Node id.
    pub msid: i64,
    /// Human readable name.
    pub name: String,
    /// up or down.
    pub state: String,
    /// Last heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    /// First registration.
    pub created: DateTime<Utc>,
}

/// Persistence backend for the job framework.
///
/// Timestamps are always passed in by the caller so both backends compare
/// values written by the same clock.
#[async_trait::async_trait]
pub trait Persistence: Send + Sync {
    // ========================================================================
    // Sync queues
    // ========================================================================

    /// Look up a queue by its key.
    async fn get_queue(
        &self,
        object_type: &str,
        object_id: i64,
    ) -> Result<Option<SyncQueueRecord>, CoreError>;

    /// Create the queue if needed and append an item.
    ///
    /// Returns the existing item when the content is already queued.
    async fn enqueue_item(
        &self,
        object_type: &str,
        object_id: i64,
        content_type: &str,
        content_id: i64,
        now: DateTime<Utc>,
    ) -> Result<SyncQueueItemRecord, CoreError>;

    /// Queues with a waiting item and no active item, oldest head first.
    async fn list_claimable_queues(&self, limit: i64) -> Result<Vec<SyncQueueRecord>, CoreError>;

    /// Claim the head of a queue for `msid`.
    ///
    /// Returns `None` when the queue is busy, empty, or another node won.
    async fn claim_next_item(
        &self,
        queue_id: i64,
        msid: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<SyncQueueItemRecord>, CoreError>;

    /// Fetch one item.
    async fn get_queue_item(&self, item_id: i64) -> Result<Option<SyncQueueItemRecord>, CoreError>;

    /// Fetch the item carrying a piece of content.
    async fn get_item_by_content(
        &self,
        content_type: &str,
        content_id: i64,
    ) -> Result<Option<SyncQueueItemRecord>, CoreError>;

    /// All items of a queue in FIFO order.
    async fn list_queue_items(&self, queue_id: i64)
    -> Result<Vec<SyncQueueItemRecord>, CoreError>;

    /// Items currently claimed by a node.
    async fn list_items_claimed_by(&self, msid: i64)
    -> Result<Vec<SyncQueueItemRecord>, CoreError>;

    /// Delete an item. Returns false if it was already gone.
    async fn delete_queue_item(&self, item_id: i64) -> Result<bool, CoreError>;

    /// Put a claimed item back to waiting, keeping its position.
    async fn return_queue_item(&self, item_id: i64) -> Result<bool, CoreError>;

    /// Return every item claimed by `msid` unless its job is still running
    /// under that node.
    async fn reset_items_claimed_by(&self, msid: i64) -> Result<u64, CoreError>;

    /// Delete queues without items that have been idle since `idle_before`.
    async fn purge_empty_queues(&self, idle_before: DateTime<Utc>) -> Result<u64, CoreError>;

    // ========================================================================
    // Async jobs
    // ========================================================================

    /// Insert a QUEUED job and its sync queue item in one transaction.
    async fn create_job(
        &self,
        job: &SubmitJob,
        now: DateTime<Utc>,
    ) -> Result<(AsyncJobRecord, SyncQueueItemRecord), CoreError>;

    /// Fetch a job, including soft-removed ones.
    async fn get_job(&self, job_id: i64) -> Result<Option<AsyncJobRecord>, CoreError>;

    /// CAS QUEUED (not waiting on joins) to IN_PROGRESS owned by `msid`.
    async fn mark_job_in_progress(
        &self,
        job_id: i64,
        msid: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Apply a status change unless the job is already terminal.
    ///
    /// A terminal change also deletes the job's sync queue item in the same
    /// transaction.
    async fn update_job_status(
        &self,
        job_id: i64,
        change: &JobStatusChange,
        msid: i64,
        now: DateTime<Utc>,
    ) -> Result<StatusUpdate, CoreError>;

    /// Move an IN_PROGRESS job back to QUEUED with `waiting_on_join` set.
    ///
    /// With `keep_item` the claimed queue item stays claimed; otherwise it
    /// is deleted.
    async fn park_job(
        &self,
        job_id: i64,
        keep_item: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// CAS `waiting_on_join` true to false and make the job claimable again.
    ///
    /// A parked item is returned to waiting; otherwise a new item is
    /// appended to the job's queue. Only one caller ever gets `true`.
    async fn wake_job(&self, job_id: i64, now: DateTime<Utc>) -> Result<bool, CoreError>;

    /// Stamp `last_polled`.
    async fn record_job_poll(&self, job_id: i64, now: DateTime<Utc>) -> Result<bool, CoreError>;

    /// Set the advisory cancellation flag on a non-terminal job.
    async fn request_job_cancel(&self, job_id: i64, now: DateTime<Utc>)
    -> Result<bool, CoreError>;

    /// Requeue IN_PROGRESS jobs owned by `msid` not updated since `stale_before`.
    ///
    /// Returns the requeued job ids.
    async fn requeue_stale_jobs(
        &self,
        msid: i64,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, CoreError>;

    /// QUEUED jobs parked on joins that have no pending join rows left.
    async fn list_wakeable_jobs(&self, limit: i64) -> Result<Vec<i64>, CoreError>;

    /// Soft-remove terminal jobs last updated before `finished_before`.
    async fn remove_terminal_jobs(
        &self,
        finished_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, CoreError>;

    // ========================================================================
    // Join map
    // ========================================================================

    /// Insert a join edge, returning the existing one on duplicates.
    async fn insert_join(
        &self,
        job_id: i64,
        join_job_id: i64,
        status: JoinStatus,
        result: Option<&str>,
        msid: i64,
        now: DateTime<Utc>,
    ) -> Result<JoinRecord, CoreError>;

    /// Fetch one edge.
    async fn get_join(&self, job_id: i64, join_job_id: i64)
    -> Result<Option<JoinRecord>, CoreError>;

    /// All edges of a joiner.
    async fn list_joins(&self, job_id: i64) -> Result<Vec<JoinRecord>, CoreError>;

    /// Distinct joiners waiting on a joinee (any join status).
    async fn list_joiners(&self, join_job_id: i64) -> Result<Vec<i64>, CoreError>;

    /// Number of pending edges of a joiner.
    async fn count_pending_joins(&self, job_id: i64) -> Result<i64, CoreError>;

    /// Resolve every pending edge pointing at `join_job_id`.
    async fn resolve_joins(
        &self,
        join_job_id: i64,
        status: JoinStatus,
        result: Option<&str>,
        msid: i64,
        now: DateTime<Utc>,
    ) -> Result<u64, CoreError>;

    /// Resolve a single pending edge.
    async fn resolve_join(
        &self,
        join_id: i64,
        status: JoinStatus,
        result: Option<&str>,
        msid: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Pending edges whose joinee is missing, removed or already terminal.
    async fn list_orphaned_joins(&self, limit: i64) -> Result<Vec<JoinRecord>, CoreError>;

    // ========================================================================
    // Node liveness
    // ========================================================================

    /// Register a node (or bring it back up) and stamp its heartbeat.
    async fn register_node(&self, msid: i64, name: &str, now: DateTime<Utc>)
    -> Result<(), CoreError>;

    /// Stamp a heartbeat. Returns false if the node is unknown.
    async fn heartbeat_node(&self, msid: i64, now: DateTime<Utc>) -> Result<bool, CoreError>;

    /// Fetch a node.
    async fn get_node(&self, msid: i64) -> Result<Option<NodeRecord>, CoreError>;

    /// Nodes whose last heartbeat is older than `cutoff`, in any state.
    async fn list_silent_nodes(&self, cutoff: DateTime<Utc>) -> Result<Vec<NodeRecord>, CoreError>;

    /// CAS an up node with a heartbeat older than `cutoff` to down.
    async fn mark_node_down(&self, msid: i64, cutoff: DateTime<Utc>) -> Result<bool, CoreError>;

    // ========================================================================
    // Health
    // ========================================================================

    /// Check that the database answers.
    async fn health_check_db(&self) -> Result<bool, CoreError>;
}

/// Why a status change matched no row, given the job's current
/// `(status, init_msid, pending joins)`.
pub(crate) fn refused_update(
    change: &JobStatusChange,
    (status, init_msid, pending_joins): (String, Option<i64>, i64),
) -> StatusUpdate {
    if !change.status.is_terminal() {
        return StatusUpdate::Rejected;
    }
    if status == change.status.as_str() {
        return StatusUpdate::Unchanged;
    }
    let current = JobStatus::parse(&status);
    if current.is_none_or(|s| s.is_terminal()) {
        return StatusUpdate::Rejected;
    }
    if let Some(owner) = change.owner
        && (current != Some(JobStatus::InProgress) || init_msid != Some(owner))
    {
        return StatusUpdate::Rejected;
    }
    if pending_joins > 0 {
        StatusUpdate::JoinsPending
    } else {
        StatusUpdate::Rejected
    }
}

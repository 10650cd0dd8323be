// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable async job records.
//!
//! `update_status` is the only path that changes a job's outcome. Terminal
//! states never regress: re-applying the same terminal status is a no-op and
//! anything else is rejected and logged.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{info, instrument, warn};

use crate::error::{CoreError, Result};
use crate::job::{JobStatusChange, StatusUpdate, SubmitJob};
use crate::join_map::JoinMap;
use crate::persistence::{AsyncJobRecord, Persistence};

/// Checks that a job's target entity exists before the job is admitted.
#[async_trait::async_trait]
pub trait InstanceResolver: Send + Sync {
    /// Whether an entity of this resolver's type with `instance_id` exists
    /// and has not been removed.
    async fn exists(&self, instance_id: i64) -> Result<bool>;
}

/// Resolvers by instance type. Types without a resolver are admitted as-is.
#[derive(Clone, Default)]
pub struct InstanceResolvers {
    resolvers: HashMap<String, Arc<dyn InstanceResolver>>,
}

impl InstanceResolvers {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resolver for an instance type.
    pub fn register(
        &mut self,
        instance_type: impl Into<String>,
        resolver: Arc<dyn InstanceResolver>,
    ) -> &mut Self {
        self.resolvers.insert(instance_type.into(), resolver);
        self
    }

    /// Look up the resolver for a type.
    pub fn get(&self, instance_type: &str) -> Option<&Arc<dyn InstanceResolver>> {
        self.resolvers.get(instance_type)
    }
}

/// Job store service.
pub struct JobStore {
    persistence: Arc<dyn Persistence>,
    joins: Arc<JoinMap>,
    commands: BTreeSet<String>,
    resolvers: InstanceResolvers,
    wake: Arc<Notify>,
}

impl JobStore {
    /// Create a store.
    ///
    /// `commands` is the set of command names a handler exists for; `wake`
    /// is signalled after every submission.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        joins: Arc<JoinMap>,
        commands: BTreeSet<String>,
        resolvers: InstanceResolvers,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            persistence,
            joins,
            commands,
            resolvers,
            wake,
        }
    }

    /// Validate and persist a new job, queue it and wake the dispatcher.
    #[instrument(skip(self, job), fields(cmd = %job.cmd))]
    pub async fn submit(&self, job: SubmitJob) -> Result<i64> {
        job.validate()?;

        if !self.commands.contains(&job.cmd) {
            return Err(CoreError::UnknownCommand { cmd: job.cmd });
        }

        if let (Some(instance_type), Some(instance_id)) = (&job.instance_type, job.instance_id)
            && let Some(resolver) = self.resolvers.get(instance_type)
            && !resolver.exists(instance_id).await?
        {
            return Err(CoreError::UnknownInstance {
                instance_type: instance_type.clone(),
                instance_id,
            });
        }

        let (record, item) = self.persistence.create_job(&job, Utc::now()).await?;
        info!(
            job_id = record.id,
            queue_id = item.queue_id,
            instance_type = record.instance_type.as_deref().unwrap_or("-"),
            instance_id = record.instance_id.unwrap_or_default(),
            "Job submitted"
        );
        self.wake.notify_one();
        Ok(record.id)
    }

    /// Apply a status change.
    ///
    /// A terminal change releases the job's queue item and wakes joiners.
    /// It is refused with [`StatusUpdate::JoinsPending`] while the job still
    /// waits on other jobs.
    #[instrument(skip(self, change), fields(status = %change.status))]
    pub async fn update_status(
        &self,
        job_id: i64,
        change: JobStatusChange,
        msid: i64,
    ) -> Result<StatusUpdate> {
        let outcome = self
            .persistence
            .update_job_status(job_id, &change, msid, Utc::now())
            .await?;

        match outcome {
            StatusUpdate::Applied if change.status.is_terminal() => {
                info!(job_id, result_code = change.result_code, "Job finished");
                self.joins
                    .on_job_complete(job_id, change.status, change.result.as_deref(), msid)
                    .await?;
            }
            StatusUpdate::Applied | StatusUpdate::Unchanged => {}
            StatusUpdate::Rejected => {
                warn!(
                    job_id,
                    owner = ?change.owner,
                    "Status change rejected: job is finished, not in that state or owned elsewhere"
                );
            }
            StatusUpdate::JoinsPending => {
                warn!(job_id, "Job cannot finish while it has pending joins");
            }
        }
        Ok(outcome)
    }

    /// Single-read snapshot of a job. Removed jobs are not found.
    pub async fn query_status(&self, job_id: i64) -> Result<AsyncJobRecord> {
        self.persistence
            .get_job(job_id)
            .await?
            .filter(|job| job.removed.is_none())
            .ok_or(CoreError::JobNotFound { job_id })
    }

    /// Record that a client polled the job.
    pub async fn record_poll(&self, job_id: i64) -> Result<()> {
        if self.persistence.record_job_poll(job_id, Utc::now()).await? {
            Ok(())
        } else {
            Err(CoreError::JobNotFound { job_id })
        }
    }

    /// CAS QUEUED to IN_PROGRESS for `msid`. False if someone else owns it
    /// or it is parked on joins.
    pub async fn mark_owned(&self, job_id: i64, msid: i64) -> Result<bool> {
        self.persistence
            .mark_job_in_progress(job_id, msid, Utc::now())
            .await
    }

    /// Park a running job on its joins.
    pub async fn park(&self, job_id: i64, exclusive: bool) -> Result<bool> {
        self.persistence.park_job(job_id, exclusive, Utc::now()).await
    }

    /// Ask the handler to stop. Returns false if the job is already finished.
    #[instrument(skip(self))]
    pub async fn request_cancel(&self, job_id: i64) -> Result<bool> {
        let flagged = self
            .persistence
            .request_job_cancel(job_id, Utc::now())
            .await?;
        if !flagged {
            // Distinguish "finished" from "never existed".
            self.query_status(job_id).await?;
        } else {
            info!(job_id, "Cancellation requested");
        }
        Ok(flagged)
    }

    /// Whether cancellation was requested.
    pub async fn is_cancel_requested(&self, job_id: i64) -> Result<bool> {
        Ok(self.query_status(job_id).await?.cancel_requested)
    }

    /// Update `process_status` of a running job.
    pub async fn update_progress(
        &self,
        job_id: i64,
        process_status: i32,
        msid: i64,
    ) -> Result<StatusUpdate> {
        self.update_status(job_id, JobStatusChange::progress(process_status), msid)
            .await
    }

    /// Raw record including removed jobs, for the dispatcher and recovery.
    pub async fn find(&self, job_id: i64) -> Result<Option<AsyncJobRecord>> {
        self.persistence.get_job(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use crate::persistence::SqlitePersistence;
    use sqlx::sqlite::SqlitePoolOptions;

    struct KnownVms(Vec<i64>);

    #[async_trait::async_trait]
    impl InstanceResolver for KnownVms {
        async fn exists(&self, instance_id: i64) -> Result<bool> {
            Ok(self.0.contains(&instance_id))
        }
    }

    async fn store() -> (Arc<dyn Persistence>, JobStore, Arc<Notify>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        crate::migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");
        let persistence: Arc<dyn Persistence> = Arc::new(SqlitePersistence::new(pool));
        let wake = Arc::new(Notify::new());
        let joins = Arc::new(JoinMap::new(persistence.clone(), wake.clone()));

        let mut resolvers = InstanceResolvers::new();
        resolvers.register("VirtualMachine", Arc::new(KnownVms(vec![42])));

        let commands = ["VmWorkStart".to_string()].into_iter().collect();
        let store = JobStore::new(persistence.clone(), joins, commands, resolvers, wake.clone());
        (persistence, store, wake)
    }

    #[tokio::test]
    async fn test_submit_validation_errors() {
        let (_, store, _) = store().await;

        let err = store.submit(SubmitJob::new("Nope")).await.unwrap_err();
        assert!(matches!(err, CoreError::UnknownCommand { .. }));

        let mut bad = SubmitJob::new("VmWorkStart");
        bad.cmd_info = "[".to_string();
        assert_eq!(
            store.submit(bad).await.unwrap_err().error_code(),
            "VALIDATION_ERROR"
        );

        let err = store
            .submit(SubmitJob::new("VmWorkStart").instance("VirtualMachine", 7))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::UnknownInstance { instance_id: 7, .. }
        ));

        // No resolver registered for this type: admitted.
        assert!(
            store
                .submit(SubmitJob::new("VmWorkStart").instance("Volume", 7))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_submit_queues_and_signals() {
        let (p, store, wake) = store().await;
        let job_id = store
            .submit(
                SubmitJob::new("VmWorkStart")
                    .caller(1, 2)
                    .instance("VirtualMachine", 42),
            )
            .await
            .unwrap();

        // The permit stored by notify_one completes immediately.
        tokio::time::timeout(std::time::Duration::from_millis(100), wake.notified())
            .await
            .expect("dispatcher was not signalled");

        let job = store.query_status(job_id).await.unwrap();
        assert_eq!(job.job_status(), JobStatus::Queued);
        assert_eq!(job.account_id, 2);
        assert!(
            p.get_item_by_content("AsyncJob", job_id)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_update_status_never_regresses() {
        let (_, store, _) = store().await;
        let job_id = store.submit(SubmitJob::new("VmWorkStart")).await.unwrap();
        assert!(store.mark_owned(job_id, 1).await.unwrap());
        assert!(!store.mark_owned(job_id, 2).await.unwrap());

        assert_eq!(
            store.update_progress(job_id, 50, 1).await.unwrap(),
            StatusUpdate::Applied
        );
        assert_eq!(store.query_status(job_id).await.unwrap().process_status, 50);

        let failed = JobStatusChange::failed(530, Some("{}".to_string()));
        assert_eq!(
            store.update_status(job_id, failed.clone(), 1).await.unwrap(),
            StatusUpdate::Applied
        );
        assert_eq!(
            store.update_status(job_id, failed, 1).await.unwrap(),
            StatusUpdate::Unchanged
        );
        assert_eq!(
            store
                .update_status(job_id, JobStatusChange::succeeded(None), 1)
                .await
                .unwrap(),
            StatusUpdate::Rejected
        );

        let job = store.query_status(job_id).await.unwrap();
        assert_eq!(job.job_status(), JobStatus::Failed);
        assert_eq!(job.result_code, 530);
    }

    #[tokio::test]
    async fn test_requeued_job_cannot_be_finished_by_previous_owner() {
        let (p, store, _) = store().await;
        let job_id = store
            .submit(SubmitJob::new("VmWorkStart").instance("VirtualMachine", 42))
            .await
            .unwrap();
        let queue_id = p
            .get_item_by_content("AsyncJob", job_id)
            .await
            .unwrap()
            .unwrap()
            .queue_id;

        let now = Utc::now();
        assert!(p.claim_next_item(queue_id, 1, now).await.unwrap().is_some());
        assert!(store.mark_owned(job_id, 1).await.unwrap());

        // Node 1 looked dead: its job is requeued and node 2 picks it up.
        let later = now + chrono::Duration::seconds(1);
        assert_eq!(p.requeue_stale_jobs(1, later, later).await.unwrap(), vec![job_id]);
        p.reset_items_claimed_by(1).await.unwrap();
        assert!(p.claim_next_item(queue_id, 2, later).await.unwrap().is_some());
        assert!(store.mark_owned(job_id, 2).await.unwrap());

        let late = JobStatusChange::succeeded(Some("{}".to_string())).owned_by(1);
        assert_eq!(
            store.update_status(job_id, late, 1).await.unwrap(),
            StatusUpdate::Rejected
        );
        let item = p
            .get_item_by_content("AsyncJob", job_id)
            .await
            .unwrap()
            .expect("item must stay while node 2 runs the job");
        assert_eq!(item.last_process_msid, Some(2));
        assert_eq!(
            store.query_status(job_id).await.unwrap().job_status(),
            JobStatus::InProgress
        );

        let done = JobStatusChange::succeeded(Some("{}".to_string())).owned_by(2);
        assert_eq!(
            store.update_status(job_id, done, 2).await.unwrap(),
            StatusUpdate::Applied
        );
        assert!(p.get_item_by_content("AsyncJob", job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_joiner_cannot_finish_with_pending_joins() {
        let (_, store, _) = store().await;
        let joiner = store.submit(SubmitJob::new("VmWorkStart")).await.unwrap();
        let joinee = store.submit(SubmitJob::new("VmWorkStart")).await.unwrap();
        store.joins.add_join(joiner, joinee, 1).await.unwrap();
        assert!(store.mark_owned(joiner, 1).await.unwrap());

        let done = JobStatusChange::succeeded(None).owned_by(1);
        assert_eq!(
            store.update_status(joiner, done.clone(), 1).await.unwrap(),
            StatusUpdate::JoinsPending
        );
        assert_eq!(
            store.query_status(joiner).await.unwrap().job_status(),
            JobStatus::InProgress
        );

        store
            .update_status(joinee, JobStatusChange::succeeded(None), 1)
            .await
            .unwrap();
        assert_eq!(
            store.update_status(joiner, done, 1).await.unwrap(),
            StatusUpdate::Applied
        );
    }

    #[tokio::test]
    async fn test_poll_and_cancel() {
        let (_, store, _) = store().await;
        let job_id = store.submit(SubmitJob::new("VmWorkStart")).await.unwrap();

        store.record_poll(job_id).await.unwrap();
        assert!(store.query_status(job_id).await.unwrap().last_polled.is_some());
        assert!(matches!(
            store.record_poll(404).await,
            Err(CoreError::JobNotFound { job_id: 404 })
        ));

        assert!(!store.is_cancel_requested(job_id).await.unwrap());
        assert!(store.request_cancel(job_id).await.unwrap());
        assert!(store.is_cancel_requested(job_id).await.unwrap());

        store
            .update_status(job_id, JobStatusChange::succeeded(None), 1)
            .await
            .unwrap();
        assert!(!store.request_cancel(job_id).await.unwrap());
        assert!(store.request_cancel(404).await.is_err());
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job dispatcher.
//!
//! Each cycle claims the heads of claimable sync queues (at most one per
//! free worker permit), marks their jobs as owned by this node and runs the
//! bound handler on the worker pool. Handler results are written back
//! through the job store; a panicking handler fails its job and nothing
//! else.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;
use crate::handler::{HandlerError, HandlerRegistry, JobContext, JobOutcome};
use crate::job::{ASYNC_JOB_CONTENT, JobStatus, JobStatusChange, JoinStatus, StatusUpdate, SyncKey};
use crate::job_store::JobStore;
use crate::join_map::JoinMap;
use crate::persistence::{AsyncJobRecord, SyncQueueItemRecord};
use crate::sync_queue::SyncQueue;

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Worker pool size.
    pub max_concurrent_jobs: usize,
    /// Tick when no wake signal arrives.
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 16,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// What one dispatch cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Queue items claimed.
    pub claimed: usize,
    /// Handlers started.
    pub started: usize,
    /// Items released because their job was gone, finished or unknown.
    pub released: usize,
    /// Items kept for jobs still parked on joins.
    pub reparked: usize,
}

/// Claims queue heads and runs their handlers.
pub struct JobDispatcher {
    msid: i64,
    store: Arc<JobStore>,
    queue: Arc<SyncQueue>,
    joins: Arc<JoinMap>,
    registry: Arc<HandlerRegistry>,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    wake: Arc<Notify>,
    shutdown: Arc<Notify>,
    config: DispatcherConfig,
}

impl JobDispatcher {
    /// Create a dispatcher for node `msid`.
    pub fn new(
        msid: i64,
        store: Arc<JobStore>,
        queue: Arc<SyncQueue>,
        joins: Arc<JoinMap>,
        registry: Arc<HandlerRegistry>,
        wake: Arc<Notify>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            msid,
            store,
            queue,
            joins,
            registry,
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            tasks: Mutex::new(JoinSet::new()),
            wake,
            shutdown: Arc::new(Notify::new()),
            config,
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Number of handlers currently running.
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrent_jobs - self.permits.available_permits()
    }

    /// Run the dispatch loop until shutdown, then drain running handlers.
    pub async fn run(self: Arc<Self>) {
        info!(
            msid = self.msid,
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Job dispatcher started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Job dispatcher received shutdown signal");
                    break;
                }

                _ = self.wake.notified() => {}

                _ = interval.tick() => {}
            }

            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "Dispatch cycle failed");
            }
        }

        self.wait_idle().await;
        info!("Job dispatcher stopped");
    }

    /// Claim and start as much work as there are free workers.
    #[instrument(skip(self), fields(msid = self.msid))]
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        {
            let mut tasks = self.tasks.lock().await;
            while tasks.try_join_next().is_some() {}
        }

        let free = self.permits.available_permits();
        if free == 0 {
            return Ok(report);
        }

        let items = self.queue.claim_from_any(self.msid, free).await?;
        for item in items {
            report.claimed += 1;
            let item_id = item.id;
            if let Err(e) = self.dispatch_item(item, &mut report).await {
                // Hand the item back so the queue does not stay blocked.
                error!(item_id, error = %e, "Failed to dispatch queue item");
                if let Err(e) = self.queue.return_item(item_id).await {
                    error!(item_id, error = %e, "Failed to return queue item");
                }
            }
        }

        if report.claimed > 0 {
            debug!(
                claimed = report.claimed,
                started = report.started,
                released = report.released,
                reparked = report.reparked,
                "Dispatch cycle complete"
            );
        }
        Ok(report)
    }

    async fn dispatch_item(&self, item: SyncQueueItemRecord, report: &mut CycleReport) -> Result<()> {
        if item.content_type != ASYNC_JOB_CONTENT {
            warn!(item_id = item.id, content_type = %item.content_type, "Releasing item with unknown content");
            self.queue.release(item.id).await?;
            report.released += 1;
            return Ok(());
        }

        let job = match self.store.find(item.content_id).await? {
            Some(job) if job.removed.is_none() => job,
            _ => {
                warn!(item_id = item.id, job_id = item.content_id, "Releasing orphaned queue item");
                self.queue.release(item.id).await?;
                report.released += 1;
                return Ok(());
            }
        };

        match job.job_status() {
            JobStatus::Succeeded | JobStatus::Failed => {
                debug!(job_id = job.id, "Releasing item of finished job");
                self.queue.release(item.id).await?;
                report.released += 1;
            }
            JobStatus::InProgress => {
                // Item was reset under a job that is still running; holding it
                // keeps the resource serialized until that job finishes.
                warn!(job_id = job.id, owner = ?job.init_msid, "Claimed item of a running job");
            }
            JobStatus::Queued if job.waiting_on_join => {
                report.reparked += 1;
                debug!(job_id = job.id, "Job still parked on joins");
                self.joins.wake_if_ready(job.id).await?;
            }
            JobStatus::Queued => {
                let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                    self.queue.return_item(item.id).await?;
                    return Ok(());
                };
                if !self.store.mark_owned(job.id, self.msid).await? {
                    debug!(job_id = job.id, "Lost ownership race, returning item");
                    self.queue.return_item(item.id).await?;
                    return Ok(());
                }
                self.spawn_job(job, permit).await?;
                report.started += 1;
            }
        }
        Ok(())
    }

    async fn spawn_job(&self, job: AsyncJobRecord, permit: OwnedSemaphorePermit) -> Result<()> {
        let Some(handler) = self.registry.get(&job.cmd) else {
            let err = HandlerError::internal(format!("no handler registered for {}", job.cmd));
            self.store
                .update_status(
                    job.id,
                    JobStatusChange::failed(err.code, Some(err.to_result_json())).owned_by(self.msid),
                    self.msid,
                )
                .await?;
            return Ok(());
        };

        let ctx = JobContext::new(job.id, self.msid, self.store.clone(), self.joins.clone());
        let finisher = Finisher {
            msid: self.msid,
            store: self.store.clone(),
            joins: self.joins.clone(),
            wake: self.wake.clone(),
        };

        info!(job_id = job.id, cmd = %job.cmd, "Starting job");
        self.tasks.lock().await.spawn(async move {
            let _permit = permit;
            let job_id = job.id;
            let run = tokio::spawn(async move { handler.execute(&ctx, &job).await }).await;
            let outcome = run.unwrap_or_else(|e| {
                Err(HandlerError::internal(format!("handler panicked: {}", e)))
            });
            finisher.finish(job_id, outcome).await;
        });
        Ok(())
    }

    /// Wait until every running handler has finished.
    pub async fn wait_idle(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Job task failed");
            }
        }
    }
}

/// Writes a handler's outcome back.
struct Finisher {
    msid: i64,
    store: Arc<JobStore>,
    joins: Arc<JoinMap>,
    wake: Arc<Notify>,
}

impl Finisher {
    async fn finish(&self, job_id: i64, outcome: std::result::Result<JobOutcome, HandlerError>) {
        if let Err(e) = self.apply(job_id, outcome).await {
            // Left IN_PROGRESS; recovery requeues it if this node dies.
            error!(job_id, error = %e, "Failed to record job outcome");
        }
        // Next item on the same resource may now be claimable.
        self.wake.notify_one();
    }

    async fn apply(
        &self,
        job_id: i64,
        outcome: std::result::Result<JobOutcome, HandlerError>,
    ) -> Result<()> {
        match outcome {
            Ok(JobOutcome::Completed(value)) => {
                self.record(job_id, JobStatusChange::succeeded(Some(value.to_string())))
                    .await?;
            }
            Ok(JobOutcome::Waiting { exclusive }) => {
                let exclusive = exclusive && !self.waits_on_own_queue(job_id).await?;
                self.park(job_id, exclusive).await?;
            }
            Err(err) => {
                warn!(job_id, code = err.code, error = %err.message, "Job failed");
                self.record(
                    job_id,
                    JobStatusChange::failed(err.code, Some(err.to_result_json())),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Write a terminal outcome. A job that still has pending joins is
    /// parked instead and runs again once they resolve.
    async fn record(&self, job_id: i64, change: JobStatusChange) -> Result<()> {
        let update = self
            .store
            .update_status(job_id, change.owned_by(self.msid), self.msid)
            .await?;
        if update == StatusUpdate::JoinsPending {
            warn!(job_id, "Handler finished with pending joins, parking until they resolve");
            self.park(job_id, false).await?;
        }
        Ok(())
    }

    async fn park(&self, job_id: i64, exclusive: bool) -> Result<()> {
        if self.store.park(job_id, exclusive).await? {
            debug!(job_id, exclusive, "Job parked on joins");
            // A joinee that finished while the handler ran could not
            // wake a job that was not parked yet.
            self.joins.wake_if_ready(job_id).await?;
        }
        Ok(())
    }

    /// Whether a pending joinee sits in the joiner's own sync queue, where
    /// it could never be claimed past a held item.
    async fn waits_on_own_queue(&self, job_id: i64) -> Result<bool> {
        let Some(job) = self.store.find(job_id).await? else {
            return Ok(false);
        };
        let key = SyncKey::for_job(&job);
        for join in self.joins.joins(job_id).await? {
            if join.join_status != JoinStatus::Pending.as_str() {
                continue;
            }
            if let Some(joinee) = self.store.find(join.join_job_id).await?
                && SyncKey::for_job(&joinee) == key
            {
                warn!(
                    job_id,
                    join_job_id = joinee.id,
                    "Joinee shares the joiner's queue, waiting without holding it"
                );
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Crash recovery.
//!
//! Work is at-least-once: a node that dies mid-job leaves an IN_PROGRESS job
//! and a claimed queue item behind. The monitor finds nodes whose heartbeat
//! went silent, requeues their stale jobs and resets their claims so another
//! node picks the work up.
//!
//! The sweep also repairs the two windows between a status transaction and
//! the join bookkeeping that follows it:
//! - pending joins whose joinee already finished (or vanished), and
//! - parked joiners with nothing left to wait for.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{CoreError, Result};
use crate::handler::HandlerError;
use crate::job::{JobStatusChange, JoinStatus, StatusUpdate};
use crate::job_store::JobStore;
use crate::join_map::JoinMap;
use crate::persistence::Persistence;

const SWEEP_BATCH: i64 = 100;

/// Configuration for the recovery monitor.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// How often to sweep.
    pub poll_interval: Duration,
    /// Heartbeat age after which a node is dead.
    pub node_timeout: Duration,
    /// `last_updated` age after which a dead node's job is requeued.
    pub job_stale_after: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            node_timeout: Duration::from_secs(60),
            job_stale_after: Duration::from_secs(120),
        }
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Nodes newly marked down.
    pub nodes_down: Vec<i64>,
    /// Jobs put back to QUEUED.
    pub jobs_requeued: Vec<i64>,
    /// Queue items returned to waiting.
    pub items_reset: u64,
    /// Pending joins resolved by the sweep.
    pub joins_repaired: u64,
    /// Joiners failed because a joinee vanished.
    pub joiners_failed: Vec<i64>,
    /// Parked joiners re-queued.
    pub jobs_woken: Vec<i64>,
}

/// Background worker that recovers work from dead nodes.
pub struct RecoveryMonitor {
    msid: i64,
    persistence: Arc<dyn Persistence>,
    store: Arc<JobStore>,
    joins: Arc<JoinMap>,
    wake: Arc<Notify>,
    config: RecoveryConfig,
    shutdown: Arc<Notify>,
}

impl RecoveryMonitor {
    /// Create a monitor running on node `msid`.
    pub fn new(
        msid: i64,
        persistence: Arc<dyn Persistence>,
        store: Arc<JobStore>,
        joins: Arc<JoinMap>,
        wake: Arc<Notify>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            msid,
            persistence,
            store,
            joins,
            wake,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Take back everything a previous life of this node left behind.
    ///
    /// Must run before this node's dispatcher starts: every IN_PROGRESS job
    /// owned by this msid is requeued regardless of age.
    pub async fn recover_self(&self) -> Result<RecoveryReport> {
        let now = Utc::now();
        let mut report = RecoveryReport {
            jobs_requeued: self
                .persistence
                .requeue_stale_jobs(self.msid, now, now)
                .await?,
            ..Default::default()
        };
        report.items_reset = self.persistence.reset_items_claimed_by(self.msid).await?;

        if !report.jobs_requeued.is_empty() || report.items_reset > 0 {
            warn!(
                msid = self.msid,
                jobs = ?report.jobs_requeued,
                items_reset = report.items_reset,
                "Recovered work left by a previous run of this node"
            );
            self.wake.notify_one();
        }
        Ok(report)
    }

    /// One recovery pass.
    pub async fn sweep(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        self.recover_dead_nodes(&mut report).await?;
        self.repair_orphaned_joins(&mut report).await?;

        for job_id in self.persistence.list_wakeable_jobs(SWEEP_BATCH).await? {
            if self.joins.try_wake(job_id).await? {
                report.jobs_woken.push(job_id);
            }
        }
        if !report.jobs_woken.is_empty() {
            warn!(jobs = ?report.jobs_woken, "Woke joiners that missed their wake-up");
        }

        if !report.jobs_requeued.is_empty() || report.items_reset > 0 {
            self.wake.notify_one();
        }
        Ok(report)
    }

    async fn recover_dead_nodes(&self, report: &mut RecoveryReport) -> Result<()> {
        let now = Utc::now();
        let cutoff = now - to_chrono(self.config.node_timeout, "node_timeout")?;
        let stale_before = now - to_chrono(self.config.job_stale_after, "job_stale_after")?;

        for node in self.persistence.list_silent_nodes(cutoff).await? {
            if node.msid == self.msid {
                continue;
            }

            if self.persistence.mark_node_down(node.msid, cutoff).await? {
                warn!(
                    msid = node.msid,
                    name = %node.name,
                    last_heartbeat = %node.last_heartbeat,
                    "Node stopped heartbeating, marked down"
                );
                report.nodes_down.push(node.msid);
            }

            let requeued = self
                .persistence
                .requeue_stale_jobs(node.msid, stale_before, now)
                .await?;
            let reset = self.persistence.reset_items_claimed_by(node.msid).await?;
            if !requeued.is_empty() || reset > 0 {
                warn!(
                    msid = node.msid,
                    jobs = ?requeued,
                    items_reset = reset,
                    "Requeued work of dead node; jobs will run again"
                );
            }
            report.jobs_requeued.extend(requeued);
            report.items_reset += reset;
        }
        Ok(())
    }

    async fn repair_orphaned_joins(&self, report: &mut RecoveryReport) -> Result<()> {
        for join in self.persistence.list_orphaned_joins(SWEEP_BATCH).await? {
            let joinee = self
                .persistence
                .get_job(join.join_job_id)
                .await?
                .filter(|j| j.removed.is_none());

            match joinee {
                Some(joinee) if joinee.is_terminal() => {
                    debug!(
                        job_id = join.job_id,
                        join_job_id = join.join_job_id,
                        "Resolving join missed at completion"
                    );
                    self.joins
                        .on_job_complete(
                            joinee.id,
                            joinee.job_status(),
                            joinee.result.as_deref(),
                            self.msid,
                        )
                        .await?;
                    report.joins_repaired += 1;
                }
                Some(_) => {
                    // Joinee went back to running between the two reads.
                }
                None => {
                    let err = CoreError::JoinInconsistency {
                        job_id: join.job_id,
                        join_job_id: join.join_job_id,
                        reason: "joinee is missing or removed".to_string(),
                    };
                    error!(error = %err, "Failing joiner of a vanished job");

                    let body = HandlerError::internal(err.to_string()).to_result_json();
                    self.persistence
                        .resolve_join(join.id, JoinStatus::Failed, Some(&body), self.msid, Utc::now())
                        .await?;
                    report.joins_repaired += 1;

                    let update = self
                        .store
                        .update_status(
                            join.job_id,
                            JobStatusChange::failed(HandlerError::INTERNAL_ERROR, Some(body)),
                            self.msid,
                        )
                        .await?;
                    match update {
                        StatusUpdate::Applied => report.joiners_failed.push(join.job_id),
                        // Woken once its other joins resolve; it sees the failed edge then.
                        StatusUpdate::JoinsPending => warn!(
                            job_id = join.job_id,
                            "Joiner still has pending joins, failure left to its next run"
                        ),
                        StatusUpdate::Unchanged | StatusUpdate::Rejected => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Run: recover this node, then sweep until shutdown.
    pub async fn run(&self) {
        info!(
            msid = self.msid,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            node_timeout_secs = self.config.node_timeout.as_secs(),
            "Recovery monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Recovery monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Recovery sweep failed");
                    }
                }
            }
        }

        info!("Recovery monitor stopped");
    }
}

fn to_chrono(duration: Duration, field: &str) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration).map_err(|e| CoreError::validation(field, e.to_string()))
}

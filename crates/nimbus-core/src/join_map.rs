// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wait-for edges between jobs.
//!
//! A joiner parks (returns `Waiting` from its handler) until every joinee
//! has reached a terminal state. Only AND-joins exist: the joiner is woken
//! once no pending edge is left, whether the joinees succeeded or failed.
//!
//! Waking is a compare-and-set on the joiner's `waiting_on_join` flag, so
//! when several joinees finish at the same time exactly one of them
//! re-queues the joiner.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, info, instrument};

use crate::error::{CoreError, Result};
use crate::job::{JobStatus, JoinStatus};
use crate::persistence::{JoinRecord, Persistence};

/// Join map operations.
pub struct JoinMap {
    persistence: Arc<dyn Persistence>,
    wake: Arc<Notify>,
}

impl JoinMap {
    /// Create a join map. `wake` is signalled whenever a joiner is re-queued.
    pub fn new(persistence: Arc<dyn Persistence>, wake: Arc<Notify>) -> Self {
        Self { persistence, wake }
    }

    /// Make `job_id` wait for `join_job_id`.
    ///
    /// Self-joins and direct two-job cycles are rejected. Joining a job that
    /// has already finished records an edge that is resolved from the start.
    #[instrument(skip(self))]
    pub async fn add_join(&self, job_id: i64, join_job_id: i64, msid: i64) -> Result<i64> {
        if job_id == join_job_id {
            return Err(CoreError::JoinInconsistency {
                job_id,
                join_job_id,
                reason: "a job cannot join itself".to_string(),
            });
        }

        let joiner = self
            .persistence
            .get_job(job_id)
            .await?
            .filter(|j| j.removed.is_none())
            .ok_or(CoreError::JobNotFound { job_id })?;
        if joiner.is_terminal() {
            return Err(CoreError::InvalidJobState {
                job_id,
                expected: "queued or in_progress".to_string(),
                actual: joiner.status,
            });
        }

        let joinee = self
            .persistence
            .get_job(join_job_id)
            .await?
            .filter(|j| j.removed.is_none())
            .ok_or(CoreError::JobNotFound {
                job_id: join_job_id,
            })?;

        if self.persistence.get_join(join_job_id, job_id).await?.is_some() {
            return Err(CoreError::JoinInconsistency {
                job_id,
                join_job_id,
                reason: "the joinee already waits for this job".to_string(),
            });
        }

        let now = Utc::now();
        if let Some(status) = JoinStatus::from_terminal(joinee.job_status()) {
            let row = self
                .persistence
                .insert_join(job_id, join_job_id, status, joinee.result.as_deref(), msid, now)
                .await?;
            debug!(join_id = row.id, "Joined an already finished job");
            return Ok(row.id);
        }

        let row = self
            .persistence
            .insert_join(job_id, join_job_id, JoinStatus::Pending, None, msid, now)
            .await?;

        // The joinee may have finished between the read above and the insert;
        // its completion would not have seen this edge.
        if let Some(current) = self.persistence.get_job(join_job_id).await?
            && let Some(status) = JoinStatus::from_terminal(current.job_status())
        {
            self.persistence
                .resolve_join(row.id, status, current.result.as_deref(), msid, Utc::now())
                .await?;
        }

        debug!(join_id = row.id, "Join recorded");
        Ok(row.id)
    }

    /// Resolve every pending edge pointing at a finished job and wake the
    /// joiners that have nothing left to wait for.
    ///
    /// Returns the joiners this call woke.
    #[instrument(skip(self, result))]
    pub async fn on_job_complete(
        &self,
        join_job_id: i64,
        status: JobStatus,
        result: Option<&str>,
        msid: i64,
    ) -> Result<Vec<i64>> {
        let Some(join_status) = JoinStatus::from_terminal(status) else {
            return Ok(Vec::new());
        };

        let resolved = self
            .persistence
            .resolve_joins(join_job_id, join_status, result, msid, Utc::now())
            .await?;
        if resolved > 0 {
            debug!(resolved, "Resolved join edges");
        }

        let mut woken = Vec::new();
        for joiner in self.persistence.list_joiners(join_job_id).await? {
            if self.wake_if_ready(joiner).await? {
                woken.push(joiner);
            }
        }
        Ok(woken)
    }

    /// True iff the job has no pending edges.
    pub async fn is_fully_joined(&self, job_id: i64) -> Result<bool> {
        Ok(self.persistence.count_pending_joins(job_id).await? == 0)
    }

    /// All edges of a joiner, for handlers inspecting joinee outcomes.
    pub async fn joins(&self, job_id: i64) -> Result<Vec<JoinRecord>> {
        self.persistence.list_joins(job_id).await
    }

    /// Wake a parked job if it is fully joined.
    pub async fn wake_if_ready(&self, job_id: i64) -> Result<bool> {
        if !self.is_fully_joined(job_id).await? {
            return Ok(false);
        }
        self.try_wake(job_id).await
    }

    /// Re-queue a parked job. Only one concurrent caller gets `true`.
    pub async fn try_wake(&self, job_id: i64) -> Result<bool> {
        let woke = self.persistence.wake_job(job_id, Utc::now()).await?;
        if woke {
            info!(job_id, "Joiner woken");
            self.wake.notify_one();
        }
        Ok(woke)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatusChange, SubmitJob};
    use crate::persistence::SqlitePersistence;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> (Arc<dyn Persistence>, JoinMap) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        crate::migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");
        let persistence: Arc<dyn Persistence> = Arc::new(SqlitePersistence::new(pool));
        let joins = JoinMap::new(persistence.clone(), Arc::new(Notify::new()));
        (persistence, joins)
    }

    async fn job(p: &Arc<dyn Persistence>) -> i64 {
        p.create_job(&SubmitJob::new("Test"), Utc::now())
            .await
            .unwrap()
            .0
            .id
    }

    async fn park(p: &Arc<dyn Persistence>, job_id: i64) {
        assert!(p.mark_job_in_progress(job_id, 1, Utc::now()).await.unwrap());
        assert!(p.park_job(job_id, false, Utc::now()).await.unwrap());
    }

    async fn finish(p: &Arc<dyn Persistence>, joins: &JoinMap, job_id: i64, ok: bool) -> Vec<i64> {
        let change = if ok {
            JobStatusChange::succeeded(Some("{}".to_string()))
        } else {
            JobStatusChange::failed(530, Some("{}".to_string()))
        };
        let status = change.status;
        p.update_job_status(job_id, &change, 1, Utc::now())
            .await
            .unwrap();
        joins
            .on_job_complete(job_id, status, Some("{}"), 1)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_rejects_self_join_and_cycles() {
        let (p, joins) = setup().await;
        let a = job(&p).await;
        let b = job(&p).await;

        assert!(matches!(
            joins.add_join(a, a, 1).await,
            Err(CoreError::JoinInconsistency { .. })
        ));

        joins.add_join(a, b, 1).await.unwrap();
        assert!(matches!(
            joins.add_join(b, a, 1).await,
            Err(CoreError::JoinInconsistency { .. })
        ));

        assert!(matches!(
            joins.add_join(a, 999, 1).await,
            Err(CoreError::JobNotFound { job_id: 999 })
        ));
    }

    #[tokio::test]
    async fn test_join_already_finished_job_is_resolved() {
        let (p, joins) = setup().await;
        let a = job(&p).await;
        let b = job(&p).await;
        finish(&p, &joins, b, false).await;

        joins.add_join(a, b, 1).await.unwrap();
        assert!(joins.is_fully_joined(a).await.unwrap());

        let edges = joins.joins(a).await.unwrap();
        assert_eq!(edges[0].status(), JoinStatus::Failed);
    }

    #[tokio::test]
    async fn test_terminal_joiner_cannot_join() {
        let (p, joins) = setup().await;
        let a = job(&p).await;
        let b = job(&p).await;
        finish(&p, &joins, a, true).await;

        assert!(matches!(
            joins.add_join(a, b, 1).await,
            Err(CoreError::InvalidJobState { .. })
        ));
    }

    #[tokio::test]
    async fn test_and_join_wakes_after_last_joinee_in_any_order() {
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        for order in orders {
            let (p, joins) = setup().await;
            let joiner = job(&p).await;
            let joinees = [job(&p).await, job(&p).await, job(&p).await];
            for joinee in joinees {
                joins.add_join(joiner, joinee, 1).await.unwrap();
            }
            park(&p, joiner).await;

            for (step, idx) in order.iter().enumerate() {
                // The middle joinee fails; the joiner still wakes.
                let woken = finish(&p, &joins, joinees[*idx], *idx != 1).await;
                if step < 2 {
                    assert!(woken.is_empty(), "woke early for order {:?}", order);
                    assert!(p.get_job(joiner).await.unwrap().unwrap().waiting_on_join);
                } else {
                    assert_eq!(woken, vec![joiner], "order {:?}", order);
                }
            }

            let stored = p.get_job(joiner).await.unwrap().unwrap();
            assert!(!stored.waiting_on_join);
            assert_eq!(stored.job_status(), JobStatus::Queued);
            assert!(
                p.get_item_by_content("AsyncJob", joiner)
                    .await
                    .unwrap()
                    .is_some()
            );
        }
    }

    #[tokio::test]
    async fn test_wake_is_single_winner() {
        let (p, joins) = setup().await;
        let joiner = job(&p).await;
        park(&p, joiner).await;

        assert!(joins.try_wake(joiner).await.unwrap());
        assert!(!joins.try_wake(joiner).await.unwrap());
        assert!(!joins.wake_if_ready(joiner).await.unwrap());
    }

    #[tokio::test]
    async fn test_non_terminal_completion_is_ignored() {
        let (p, joins) = setup().await;
        let a = job(&p).await;
        let b = job(&p).await;
        joins.add_join(a, b, 1).await.unwrap();

        let woken = joins
            .on_job_complete(b, JobStatus::InProgress, None, 1)
            .await
            .unwrap();
        assert!(woken.is_empty());
        assert!(!joins.is_fully_joined(a).await.unwrap());
    }
}

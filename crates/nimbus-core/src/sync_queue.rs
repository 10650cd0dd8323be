// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-resource FIFO mutual-exclusion queues.
//!
//! A queue is keyed by `(object type, object id)`. At most one item of a
//! queue is active at any time; the next waiting item becomes claimable
//! once the active one is released. Claims are made with a compare-and-set
//! on the queue's `last_process_number`, so concurrent nodes never both win.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument};

use crate::error::{CoreError, Result};
use crate::persistence::{Persistence, SyncQueueItemRecord};

/// Sync queue operations over a persistence backend.
pub struct SyncQueue {
    persistence: Arc<dyn Persistence>,
}

impl SyncQueue {
    /// Create a queue service.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Append content to the queue of `(object_type, object_id)`.
    ///
    /// The queue is created on first use. Enqueueing content that is already
    /// queued returns the existing item id.
    #[instrument(skip(self))]
    pub async fn enqueue(
        &self,
        object_type: &str,
        object_id: i64,
        content_type: &str,
        content_id: i64,
    ) -> Result<i64> {
        let item = self
            .persistence
            .enqueue_item(object_type, object_id, content_type, content_id, Utc::now())
            .await?;
        debug!(item_id = item.id, queue_id = item.queue_id, "Content enqueued");
        Ok(item.id)
    }

    /// Claim the oldest waiting item of a queue if nothing else is active.
    ///
    /// `None` means the queue is empty, busy, or another node won the race.
    #[instrument(skip(self))]
    pub async fn try_claim_next(
        &self,
        object_type: &str,
        object_id: i64,
        msid: i64,
    ) -> Result<Option<SyncQueueItemRecord>> {
        let Some(queue) = self.persistence.get_queue(object_type, object_id).await? else {
            return Ok(None);
        };
        self.persistence
            .claim_next_item(queue.id, msid, Utc::now())
            .await
    }

    /// Claim heads across claimable queues, at most `limit` of them.
    ///
    /// Queues are visited oldest head first; lost races are skipped.
    pub async fn claim_from_any(&self, msid: i64, limit: usize) -> Result<Vec<SyncQueueItemRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let queues = self.persistence.list_claimable_queues(limit as i64).await?;
        let mut claimed = Vec::with_capacity(queues.len());
        for queue in queues {
            if let Some(item) = self
                .persistence
                .claim_next_item(queue.id, msid, Utc::now())
                .await?
            {
                claimed.push(item);
            }
        }
        Ok(claimed)
    }

    /// Delete an item, letting the next one in its queue be claimed.
    #[instrument(skip(self))]
    pub async fn release(&self, item_id: i64) -> Result<()> {
        if self.persistence.delete_queue_item(item_id).await? {
            Ok(())
        } else {
            Err(CoreError::QueueItemNotFound { item_id })
        }
    }

    /// Put a claimed item back to waiting without losing its position.
    pub async fn return_item(&self, item_id: i64) -> Result<bool> {
        self.persistence.return_queue_item(item_id).await
    }

    /// Return every item held by `msid` whose job is not running there.
    pub async fn reset_items_owned_by(&self, msid: i64) -> Result<u64> {
        self.persistence.reset_items_claimed_by(msid).await
    }

    /// Items currently claimed by a node.
    pub async fn active_items(&self, msid: i64) -> Result<Vec<SyncQueueItemRecord>> {
        self.persistence.list_items_claimed_by(msid).await
    }

    /// Items of one queue in FIFO order (empty if the queue does not exist).
    pub async fn queue_items(
        &self,
        object_type: &str,
        object_id: i64,
    ) -> Result<Vec<SyncQueueItemRecord>> {
        match self.persistence.get_queue(object_type, object_id).await? {
            Some(queue) => self.persistence.list_queue_items(queue.id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Delete queues that have no items and have been idle for `idle_for`.
    pub async fn purge_empty_queues(&self, idle_for: Duration) -> Result<u64> {
        let idle = chrono::Duration::from_std(idle_for)
            .map_err(|e| CoreError::validation("idle_for", e.to_string()))?;
        self.persistence.purge_empty_queues(Utc::now() - idle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn queue() -> SyncQueue {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        crate::migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");
        SyncQueue::new(Arc::new(SqlitePersistence::new(pool)))
    }

    #[tokio::test]
    async fn test_enqueue_returns_existing_item() {
        let q = queue().await;
        let first = q.enqueue("VirtualMachine", 42, "AsyncJob", 1).await.unwrap();
        let again = q.enqueue("VirtualMachine", 42, "AsyncJob", 1).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(q.queue_items("VirtualMachine", 42).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_try_claim_unknown_queue() {
        let q = queue().await;
        assert!(q.try_claim_next("VirtualMachine", 1, 1).await.unwrap().is_none());
        assert!(q.queue_items("VirtualMachine", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_release_fifo() {
        let q = queue().await;
        let a = q.enqueue("VirtualMachine", 42, "AsyncJob", 1).await.unwrap();
        let b = q.enqueue("VirtualMachine", 42, "AsyncJob", 2).await.unwrap();
        let c = q.enqueue("VirtualMachine", 42, "AsyncJob", 3).await.unwrap();

        let mut order = Vec::new();
        for msid in [1, 2, 3] {
            let item = q
                .try_claim_next("VirtualMachine", 42, msid)
                .await
                .unwrap()
                .unwrap();
            assert!(q.try_claim_next("VirtualMachine", 42, msid).await.unwrap().is_none());
            order.push(item.id);
            q.release(item.id).await.unwrap();
        }

        assert_eq!(order, vec![a, b, c]);
        assert!(matches!(
            q.release(a).await,
            Err(CoreError::QueueItemNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_claim_from_any_takes_one_per_queue() {
        let q = queue().await;
        q.enqueue("VirtualMachine", 1, "AsyncJob", 1).await.unwrap();
        q.enqueue("VirtualMachine", 1, "AsyncJob", 2).await.unwrap();
        q.enqueue("VirtualMachine", 2, "AsyncJob", 3).await.unwrap();
        q.enqueue("Volume", 1, "AsyncJob", 4).await.unwrap();

        let claimed = q.claim_from_any(9, 10).await.unwrap();
        let contents: Vec<i64> = claimed.iter().map(|i| i.content_id).collect();
        assert_eq!(contents, vec![1, 3, 4]);
        assert_eq!(q.active_items(9).await.unwrap().len(), 3);

        // Everything claimable is taken.
        assert!(q.claim_from_any(9, 10).await.unwrap().is_empty());
        assert!(q.claim_from_any(9, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_return_and_reset() {
        let q = queue().await;
        q.enqueue("VirtualMachine", 1, "AsyncJob", 1).await.unwrap();
        q.enqueue("VirtualMachine", 2, "AsyncJob", 2).await.unwrap();

        let claimed = q.claim_from_any(5, 10).await.unwrap();
        assert_eq!(claimed.len(), 2);

        assert!(q.return_item(claimed[0].id).await.unwrap());
        assert_eq!(q.reset_items_owned_by(5).await.unwrap(), 1);
        assert!(q.active_items(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_empty_queues() {
        let q = queue().await;
        let item = q.enqueue("VirtualMachine", 1, "AsyncJob", 1).await.unwrap();
        q.release(item).await.unwrap();

        // Freshly touched queues are kept.
        assert_eq!(q.purge_empty_queues(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(q.purge_empty_queues(Duration::ZERO).await.unwrap(), 1);
    }
}

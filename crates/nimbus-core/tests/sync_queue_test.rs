// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cross-node tests for sync queue mutual exclusion and ordering.

mod common;

use std::sync::Arc;

use futures::future::join_all;
use nimbus_core::sync_queue::SyncQueue;

const NODES: i64 = 6;

async fn nodes(db: &common::SharedDb) -> Vec<Arc<SyncQueue>> {
    let mut queues = Vec::new();
    for _ in 0..NODES {
        queues.push(Arc::new(SyncQueue::new(db.node().await)));
    }
    queues
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_one_claimer_wins_each_round() {
    let db = common::SharedDb::new();
    let queues = nodes(&db).await;

    let mut expected = Vec::new();
    for content_id in 1..=5 {
        queues[0]
            .enqueue("VirtualMachine", 42, "AsyncJob", content_id)
            .await
            .unwrap();
        expected.push(content_id);
    }

    let mut served = Vec::new();
    for round in 0..5 {
        let attempts = queues.iter().enumerate().map(|(i, q)| {
            let q = q.clone();
            async move { q.try_claim_next("VirtualMachine", 42, i as i64 + 1).await }
        });
        let results = join_all(attempts).await;

        let winners: Vec<_> = results
            .into_iter()
            .map(|r| r.expect("claim must not error"))
            .flatten()
            .collect();
        assert_eq!(winners.len(), 1, "round {} had {} winners", round, winners.len());

        let item = &winners[0];
        // Nobody else can claim while the winner holds the item.
        for (i, q) in queues.iter().enumerate() {
            assert!(
                q.try_claim_next("VirtualMachine", 42, i as i64 + 1)
                    .await
                    .unwrap()
                    .is_none()
            );
        }

        served.push(item.content_id);
        queues[0].release(item.id).await.unwrap();
    }

    assert_eq!(served, expected, "items must be served in FIFO order");
    assert!(queues[0].queue_items("VirtualMachine", 42).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_claim_from_any_never_double_claims() {
    let db = common::SharedDb::new();
    let queues = nodes(&db).await;

    for vm in 1..=10 {
        queues[0].enqueue("VirtualMachine", vm, "AsyncJob", vm).await.unwrap();
        queues[0]
            .enqueue("VirtualMachine", vm, "AsyncJob", 100 + vm)
            .await
            .unwrap();
    }

    let claims = queues.iter().enumerate().map(|(i, q)| {
        let q = q.clone();
        async move { q.claim_from_any(i as i64 + 1, 10).await }
    });
    let claimed: Vec<_> = join_all(claims)
        .await
        .into_iter()
        .flat_map(|r| r.expect("claim must not error"))
        .collect();

    // One head per VM, each claimed exactly once, second items untouched.
    let mut contents: Vec<i64> = claimed.iter().map(|i| i.content_id).collect();
    contents.sort_unstable();
    assert_eq!(contents, (1..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_independent_keys_do_not_block_each_other() {
    let db = common::SharedDb::new();
    let q = SyncQueue::new(db.node().await);

    q.enqueue("VirtualMachine", 1, "AsyncJob", 1).await.unwrap();
    q.enqueue("Volume", 1, "AsyncJob", 2).await.unwrap();

    let vm = q.try_claim_next("VirtualMachine", 1, 1).await.unwrap();
    let vol = q.try_claim_next("Volume", 1, 1).await.unwrap();
    assert_eq!(vm.unwrap().content_id, 1);
    assert_eq!(vol.unwrap().content_id, 2);
}

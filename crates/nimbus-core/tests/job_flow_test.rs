// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end job flows through the dispatcher.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{Gates, SharedDb, gated, services, wait_for, wait_for_status};
use nimbus_core::dispatcher::{DispatcherConfig, JobDispatcher};
use nimbus_core::handler::HandlerError;
use nimbus_core::job::{JobStatus, SubmitJob};
use nimbus_core::recovery::RecoveryConfig;
use nimbus_core::runtime::JobServices;

fn fast() -> DispatcherConfig {
    DispatcherConfig {
        max_concurrent_jobs: 8,
        poll_interval: Duration::from_millis(10),
    }
}

struct Node {
    services: JobServices,
    dispatcher: Arc<JobDispatcher>,
    task: tokio::task::JoinHandle<()>,
}

impl Node {
    async fn start(db: &SharedDb, msid: i64, gates: &Gates) -> Self {
        let services = services(db.node().await, gates);
        let dispatcher = Arc::new(services.dispatcher(msid, fast()));
        let task = tokio::spawn(dispatcher.clone().run());
        Self {
            services,
            dispatcher,
            task,
        }
    }

    async fn stop(self) {
        self.dispatcher.shutdown_handle().notify_one();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("dispatcher did not stop")
            .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_job_on_same_vm_waits_for_first() {
    let db = SharedDb::new();
    let gates = Gates::default();
    let node = Node::start(&db, 1, &gates).await;
    let store = node.services.store.clone();

    let j1 = store
        .submit(gated("j1").instance("VirtualMachine", 42))
        .await
        .unwrap();
    let j2 = store
        .submit(gated("j2").instance("VirtualMachine", 42))
        .await
        .unwrap();

    wait_for_status(&store, j1, JobStatus::InProgress).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        store.query_status(j2).await.unwrap().job_status(),
        JobStatus::Queued,
        "J2 must not start while J1 holds VM 42"
    );

    // Opening J2's gate first changes nothing: it is not running.
    gates.open("j2");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        store.query_status(j2).await.unwrap().job_status(),
        JobStatus::Queued
    );

    gates.open("j1");
    let first = wait_for_status(&store, j1, JobStatus::Succeeded).await;
    let second = wait_for_status(&store, j2, JobStatus::Succeeded).await;
    assert!(second.last_updated >= first.last_updated);

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_joiner_wakes_only_after_last_joinee() {
    let db = SharedDb::new();
    let gates = Gates::default();
    let node = Node::start(&db, 1, &gates).await;
    let store = node.services.store.clone();

    let j3 = store
        .submit(
            SubmitJob::new("Parent")
                .params(&serde_json::json!({ "children": ["j4", "fail-j5"] }))
                .unwrap(),
        )
        .await
        .unwrap();

    let parked = wait_for(&store, j3, |j| j.waiting_on_join).await;
    assert_eq!(parked.job_status(), JobStatus::Queued);
    let edges = node.services.joins.joins(j3).await.unwrap();
    assert_eq!(edges.len(), 2);
    let (j4, j5) = (edges[0].join_job_id, edges[1].join_job_id);

    gates.open("j4");
    wait_for_status(&store, j4, JobStatus::Succeeded).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let still = store.query_status(j3).await.unwrap();
    assert!(still.waiting_on_join, "J3 woke before J5 finished");
    assert!(!node.services.joins.is_fully_joined(j3).await.unwrap());

    gates.open("fail-j5");
    let failed = wait_for_status(&store, j5, JobStatus::Failed).await;
    assert_eq!(failed.result_code, HandlerError::RESOURCE_UNAVAILABLE);

    let done = wait_for_status(&store, j3, JobStatus::Succeeded).await;
    let result: serde_json::Value = serde_json::from_str(done.result.as_deref().unwrap()).unwrap();
    assert_eq!(result["joined"], serde_json::json!(["succeeded", "failed"]));

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicking_handler_fails_job_and_frees_resource() {
    let db = SharedDb::new();
    let gates = Gates::default();
    let node = Node::start(&db, 1, &gates).await;
    let store = node.services.store.clone();

    let bad = store
        .submit(SubmitJob::new("Explode").instance("VirtualMachine", 7))
        .await
        .unwrap();
    let next = store
        .submit(gated("after").instance("VirtualMachine", 7))
        .await
        .unwrap();
    gates.open("after");

    let failed = wait_for_status(&store, bad, JobStatus::Failed).await;
    assert_eq!(failed.result_code, HandlerError::INTERNAL_ERROR);
    wait_for_status(&store, next, JobStatus::Succeeded).await;

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dead_node_claim_is_recovered_by_survivor() {
    let db = SharedDb::new();
    let gates = Gates::default();

    // Node 2 claims the job and dies without finishing it.
    let dead = services(db.node().await, &gates);
    let job_id = dead
        .store
        .submit(gated("rerun").instance("VirtualMachine", 42))
        .await
        .unwrap();
    dead.persistence
        .register_node(2, "ms-2", Utc::now() - chrono::Duration::minutes(10))
        .await
        .unwrap();
    let claimed = dead.queue.claim_from_any(2, 1).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert!(dead.store.mark_owned(job_id, 2).await.unwrap());
    drop(dead);

    // Node 1 sweeps and takes over.
    let survivor = Node::start(&db, 1, &gates).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let monitor = survivor.services.recovery(
        1,
        RecoveryConfig {
            poll_interval: Duration::from_secs(60),
            node_timeout: Duration::from_secs(60),
            job_stale_after: Duration::ZERO,
        },
    );
    let report = monitor.sweep().await.unwrap();
    assert_eq!(report.nodes_down, vec![2]);
    assert_eq!(report.jobs_requeued, vec![job_id]);

    gates.open("rerun");
    let done = wait_for_status(&survivor.services.store, job_id, JobStatus::Succeeded).await;
    assert_eq!(done.init_msid, Some(1));
    assert_eq!(done.complete_msid, Some(1));

    survivor.stop().await;
}

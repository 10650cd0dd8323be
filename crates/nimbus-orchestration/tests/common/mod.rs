// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for nimbus-orchestration integration tests.
//!
//! A node runs the full job runtime on a file-backed SQLite database with the
//! VM handlers registered against a static inventory and a mock agent.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use nimbus_core::config::RuntimeConfig;
use nimbus_core::job::JobStatus;
use nimbus_core::persistence::AsyncJobRecord;
use nimbus_core::{HandlerRegistry, JobRuntime, JobStore};
use nimbus_orchestration::agent::MockAgent;
use nimbus_orchestration::db::Database;
use nimbus_orchestration::handlers::{register_vm_handlers, vm_resolvers};
use nimbus_orchestration::inventory::{Inventory, StaticInventory, Topology};
use nimbus_orchestration::model::Caller;
use nimbus_orchestration::planner::{PlannerContext, PlannerRegistry};
use nimbus_orchestration::{VmEntityManager, VmOrchestrator};

/// Zone 1 with two 4-core hosts sharing a zone-wide pool.
///
/// VM 42 and 43 need 2 cores, VM 44 needs more than any host has.
pub fn topology() -> Topology {
    serde_json::from_value(serde_json::json!({
        "hosts": [
            {"id": 1, "name": "kvm-1", "address": "10.0.0.1", "data_center_id": 1,
             "pod_id": 1, "cluster_id": 1, "total_cpu": 4, "total_memory": 8192},
            {"id": 2, "name": "kvm-2", "address": "10.0.0.2", "data_center_id": 1,
             "pod_id": 1, "cluster_id": 1, "total_cpu": 4, "total_memory": 8192}
        ],
        "pools": [{"id": 20, "name": "zone-nfs", "data_center_id": 1}],
        "vms": [
            {"id": 42, "name": "i-42", "account_id": 5, "data_center_id": 1,
             "cpu": 2, "memory": 2048, "state": "stopped"},
            {"id": 43, "name": "i-43", "account_id": 5, "data_center_id": 1,
             "cpu": 2, "memory": 2048, "state": "stopped"},
            {"id": 44, "name": "i-44", "account_id": 5, "data_center_id": 1,
             "cpu": 16, "memory": 2048, "state": "stopped"}
        ],
        "volumes": [
            {"id": 420, "vm_id": 42, "kind": "root"},
            {"id": 430, "vm_id": 43, "kind": "root"},
            {"id": 440, "vm_id": 44, "kind": "root"}
        ]
    }))
    .expect("valid topology")
}

pub fn caller() -> Caller {
    Caller {
        user_id: 1,
        account_id: 5,
    }
}

/// One management server with VM handlers.
pub struct Node {
    _dir: TempDir,
    pub db: Database,
    pub inventory: Arc<dyn Inventory>,
    pub agent: Arc<MockAgent>,
    pub manager: Arc<VmEntityManager>,
    pub runtime: JobRuntime,
}

impl Node {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let url = format!("sqlite:{}", dir.path().join("nimbus.db").display());
        let db = Database::connect(&url).await.expect("Failed to open database");

        let inventory: Arc<dyn Inventory> = Arc::new(StaticInventory::new(topology()));
        let agent = Arc::new(MockAgent::new());
        let orchestrator = Arc::new(VmOrchestrator::new(
            inventory.clone(),
            agent.clone(),
            db.reservations.clone(),
            Duration::from_secs(5),
        ));
        let manager = Arc::new(VmEntityManager::new(
            PlannerContext {
                inventory: inventory.clone(),
                reservations: db.reservations.clone(),
            },
            PlannerRegistry::with_defaults(),
            orchestrator,
            Duration::from_secs(600),
            3,
        ));

        let mut registry = HandlerRegistry::new();
        register_vm_handlers(&mut registry, manager.clone());

        let runtime = JobRuntime::builder()
            .persistence(db.persistence.clone())
            .msid(1)
            .registry(registry)
            .resolvers(vm_resolvers(inventory.clone()))
            .config(RuntimeConfig {
                dispatch_poll_interval: Duration::from_millis(10),
                ..Default::default()
            })
            .build()
            .expect("valid runtime config")
            .start()
            .await
            .expect("runtime starts");

        Self {
            _dir: dir,
            db,
            inventory,
            agent,
            manager,
            runtime,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        self.runtime.store()
    }

    pub async fn stop(self) {
        self.runtime.shutdown().await.expect("clean shutdown");
    }
}

pub async fn wait_for_terminal(store: &JobStore, job_id: i64) -> AsyncJobRecord {
    for _ in 0..500 {
        let job = store.query_status(job_id).await.expect("job must exist");
        if job.job_status().is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let job = store.query_status(job_id).await.expect("job must exist");
    panic!("job {} never finished: {:?}", job_id, job);
}

pub fn result_json(job: &AsyncJobRecord) -> serde_json::Value {
    serde_json::from_str(job.result.as_deref().expect("job has a result")).expect("JSON result")
}

pub fn assert_succeeded(job: &AsyncJobRecord) {
    assert_eq!(job.job_status(), JobStatus::Succeeded, "job failed: {:?}", job.result);
}

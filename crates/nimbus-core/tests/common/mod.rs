// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for nimbus-core integration tests.
//!
//! Every simulated node gets its own connection pool on one file-backed
//! SQLite database, so cross-node races go through the real database locks.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use nimbus_core::handler::{CommandHandler, HandlerError, HandlerRegistry, JobContext, JobOutcome};
use nimbus_core::job::{JobStatus, SubmitJob};
use nimbus_core::job_store::{InstanceResolvers, JobStore};
use nimbus_core::persistence::{AsyncJobRecord, Persistence, SqlitePersistence};
use nimbus_core::runtime::JobServices;

/// A database file shared by several nodes.
pub struct SharedDb {
    _dir: TempDir,
    pub path: PathBuf,
}

impl SharedDb {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("nimbus.db");
        Self { _dir: dir, path }
    }

    /// A fresh pool on the shared file, as a separate node would have.
    pub async fn node(&self) -> Arc<dyn Persistence> {
        Arc::new(
            SqlitePersistence::from_path(&self.path)
                .await
                .expect("Failed to open shared SQLite database"),
        )
    }
}

/// Named gates a test opens to let gated handlers finish.
#[derive(Clone, Default)]
pub struct Gates {
    gates: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl Gates {
    fn gate(&self, name: &str) -> Arc<Semaphore> {
        self.gates
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(0)))
            .clone()
    }

    pub fn open(&self, name: &str) {
        self.gate(name).add_permits(1);
    }

    pub async fn wait(&self, name: &str) {
        self.gate(name)
            .acquire()
            .await
            .expect("gate closed")
            .forget();
    }
}

#[derive(Deserialize)]
pub struct GatedParams {
    pub gate: String,
}

/// Completes once its gate is opened.
pub struct Gated(pub Gates);

#[async_trait::async_trait]
impl CommandHandler for Gated {
    type Params = GatedParams;

    async fn handle(&self, _ctx: &JobContext, params: GatedParams) -> Result<JobOutcome, HandlerError> {
        self.0.wait(&params.gate).await;
        if params.gate.starts_with("fail") {
            return Err(HandlerError::new(
                HandlerError::RESOURCE_UNAVAILABLE,
                format!("{} failed", params.gate),
            ));
        }
        JobOutcome::completed(&serde_json::json!({ "gate": params.gate }))
    }
}

#[derive(Deserialize)]
pub struct ParentParams {
    pub children: Vec<String>,
}

/// Spawns one gated child per entry and completes once all have finished.
pub struct Parent;

#[async_trait::async_trait]
impl CommandHandler for Parent {
    type Params = ParentParams;

    async fn handle(&self, ctx: &JobContext, params: ParentParams) -> Result<JobOutcome, HandlerError> {
        let joins = ctx.joins().await?;
        if joins.is_empty() {
            for gate in &params.children {
                let child = SubmitJob::new("Gated").params(&serde_json::json!({ "gate": gate }))?;
                ctx.submit_child(child).await?;
            }
            return Ok(JobOutcome::wait());
        }

        let statuses: Vec<&str> = joins.iter().map(|j| j.join_status.as_str()).collect();
        JobOutcome::completed(&serde_json::json!({ "joined": statuses }))
    }
}

/// Panics every time.
pub struct Explode;

#[async_trait::async_trait]
impl CommandHandler for Explode {
    type Params = serde_json::Value;

    async fn handle(&self, _ctx: &JobContext, _params: serde_json::Value) -> Result<JobOutcome, HandlerError> {
        panic!("explode");
    }
}

pub fn registry(gates: &Gates) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register_command("Gated", Gated(gates.clone()))
        .register_command("Parent", Parent)
        .register_command("Explode", Explode);
    registry
}

pub fn services(persistence: Arc<dyn Persistence>, gates: &Gates) -> JobServices {
    JobServices::new(persistence, registry(gates), InstanceResolvers::new())
}

pub fn gated(gate: &str) -> SubmitJob {
    SubmitJob::new("Gated")
        .params(&serde_json::json!({ "gate": gate }))
        .expect("serializable params")
}

/// Poll until the job satisfies `pred` or five seconds pass.
pub async fn wait_for(
    store: &JobStore,
    job_id: i64,
    pred: impl Fn(&AsyncJobRecord) -> bool,
) -> AsyncJobRecord {
    for _ in 0..500 {
        let job = store.query_status(job_id).await.expect("job must exist");
        if pred(&job) {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let job = store.query_status(job_id).await.expect("job must exist");
    panic!("job {} never reached the expected state: {:?}", job_id, job);
}

pub async fn wait_for_status(store: &JobStore, job_id: i64, status: JobStatus) -> AsyncJobRecord {
    wait_for(store, job_id, |j| j.job_status() == status).await
}

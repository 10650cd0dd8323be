// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable job runtime.
//!
//! [`JobRuntime`] wires the services of one node together and runs its
//! background loops: the dispatcher, the liveness heartbeat, the recovery
//! monitor and (when enabled) the job cleanup worker.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use nimbus_core::handler::HandlerRegistry;
//! use nimbus_core::persistence::SqlitePersistence;
//! use nimbus_core::runtime::JobRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path("/var/lib/nimbus/jobs.db").await?);
//!     let mut registry = HandlerRegistry::new();
//!     // registry.register_command("VmWorkStart", ...);
//!
//!     let runtime = JobRuntime::builder()
//!         .persistence(persistence)
//!         .msid(1)
//!         .registry(registry)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... submit jobs through runtime.store() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cleanup_worker::JobCleanupWorker;
use crate::config::RuntimeConfig;
use crate::dispatcher::{DispatcherConfig, JobDispatcher};
use crate::handler::HandlerRegistry;
use crate::heartbeat::NodeHeartbeat;
use crate::job_store::{InstanceResolvers, JobStore};
use crate::join_map::JoinMap;
use crate::persistence::Persistence;
use crate::recovery::{RecoveryConfig, RecoveryMonitor};
use crate::sync_queue::SyncQueue;

/// The services of one node, sharing a persistence backend and a wake signal.
#[derive(Clone)]
pub struct JobServices {
    /// Storage backend.
    pub persistence: Arc<dyn Persistence>,
    /// Job admission and status.
    pub store: Arc<JobStore>,
    /// Sync queues.
    pub queue: Arc<SyncQueue>,
    /// Join map.
    pub joins: Arc<JoinMap>,
    /// Command handlers.
    pub registry: Arc<HandlerRegistry>,
    /// Signalled whenever new work may be claimable.
    pub wake: Arc<Notify>,
}

impl JobServices {
    /// Build the services. Only commands present in `registry` are admitted.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        registry: HandlerRegistry,
        resolvers: InstanceResolvers,
    ) -> Self {
        let wake = Arc::new(Notify::new());
        let joins = Arc::new(JoinMap::new(persistence.clone(), wake.clone()));
        let store = Arc::new(JobStore::new(
            persistence.clone(),
            joins.clone(),
            registry.commands(),
            resolvers,
            wake.clone(),
        ));
        Self {
            queue: Arc::new(SyncQueue::new(persistence.clone())),
            persistence,
            store,
            joins,
            registry: Arc::new(registry),
            wake,
        }
    }

    /// A dispatcher for node `msid` over these services.
    pub fn dispatcher(&self, msid: i64, config: DispatcherConfig) -> JobDispatcher {
        JobDispatcher::new(
            msid,
            self.store.clone(),
            self.queue.clone(),
            self.joins.clone(),
            self.registry.clone(),
            self.wake.clone(),
            config,
        )
    }

    /// A recovery monitor for node `msid` over these services.
    pub fn recovery(&self, msid: i64, config: RecoveryConfig) -> RecoveryMonitor {
        RecoveryMonitor::new(
            msid,
            self.persistence.clone(),
            self.store.clone(),
            self.joins.clone(),
            self.wake.clone(),
            config,
        )
    }
}

/// Builder for creating a [`JobRuntime`].
#[derive(Default)]
pub struct JobRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    msid: Option<i64>,
    node_name: Option<String>,
    registry: HandlerRegistry,
    resolvers: InstanceResolvers,
    config: RuntimeConfig,
}

impl std::fmt::Debug for JobRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRuntimeBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("msid", &self.msid)
            .field("node_name", &self.node_name)
            .field("commands", &self.registry.commands())
            .field("config", &self.config)
            .finish()
    }
}

impl JobRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set this node's msid (required, positive).
    pub fn msid(mut self, msid: i64) -> Self {
        self.msid = Some(msid);
        self
    }

    /// Set the liveness row name. Default: `nimbus-<msid>`.
    pub fn node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = Some(name.into());
        self
    }

    /// Set the command handlers.
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set the instance resolvers used at admission.
    pub fn resolvers(mut self, resolvers: InstanceResolvers) -> Self {
        self.resolvers = resolvers;
        self
    }

    /// Set worker and recovery tunables.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing or invalid.
    pub fn build(self) -> Result<JobRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let msid = self.msid.ok_or_else(|| anyhow::anyhow!("msid is required"))?;
        if msid <= 0 {
            anyhow::bail!("msid must be positive, got {}", msid);
        }
        if self.config.max_concurrent_jobs == 0 {
            anyhow::bail!("max_concurrent_jobs must be at least 1");
        }

        Ok(JobRuntimeConfig {
            services: JobServices::new(persistence, self.registry, self.resolvers),
            msid,
            node_name: self
                .node_name
                .unwrap_or_else(|| format!("nimbus-{}", msid)),
            config: self.config,
        })
    }
}

/// Configuration for a [`JobRuntime`].
pub struct JobRuntimeConfig {
    services: JobServices,
    msid: i64,
    node_name: String,
    config: RuntimeConfig,
}

impl std::fmt::Debug for JobRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRuntimeConfig")
            .field("services", &"...")
            .field("msid", &self.msid)
            .field("node_name", &self.node_name)
            .field("config", &self.config)
            .finish()
    }
}

impl JobRuntimeConfig {
    /// Services that will back the runtime, e.g. to submit jobs before start.
    pub fn services(&self) -> &JobServices {
        &self.services
    }

    /// Recover this node's leftovers, then spawn the background loops.
    pub async fn start(self) -> Result<JobRuntime> {
        let services = self.services;
        let msid = self.msid;
        let config = self.config;

        let recovery = Arc::new(services.recovery(
            msid,
            RecoveryConfig {
                poll_interval: config.heartbeat_interval,
                node_timeout: config.node_timeout,
                job_stale_after: config.job_stale_after,
            },
        ));
        recovery.recover_self().await?;

        let heartbeat = Arc::new(NodeHeartbeat::new(
            services.persistence.clone(),
            msid,
            self.node_name,
            config.heartbeat_interval,
        ));
        heartbeat.register().await?;

        let dispatcher = Arc::new(services.dispatcher(
            msid,
            DispatcherConfig {
                max_concurrent_jobs: config.max_concurrent_jobs,
                poll_interval: config.dispatch_poll_interval,
            },
        ));

        let mut shutdown = Vec::new();
        let mut tasks = Vec::new();

        shutdown.push(dispatcher.shutdown_handle());
        tasks.push(tokio::spawn(dispatcher.clone().run()));

        shutdown.push(heartbeat.shutdown_handle());
        tasks.push(tokio::spawn(async move { heartbeat.run().await }));

        shutdown.push(recovery.shutdown_handle());
        tasks.push(tokio::spawn(async move { recovery.run().await }));

        if config.cleanup.enabled {
            let cleanup = JobCleanupWorker::new(services.persistence.clone(), config.cleanup);
            shutdown.push(cleanup.shutdown_handle());
            tasks.push(tokio::spawn(async move { cleanup.run().await }));
        }

        info!(
            msid,
            max_concurrent_jobs = config.max_concurrent_jobs,
            commands = services.registry.commands().len(),
            "JobRuntime started"
        );

        Ok(JobRuntime {
            msid,
            services,
            dispatcher,
            shutdown,
            tasks,
        })
    }
}

/// A running node.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination; running
/// handlers are allowed to finish.
pub struct JobRuntime {
    msid: i64,
    services: JobServices,
    dispatcher: Arc<JobDispatcher>,
    shutdown: Vec<Arc<Notify>>,
    tasks: Vec<JoinHandle<()>>,
}

impl JobRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> JobRuntimeBuilder {
        JobRuntimeBuilder::new()
    }

    /// This node's msid.
    pub fn msid(&self) -> i64 {
        self.msid
    }

    /// Shared services.
    pub fn services(&self) -> &JobServices {
        &self.services
    }

    /// Job store, for submitting and querying jobs.
    pub fn store(&self) -> &Arc<JobStore> {
        &self.services.store
    }

    /// Handlers currently running on this node.
    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    /// Check if every background loop is still running.
    pub fn is_running(&self) -> bool {
        self.tasks.iter().all(|t| !t.is_finished())
    }

    /// Gracefully shut down the runtime.
    pub async fn shutdown(self) -> Result<()> {
        info!(msid = self.msid, "JobRuntime shutting down...");

        for handle in &self.shutdown {
            // notify_one stores a permit if the loop is mid-cycle.
            handle.notify_one();
        }

        let mut failed = 0;
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("JobRuntime task panicked: {}", e);
                failed += 1;
            }
        }

        if failed > 0 {
            anyhow::bail!("{} background task(s) panicked", failed);
        }
        info!("JobRuntime shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerError, JobContext, JobHandler, JobOutcome};
    use crate::job::{JobStatus, SubmitJob};
    use crate::persistence::{AsyncJobRecord, SqlitePersistence};
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;

    struct Noop;

    #[async_trait::async_trait]
    impl JobHandler for Noop {
        async fn execute(
            &self,
            _ctx: &JobContext,
            _job: &AsyncJobRecord,
        ) -> std::result::Result<JobOutcome, HandlerError> {
            Ok(JobOutcome::Completed(serde_json::Value::Null))
        }
    }

    async fn persistence() -> Arc<dyn Persistence> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        crate::migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");
        Arc::new(SqlitePersistence::new(pool))
    }

    #[test]
    fn test_builder_requires_persistence_and_msid() {
        let err = JobRuntime::builder().msid(1).build().unwrap_err();
        assert!(err.to_string().contains("persistence is required"));
    }

    #[tokio::test]
    async fn test_builder_rejects_bad_msid() {
        let p = persistence().await;
        let err = JobRuntime::builder()
            .persistence(p.clone())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("msid is required"));

        let err = JobRuntime::builder()
            .persistence(p)
            .msid(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("msid must be positive"));
    }

    #[tokio::test]
    async fn test_builder_debug() {
        let builder = JobRuntime::builder().persistence(persistence().await).msid(5);
        let debug = format!("{:?}", builder);
        assert!(debug.contains("JobRuntimeBuilder"));
        assert!(debug.contains("msid: Some(5)"));
    }

    #[tokio::test]
    async fn test_start_runs_jobs_and_shuts_down() {
        let p = persistence().await;
        let mut registry = HandlerRegistry::new();
        registry.register("Noop", Noop);

        let runtime = JobRuntime::builder()
            .persistence(p.clone())
            .msid(9)
            .registry(registry)
            .config(RuntimeConfig {
                dispatch_poll_interval: Duration::from_millis(10),
                ..Default::default()
            })
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();
        assert!(runtime.is_running());
        assert_eq!(p.get_node(9).await.unwrap().unwrap().name, "nimbus-9");

        let job_id = runtime.store().submit(SubmitJob::new("Noop")).await.unwrap();
        let mut status = JobStatus::Queued;
        for _ in 0..200 {
            status = runtime.store().query_status(job_id).await.unwrap().job_status();
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, JobStatus::Succeeded);

        tokio::time::timeout(Duration::from_secs(5), runtime.shutdown())
            .await
            .expect("shutdown timed out")
            .unwrap();
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job handlers and the registry that binds command names to them.
//!
//! The dispatcher only sees the object-safe [`JobHandler`]. Most handlers
//! are written against [`CommandHandler`], which receives its parameters
//! already deserialized from the job's `cmd_info`.
//!
//! # Example
//!
//! ```ignore
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl CommandHandler for Echo {
//!     type Params = serde_json::Value;
//!
//!     async fn handle(&self, _ctx: &JobContext, params: Self::Params)
//!         -> Result<JobOutcome, HandlerError> {
//!         Ok(JobOutcome::Completed(params))
//!     }
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register_command("Echo", Echo);
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::job::{StatusUpdate, SubmitJob};
use crate::job_store::JobStore;
use crate::join_map::JoinMap;
use crate::persistence::{AsyncJobRecord, JoinRecord};

/// What a handler run produced.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The job is done; the value becomes its result.
    Completed(Value),
    /// Park until every join added during this run has resolved.
    ///
    /// Returning `Completed` or an error while joins are still pending parks
    /// the job the same way; it runs again once they resolve.
    ///
    /// With `exclusive` the job keeps its sync queue item, so nothing else
    /// on the same resource runs in the meantime.
    Waiting {
        /// Hold the resource while waiting.
        exclusive: bool,
    },
}

impl JobOutcome {
    /// Completed with a serializable result.
    pub fn completed<T: Serialize>(result: &T) -> std::result::Result<Self, HandlerError> {
        serde_json::to_value(result)
            .map(Self::Completed)
            .map_err(|e| HandlerError::internal(format!("failed to serialize result: {}", e)))
    }

    /// Wait on joins, letting other work on the resource proceed.
    pub fn wait() -> Self {
        Self::Waiting { exclusive: false }
    }

    /// Wait on joins while holding the resource.
    ///
    /// A joinee queued on the same resource could never run behind the held
    /// item, so in that case the dispatcher parks the job as with
    /// [`JobOutcome::wait`].
    pub fn wait_exclusive() -> Self {
        Self::Waiting { exclusive: true }
    }
}

/// Error returned by a handler; stored as the job's failed result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct HandlerError {
    /// Result code written to the job.
    pub code: i32,
    /// Human readable message.
    pub message: String,
}

impl HandlerError {
    /// Unexpected internal failure.
    pub const INTERNAL_ERROR: i32 = 530;
    /// Bad or missing parameter.
    pub const PARAM_ERROR: i32 = 431;
    /// No capacity for the requested placement.
    pub const INSUFFICIENT_CAPACITY: i32 = 533;
    /// A required resource is unavailable.
    pub const RESOURCE_UNAVAILABLE: i32 = 534;

    /// Error with an explicit code.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Internal error (530).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }

    /// Parameter error (431).
    pub fn param(message: impl Into<String>) -> Self {
        Self::new(Self::PARAM_ERROR, message)
    }

    /// Serialized form stored in the job's `result` column.
    pub fn to_result_json(&self) -> String {
        serde_json::json!({
            "errorcode": self.code,
            "errortext": self.message,
        })
        .to_string()
    }
}

impl From<CoreError> for HandlerError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ValidationError { .. } => Self::param(err.to_string()),
            other => Self::internal(other.to_string()),
        }
    }
}

/// Everything a handler may do besides its own work.
#[derive(Clone)]
pub struct JobContext {
    job_id: i64,
    msid: i64,
    store: Arc<JobStore>,
    joins: Arc<JoinMap>,
}

impl JobContext {
    /// Build a context for one handler run.
    pub fn new(job_id: i64, msid: i64, store: Arc<JobStore>, joins: Arc<JoinMap>) -> Self {
        Self {
            job_id,
            msid,
            store,
            joins,
        }
    }

    /// The job being executed.
    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    /// The node executing it.
    pub fn msid(&self) -> i64 {
        self.msid
    }

    /// The job store, for handlers that submit or inspect other jobs.
    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Submit a child job and join it.
    ///
    /// Return [`JobOutcome::wait`] afterwards to park until it finishes.
    pub async fn submit_child(&self, job: SubmitJob) -> Result<i64> {
        let child = self.store.submit(job).await?;
        self.joins.add_join(self.job_id, child, self.msid).await?;
        Ok(child)
    }

    /// Wait for an existing job.
    pub async fn add_join(&self, join_job_id: i64) -> Result<i64> {
        self.joins.add_join(self.job_id, join_job_id, self.msid).await
    }

    /// Edges of this job with the joinees' outcomes.
    pub async fn joins(&self) -> Result<Vec<JoinRecord>> {
        self.joins.joins(self.job_id).await
    }

    /// Whether a client asked for this job to stop.
    pub async fn is_cancel_requested(&self) -> Result<bool> {
        self.store.is_cancel_requested(self.job_id).await
    }

    /// Record handler progress.
    pub async fn update_progress(&self, process_status: i32) -> Result<StatusUpdate> {
        self.store
            .update_progress(self.job_id, process_status, self.msid)
            .await
    }
}

/// Object-safe handler invoked by the dispatcher.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job.
    async fn execute(
        &self,
        ctx: &JobContext,
        job: &AsyncJobRecord,
    ) -> std::result::Result<JobOutcome, HandlerError>;
}

/// Handler with typed parameters.
#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Parameters deserialized from `cmd_info`.
    type Params: DeserializeOwned + Send + 'static;

    /// Run the command.
    async fn handle(
        &self,
        ctx: &JobContext,
        params: Self::Params,
    ) -> std::result::Result<JobOutcome, HandlerError>;
}

struct Typed<H>(H);

#[async_trait::async_trait]
impl<H: CommandHandler> JobHandler for Typed<H> {
    async fn execute(
        &self,
        ctx: &JobContext,
        job: &AsyncJobRecord,
    ) -> std::result::Result<JobOutcome, HandlerError> {
        let params: H::Params = serde_json::from_str(&job.cmd_info).map_err(|e| {
            HandlerError::param(format!("invalid parameters for {}: {}", job.cmd, e))
        })?;
        self.0.handle(ctx, params).await
    }
}

/// Command name to handler table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw handler.
    pub fn register(&mut self, cmd: impl Into<String>, handler: impl JobHandler + 'static) -> &mut Self {
        self.handlers.insert(cmd.into(), Arc::new(handler));
        self
    }

    /// Register a typed command handler.
    pub fn register_command<H: CommandHandler>(
        &mut self,
        cmd: impl Into<String>,
        handler: H,
    ) -> &mut Self {
        self.register(cmd, Typed(handler))
    }

    /// Handler for a command.
    pub fn get(&self, cmd: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(cmd).cloned()
    }

    /// Whether a handler is registered.
    pub fn contains(&self, cmd: &str) -> bool {
        self.handlers.contains_key(cmd)
    }

    /// Registered command names.
    pub fn commands(&self) -> BTreeSet<String> {
        self.handlers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct AddParams {
        a: i64,
        b: i64,
    }

    struct Add;

    #[async_trait::async_trait]
    impl CommandHandler for Add {
        type Params = AddParams;

        async fn handle(
            &self,
            _ctx: &JobContext,
            params: AddParams,
        ) -> std::result::Result<JobOutcome, HandlerError> {
            JobOutcome::completed(&(params.a + params.b))
        }
    }

    fn record(cmd: &str, cmd_info: &str) -> AsyncJobRecord {
        AsyncJobRecord {
            id: 1,
            user_id: 1,
            account_id: 1,
            cmd: cmd.to_string(),
            cmd_info: cmd_info.to_string(),
            status: "in_progress".to_string(),
            process_status: 0,
            result_code: 0,
            result: None,
            instance_type: None,
            instance_id: None,
            init_msid: Some(1),
            complete_msid: None,
            waiting_on_join: false,
            cancel_requested: false,
            created: Utc::now(),
            last_updated: Utc::now(),
            last_polled: None,
            removed: None,
        }
    }

    async fn context() -> JobContext {
        use crate::persistence::{Persistence, SqlitePersistence};
        use sqlx::sqlite::SqlitePoolOptions;
        use tokio::sync::Notify;

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
        let store = Arc::new(JobStore::new(
            persistence,
            joins.clone(),
            BTreeSet::new(),
            Default::default(),
            wake,
        ));
        JobContext::new(1, 1, store, joins)
    }

    #[tokio::test]
    async fn test_typed_handler_deserializes_params() {
        let mut registry = HandlerRegistry::new();
        registry.register_command("Add", Add);
        assert!(registry.contains("Add"));
        assert_eq!(registry.commands().into_iter().collect::<Vec<_>>(), vec!["Add"]);

        let ctx = context().await;
        let handler = registry.get("Add").unwrap();

        let outcome = handler
            .execute(&ctx, &record("Add", r#"{"a":2,"b":3}"#))
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Completed(serde_json::json!(5)));

        let err = handler
            .execute(&ctx, &record("Add", r#"{"a":2}"#))
            .await
            .unwrap_err();
        assert_eq!(err.code, HandlerError::PARAM_ERROR);
        assert!(err.message.contains("invalid parameters for Add"));
    }

    #[test]
    fn test_handler_error_result_json() {
        let err = HandlerError::new(HandlerError::INSUFFICIENT_CAPACITY, "no host");
        let json: Value = serde_json::from_str(&err.to_result_json()).unwrap();
        assert_eq!(json["errorcode"], 533);
        assert_eq!(json["errortext"], "no host");
        assert_eq!(err.to_string(), "no host (code 533)");
    }

    #[test]
    fn test_core_error_mapping() {
        let err: HandlerError = CoreError::validation("vm_id", "required").into();
        assert_eq!(err.code, HandlerError::PARAM_ERROR);

        let err: HandlerError = CoreError::JobNotFound { job_id: 3 }.into();
        assert_eq!(err.code, HandlerError::INTERNAL_ERROR);
    }

    #[test]
    fn test_wait_constructors() {
        assert_eq!(JobOutcome::wait(), JobOutcome::Waiting { exclusive: false });
        assert_eq!(
            JobOutcome::wait_exclusive(),
            JobOutcome::Waiting { exclusive: true }
        );
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job domain types shared by the store, queue, join map and dispatcher.

use serde::Serialize;

use crate::error::{CoreError, Result};
use crate::persistence::AsyncJobRecord;

/// Content type used for sync queue items that carry an async job id.
pub const ASYNC_JOB_CONTENT: &str = "AsyncJob";

/// Status of an async job.
///
/// ```text
/// QUEUED ──claim──▶ IN_PROGRESS ──▶ SUCCEEDED | FAILED
///   ▲                   │
///   └── join wait / ────┘
///       dead owner
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Waiting for its sync queue item to be claimed (or parked on a join).
    Queued,
    /// Claimed by a management server and executing.
    InProgress,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
}

impl JobStatus {
    /// Returns the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Parse a status from its database representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "in_progress" => Some(Self::InProgress),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// SUCCEEDED and FAILED never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one join map edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    /// The joinee has not finished yet.
    Pending,
    /// The joinee succeeded.
    Succeeded,
    /// The joinee failed (or vanished).
    Failed,
}

impl JoinStatus {
    /// Returns the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Parse a join status, treating unknown values as pending.
    pub fn parse(s: &str) -> Self {
        match s {
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// Join status mirroring a terminal job status.
    pub fn from_terminal(status: JobStatus) -> Option<Self> {
        match status {
            JobStatus::Succeeded => Some(Self::Succeeded),
            JobStatus::Failed => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Key of one serialization domain, e.g. `("VirtualMachine", 42)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncKey {
    /// Object type tag.
    pub object_type: String,
    /// Object id.
    pub object_id: i64,
}

impl SyncKey {
    /// Create a key.
    pub fn new(object_type: impl Into<String>, object_id: i64) -> Self {
        Self {
            object_type: object_type.into(),
            object_id,
        }
    }

    /// The queue a job is admitted through.
    ///
    /// Jobs bound to an instance share that instance's queue; unbound jobs
    /// get a private queue keyed by their own id.
    pub fn for_job(job: &AsyncJobRecord) -> Self {
        match (&job.instance_type, job.instance_id) {
            (Some(instance_type), Some(instance_id)) => Self::new(instance_type.clone(), instance_id),
            _ => Self::new(ASYNC_JOB_CONTENT, job.id),
        }
    }
}

/// Request to submit a new async job.
#[derive(Debug, Clone)]
pub struct SubmitJob {
    /// Calling user.
    pub user_id: i64,
    /// Owning account.
    pub account_id: i64,
    /// Command name resolved through the handler registry.
    pub cmd: String,
    /// Serialized command parameters (JSON).
    pub cmd_info: String,
    /// Entity type the job acts on.
    pub instance_type: Option<String>,
    /// Entity id the job acts on.
    pub instance_id: Option<i64>,
}

impl SubmitJob {
    /// Start building a submission for `cmd` with empty parameters.
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            user_id: 0,
            account_id: 0,
            cmd: cmd.into(),
            cmd_info: "{}".to_string(),
            instance_type: None,
            instance_id: None,
        }
    }

    /// Set the calling user and account.
    pub fn caller(mut self, user_id: i64, account_id: i64) -> Self {
        self.user_id = user_id;
        self.account_id = account_id;
        self
    }

    /// Serialize typed parameters into `cmd_info`.
    pub fn params<T: Serialize>(mut self, params: &T) -> Result<Self> {
        self.cmd_info = serde_json::to_string(params)?;
        Ok(self)
    }

    /// Bind the job to an entity so it is serialized with other work on it.
    pub fn instance(mut self, instance_type: impl Into<String>, instance_id: i64) -> Self {
        self.instance_type = Some(instance_type.into());
        self.instance_id = Some(instance_id);
        self
    }

    /// Check the request shape before anything is written.
    pub fn validate(&self) -> Result<()> {
        if self.cmd.trim().is_empty() {
            return Err(CoreError::validation("cmd", "command name is required"));
        }
        serde_json::from_str::<serde_json::Value>(&self.cmd_info)
            .map_err(|e| CoreError::validation("cmd_info", format!("must be valid JSON: {}", e)))?;
        match (&self.instance_type, self.instance_id) {
            (Some(t), Some(_)) if t.trim().is_empty() => Err(CoreError::validation(
                "instance_type",
                "must not be empty",
            )),
            (Some(_), None) => Err(CoreError::validation(
                "instance_id",
                "required when instance_type is set",
            )),
            (None, Some(_)) => Err(CoreError::validation(
                "instance_type",
                "required when instance_id is set",
            )),
            _ => Ok(()),
        }
    }
}

/// A status transition requested through `update_status`.
#[derive(Debug, Clone)]
pub struct JobStatusChange {
    /// Target status.
    pub status: JobStatus,
    /// Handler-defined progress marker.
    pub process_status: i32,
    /// Result code (0 on success).
    pub result_code: i32,
    /// Serialized result or error.
    pub result: Option<String>,
    /// Node that must own the IN_PROGRESS job for a terminal change to apply.
    pub owner: Option<i64>,
}

impl JobStatusChange {
    /// Successful completion with a serialized result.
    pub fn succeeded(result: Option<String>) -> Self {
        Self {
            status: JobStatus::Succeeded,
            process_status: 0,
            result_code: 0,
            result,
            owner: None,
        }
    }

    /// Failed completion.
    pub fn failed(result_code: i32, result: Option<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            process_status: 0,
            result_code,
            result,
            owner: None,
        }
    }

    /// Progress update while running.
    pub fn progress(process_status: i32) -> Self {
        Self {
            status: JobStatus::InProgress,
            process_status,
            result_code: 0,
            result: None,
            owner: None,
        }
    }

    /// Only apply while `msid` still owns the running job.
    ///
    /// A node whose job was requeued by recovery and picked up elsewhere
    /// can then no longer finish it.
    pub fn owned_by(mut self, msid: i64) -> Self {
        self.owner = Some(msid);
        self
    }
}

/// What `update_status` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    /// The row changed.
    Applied,
    /// The job was already in the requested terminal state.
    Unchanged,
    /// The job is terminal in a different state, or no longer owned by the
    /// fencing node; nothing was written.
    Rejected,
    /// A terminal change was refused because the job still has pending
    /// joins.
    JoinsPending,
}

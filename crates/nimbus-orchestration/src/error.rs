// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for nimbus-orchestration.

use std::fmt;

use nimbus_core::HandlerError;
use thiserror::Error;
use uuid::Uuid;

use crate::agent::AgentError;
use crate::model::VmState;

/// Topology level an insufficient-capacity error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Zone.
    DataCenter,
    /// Pod.
    Pod,
    /// Cluster.
    Cluster,
    /// Single host.
    Host,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DataCenter => "data center",
            Self::Pod => "pod",
            Self::Cluster => "cluster",
            Self::Host => "host",
        };
        f.write_str(s)
    }
}

/// Orchestration errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] nimbus_core::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Core migrations failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Job framework operation failed.
    #[error("Core error: {0}")]
    Core(#[from] nimbus_core::CoreError),

    /// Host agent transport failed.
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    /// No destination with enough free capacity.
    #[error("Insufficient capacity in {scope} {id}")]
    InsufficientCapacity {
        /// Scope searched.
        scope: Scope,
        /// Id of that scope.
        id: i64,
    },

    /// Caller constraints contradict where the VM's storage lives.
    #[error("Placement conflict: {0}")]
    PlacementConflict(String),

    /// No planner registered under this name.
    #[error("Unknown planner: {0}")]
    UnknownPlanner(String),

    /// The planner declined the request.
    #[error("Planner {0} cannot handle this deployment")]
    PlannerCannotHandle(String),

    /// Reservation id does not exist.
    #[error("Reservation not found: {0}")]
    ReservationNotFound(Uuid),

    /// Reservation was already consumed, released or has expired.
    #[error("Reservation {0} is no longer available")]
    ReservationConsumed(Uuid),

    /// VM does not exist or was removed.
    #[error("VM not found: {0}")]
    VmNotFound(i64),

    /// Volume does not exist.
    #[error("Volume not found: {0}")]
    VolumeNotFound(i64),

    /// Host does not exist.
    #[error("Host not found: {0}")]
    HostNotFound(i64),

    /// VM is not in a state that allows the operation.
    #[error("VM {vm_id} is {actual}, expected {expected}")]
    InvalidVmState {
        /// The VM.
        vm_id: i64,
        /// State the operation needs.
        expected: VmState,
        /// State found.
        actual: VmState,
    },

    /// The host agent answered with a failure.
    #[error("Agent on host {host_id} failed: {details}")]
    AgentFailed {
        /// Host the command went to.
        host_id: i64,
        /// Agent's failure details.
        details: String,
    },

    /// Topology source could not be loaded.
    #[error("Inventory error: {0}")]
    Inventory(String),
}

/// Result type using orchestration Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for HandlerError {
    fn from(err: Error) -> Self {
        let code = match &err {
            Error::InsufficientCapacity { .. } => HandlerError::INSUFFICIENT_CAPACITY,
            Error::Agent(_) | Error::AgentFailed { .. } => HandlerError::RESOURCE_UNAVAILABLE,
            Error::PlacementConflict(_)
            | Error::UnknownPlanner(_)
            | Error::PlannerCannotHandle(_)
            | Error::ReservationNotFound(_)
            | Error::ReservationConsumed(_)
            | Error::VmNotFound(_)
            | Error::VolumeNotFound(_)
            | Error::HostNotFound(_)
            | Error::InvalidVmState { .. } => HandlerError::PARAM_ERROR,
            _ => HandlerError::INTERNAL_ERROR,
        };
        HandlerError::new(code, err.to_string())
    }
}

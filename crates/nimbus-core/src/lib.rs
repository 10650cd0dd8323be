// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Nimbus Core - Distributed Async Job Framework
//!
//! This crate runs long, resource-bound operations as durable async jobs
//! shared by a cluster of management nodes. All coordination goes through
//! one relational database: there is no lock service and no leader, only
//! compare-and-set updates.
//!
//! # Architecture
//!
//! ```text
//!   submit ──► JobStore ──► async_job (QUEUED) + sync_queue_item
//!                                              │
//!                     ┌────────────────────────┘
//!                     ▼
//!              JobDispatcher (one per node)
//!                claim queue head (CAS)
//!                mark job IN_PROGRESS (CAS)
//!                run handler on worker pool
//!                     │
//!        ┌────────────┼─────────────────────┐
//!        ▼            ▼                     ▼
//!   Completed    Err / panic          Waiting (joins)
//!   SUCCEEDED      FAILED           park, then woken by
//!        │            │             JoinMap when joinees finish
//!        └─────┬──────┘
//!              ▼
//!   item released, joiners woken, next item on the resource claimable
//! ```
//!
//! # Guarantees
//!
//! | Property | Mechanism |
//! |----------|-----------|
//! | One active item per resource | CAS on `sync_queue.last_process_number` |
//! | FIFO per resource | items claimed in id order |
//! | One owner per job | CAS QUEUED to IN_PROGRESS |
//! | Terminal states are final | status updates guarded by `status NOT IN (terminal)` |
//! | Joiner woken once | CAS on `waiting_on_join` |
//! | Work survives node death | [`recovery::RecoveryMonitor`] |
//!
//! Execution is at-least-once: a job whose node dies mid-run is executed
//! again elsewhere, so handlers must be idempotent.
//!
//! # Modules
//!
//! - [`sync_queue`]: per-resource FIFO mutual exclusion
//! - [`job_store`]: job admission, status and queries
//! - [`join_map`]: AND-joins between jobs
//! - [`dispatcher`]: claiming and running jobs
//! - [`handler`]: the handler traits and registry
//! - [`runtime`]: wiring and background loops of one node
//!
//! # Configuration
//!
//! See [`config::Config::from_env`].

#![deny(missing_docs)]

pub mod cleanup_worker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod heartbeat;
pub mod job;
pub mod job_store;
pub mod join_map;
pub mod migrations;
pub mod persistence;
pub mod recovery;
pub mod runtime;
pub mod sync_queue;

pub use error::{CoreError, Result};
pub use handler::{CommandHandler, HandlerError, HandlerRegistry, JobContext, JobHandler, JobOutcome};
pub use job::{JobStatus, JobStatusChange, JoinStatus, StatusUpdate, SubmitJob, SyncKey};
pub use job_store::{InstanceResolver, InstanceResolvers, JobStore};
pub use persistence::{Persistence, PostgresPersistence, SqlitePersistence};
pub use runtime::{JobRuntime, JobServices};

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Nimbus Orchestration - VM Reservation, Placement and Lifecycle
//!
//! Builds the VM control loop on top of [`nimbus_core`] jobs:
//!
//! ```text
//!   VmWorkStart job (queued on ("VirtualMachine", vm_id))
//!        │
//!        ▼
//!   VmEntityManager::reserve
//!        planner picks host + pools  ◀── Inventory, capacity ledger
//!        capacity CAS on host_capacity (re-plan on lost race)
//!        vm_reservation row (reserved)
//!        │
//!        ▼
//!   VmEntityManager::deploy
//!        reserved -> consumed (once)
//!        VmOrchestrator::start ──StartCommand──▶ host agent
//! ```
//!
//! # Modules
//!
//! - [`planner`]: placement strategies and their registry
//! - [`reservations`]: reservation rows and the host capacity ledger
//! - [`orchestrator`]: start/stop/destroy through the agent
//! - [`entity_manager`]: reserve and deploy
//! - [`handlers`]: the VM job handlers
//! - [`inventory`]: topology and the VM state CAS
//! - [`agent`]: host agent transport
//!
//! # Configuration
//!
//! See [`config::Config::from_env`].

#![deny(missing_docs)]

pub mod agent;
pub mod config;
pub mod db;
pub mod entity_manager;
pub mod error;
pub mod handlers;
pub mod inventory;
pub mod model;
pub mod orchestrator;
pub mod planner;
pub mod reservation_sweeper;
pub mod reservations;

pub use entity_manager::VmEntityManager;
pub use error::{Error, Result};
pub use orchestrator::VmOrchestrator;

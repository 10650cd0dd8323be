// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reservation records and the host capacity ledger.
//!
//! Capacity is taken and returned only by conditional updates:
//!
//! - taking capacity succeeds only while `used + requested <= total`
//! - returning capacity clamps at zero
//! - a reservation moves `reserved -> consumed` at most once, and only before
//!   it expires
//! - a reservation is released at most once; releasing returns its capacity
//!   in the same transaction

mod postgres;
mod sqlite;

pub use postgres::PostgresReservationStore;
pub use sqlite::SqliteReservationStore;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{DeployDestination, HostCapacity, VmReservation, VmReservationVolume};

/// Reservation to be written.
#[derive(Debug, Clone)]
pub struct NewReservation {
    /// Reservation id.
    pub id: Uuid,
    /// Reserved VM.
    pub vm_id: i64,
    /// CPU to hold.
    pub cpu: i64,
    /// Memory to hold.
    pub memory: i64,
    /// Placement being reserved.
    pub destination: DeployDestination,
    /// Release deadline if not consumed.
    pub expires_at: DateTime<Utc>,
}

/// Storage for reservations and host capacity.
#[async_trait::async_trait]
pub trait ReservationStore: Send + Sync {
    /// Create or refresh a host's capacity totals, keeping its usage.
    async fn ensure_host_capacity(&self, host_id: i64, total_cpu: i64, total_memory: i64)
    -> Result<()>;

    /// Ledger row of a host.
    async fn get_host_capacity(&self, host_id: i64) -> Result<Option<HostCapacity>>;

    /// Take capacity on the destination host and record the reservation.
    ///
    /// Returns `None`, writing nothing, when the host lacks the capacity.
    async fn create_reservation(
        &self,
        reservation: &NewReservation,
        now: DateTime<Utc>,
    ) -> Result<Option<VmReservation>>;

    /// Reservation by id.
    async fn get_reservation(&self, id: Uuid) -> Result<Option<VmReservation>>;

    /// Volume placements of a reservation.
    async fn reservation_volumes(&self, id: Uuid) -> Result<Vec<VmReservationVolume>>;

    /// Mark a live, unexpired reservation consumed. Returns whether this call
    /// consumed it.
    async fn consume_reservation(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Release a reserved or consumed reservation and return its capacity.
    /// Returns whether this call released it.
    async fn release_reservation(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Reserved or consumed reservations of a VM, oldest first.
    async fn active_reservations_for_vm(&self, vm_id: i64) -> Result<Vec<VmReservation>>;

    /// Reserved reservations whose deadline passed.
    async fn list_expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<VmReservation>>;
}

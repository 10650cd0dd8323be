// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite reservation store.
//!
//! Every transaction starts with its write so SQLite takes the write lock
//! before anything is read.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{NewReservation, ReservationStore};
use crate::error::Result;
use crate::model::{HostCapacity, VmReservation, VmReservationVolume};

/// SQLite-backed [`ReservationStore`].
#[derive(Clone)]
pub struct SqliteReservationStore {
    pool: SqlitePool,
}

impl SqliteReservationStore {
    /// Store over a pool whose schema was applied with
    /// [`crate::db::apply_sqlite_schema`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

async fn return_capacity(
    conn: &mut SqliteConnection,
    host_id: i64,
    cpu: i64,
    memory: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE host_capacity
        SET used_cpu = MAX(used_cpu - ?, 0),
            used_memory = MAX(used_memory - ?, 0)
        WHERE host_id = ?
        "#,
    )
    .bind(cpu)
    .bind(memory)
    .bind(host_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait::async_trait]
impl ReservationStore for SqliteReservationStore {
    async fn ensure_host_capacity(
        &self,
        host_id: i64,
        total_cpu: i64,
        total_memory: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO host_capacity (host_id, total_cpu, total_memory, used_cpu, used_memory)
            VALUES (?, ?, ?, 0, 0)
            ON CONFLICT (host_id) DO UPDATE
            SET total_cpu = excluded.total_cpu, total_memory = excluded.total_memory
            "#,
        )
        .bind(host_id)
        .bind(total_cpu)
        .bind(total_memory)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_host_capacity(&self, host_id: i64) -> Result<Option<HostCapacity>> {
        let row = sqlx::query_as::<_, HostCapacity>("SELECT * FROM host_capacity WHERE host_id = ?")
            .bind(host_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn create_reservation(
        &self,
        reservation: &NewReservation,
        now: DateTime<Utc>,
    ) -> Result<Option<VmReservation>> {
        let dest = &reservation.destination;
        let mut tx = self.pool.begin().await?;

        let taken = sqlx::query(
            r#"
            UPDATE host_capacity
            SET used_cpu = used_cpu + ?1, used_memory = used_memory + ?2
            WHERE host_id = ?3
              AND used_cpu + ?1 <= total_cpu
              AND used_memory + ?2 <= total_memory
            "#,
        )
        .bind(reservation.cpu)
        .bind(reservation.memory)
        .bind(dest.host_id)
        .execute(&mut *tx)
        .await?;

        if taken.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let record = sqlx::query_as::<_, VmReservation>(
            r#"
            INSERT INTO vm_reservation (id, vm_id, data_center_id, pod_id, cluster_id, host_id,
                                        cpu, memory, status, created, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'reserved', ?, ?)
            RETURNING *
            "#,
        )
        .bind(reservation.id)
        .bind(reservation.vm_id)
        .bind(dest.data_center_id)
        .bind(dest.pod_id)
        .bind(dest.cluster_id)
        .bind(dest.host_id)
        .bind(reservation.cpu)
        .bind(reservation.memory)
        .bind(now)
        .bind(reservation.expires_at)
        .fetch_one(&mut *tx)
        .await?;

        for (volume_id, pool_id) in &dest.volume_pools {
            sqlx::query(
                "INSERT INTO vm_reservation_volume (reservation_id, volume_id, pool_id) VALUES (?, ?, ?)",
            )
            .bind(reservation.id)
            .bind(volume_id)
            .bind(pool_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Some(record))
    }

    async fn get_reservation(&self, id: Uuid) -> Result<Option<VmReservation>> {
        let row = sqlx::query_as::<_, VmReservation>("SELECT * FROM vm_reservation WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn reservation_volumes(&self, id: Uuid) -> Result<Vec<VmReservationVolume>> {
        let rows = sqlx::query_as::<_, VmReservationVolume>(
            "SELECT * FROM vm_reservation_volume WHERE reservation_id = ? ORDER BY volume_id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn consume_reservation(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE vm_reservation
            SET status = 'consumed', consumed_at = ?1
            WHERE id = ?2 AND status = 'reserved' AND expires_at > ?1
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_reservation(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let released: Option<(i64, i64, i64)> = sqlx::query_as(
            r#"
            UPDATE vm_reservation
            SET status = 'released', released_at = ?
            WHERE id = ? AND status IN ('reserved', 'consumed')
            RETURNING host_id, cpu, memory
            "#,
        )
        .bind(now)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((host_id, cpu, memory)) = released else {
            tx.rollback().await?;
            return Ok(false);
        };

        return_capacity(&mut tx, host_id, cpu, memory).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn active_reservations_for_vm(&self, vm_id: i64) -> Result<Vec<VmReservation>> {
        let rows = sqlx::query_as::<_, VmReservation>(
            r#"
            SELECT * FROM vm_reservation
            WHERE vm_id = ? AND status IN ('reserved', 'consumed')
            ORDER BY created
            "#,
        )
        .bind(vm_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<VmReservation>> {
        let rows = sqlx::query_as::<_, VmReservation>(
            r#"
            SELECT * FROM vm_reservation
            WHERE status = 'reserved' AND expires_at <= ?
            ORDER BY expires_at
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

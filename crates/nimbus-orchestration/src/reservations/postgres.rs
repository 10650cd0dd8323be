// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL reservation store.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{NewReservation, ReservationStore};
use crate::error::Result;
use crate::model::{HostCapacity, VmReservation, VmReservationVolume};

/// PostgreSQL-backed [`ReservationStore`].
#[derive(Clone)]
pub struct PostgresReservationStore {
    pool: PgPool,
}

impl PostgresReservationStore {
    /// Store over a pool whose schema was applied with
    /// [`crate::db::apply_postgres_schema`].
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn return_capacity(
    conn: &mut PgConnection,
    host_id: i64,
    cpu: i64,
    memory: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE host_capacity
        SET used_cpu = GREATEST(used_cpu - $1, 0),
            used_memory = GREATEST(used_memory - $2, 0)
        WHERE host_id = $3
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
impl ReservationStore for PostgresReservationStore {
    async fn ensure_host_capacity(
        &self,
        host_id: i64,
        total_cpu: i64,
        total_memory: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO host_capacity (host_id, total_cpu, total_memory, used_cpu, used_memory)
            VALUES ($1, $2, $3, 0, 0)
            ON CONFLICT (host_id) DO UPDATE
            SET total_cpu = EXCLUDED.total_cpu, total_memory = EXCLUDED.total_memory
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
        let row =
            sqlx::query_as::<_, HostCapacity>("SELECT * FROM host_capacity WHERE host_id = $1")
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
            SET used_cpu = used_cpu + $1, used_memory = used_memory + $2
            WHERE host_id = $3
              AND used_cpu + $1 <= total_cpu
              AND used_memory + $2 <= total_memory
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'reserved', $9, $10)
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
                "INSERT INTO vm_reservation_volume (reservation_id, volume_id, pool_id) VALUES ($1, $2, $3)",
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
        let row = sqlx::query_as::<_, VmReservation>("SELECT * FROM vm_reservation WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn reservation_volumes(&self, id: Uuid) -> Result<Vec<VmReservationVolume>> {
        let rows = sqlx::query_as::<_, VmReservationVolume>(
            "SELECT * FROM vm_reservation_volume WHERE reservation_id = $1 ORDER BY volume_id",
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
            SET status = 'consumed', consumed_at = $1
            WHERE id = $2 AND status = 'reserved' AND expires_at > $1
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
            SET status = 'released', released_at = $1
            WHERE id = $2 AND status IN ('reserved', 'consumed')
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
            WHERE vm_id = $1 AND status IN ('reserved', 'consumed')
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
            WHERE status = 'reserved' AND expires_at <= $1
            ORDER BY expires_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeployDestination;
    use std::collections::BTreeMap;

    // Helper to get a test database pool
    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        nimbus_core::migrations::run_postgres(&pool).await.ok()?;
        crate::db::apply_postgres_schema(&pool).await.ok()?;
        Some(pool)
    }

    // Tests share one database, so each picks a host id nobody else uses.
    fn unique_host() -> i64 {
        (Uuid::new_v4().as_u128() % 1_000_000_000) as i64 + 1_000_000
    }

    #[tokio::test]
    async fn test_capacity_cas_on_postgres() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };
        let store = PostgresReservationStore::new(pool);
        let host_id = unique_host();
        store.ensure_host_capacity(host_id, 2, 2048).await.unwrap();

        let request = |vm_id| NewReservation {
            id: Uuid::new_v4(),
            vm_id,
            cpu: 2,
            memory: 1024,
            destination: DeployDestination {
                data_center_id: 1,
                pod_id: 1,
                cluster_id: 1,
                host_id,
                volume_pools: BTreeMap::new(),
            },
            expires_at: Utc::now() + chrono::Duration::minutes(5),
        };

        let first = request(1);
        assert!(store.create_reservation(&first, Utc::now()).await.unwrap().is_some());
        assert!(store.create_reservation(&request(2), Utc::now()).await.unwrap().is_none());

        assert!(store.consume_reservation(first.id, Utc::now()).await.unwrap());
        assert!(!store.consume_reservation(first.id, Utc::now()).await.unwrap());
        assert!(store.release_reservation(first.id, Utc::now()).await.unwrap());

        let cap = store.get_host_capacity(host_id).await.unwrap().unwrap();
        assert_eq!((cap.used_cpu, cap.used_memory), (0, 0));
    }
}

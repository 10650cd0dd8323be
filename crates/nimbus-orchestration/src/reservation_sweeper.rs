// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that releases reservations nobody deployed.
//!
//! A reservation holds host capacity until it is consumed. Reservations
//! still unconsumed past `expires_at` are released, returning the capacity.
//! Releasing is a compare-and-set, so several nodes may sweep at once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::reservations::ReservationStore;

const BATCH_SIZE: i64 = 100;

/// Periodically releases expired reservations.
pub struct ReservationSweeper {
    reservations: Arc<dyn ReservationStore>,
    poll_interval: Duration,
    shutdown: Arc<Notify>,
}

impl ReservationSweeper {
    /// Create a sweeper running every `poll_interval`.
    pub fn new(reservations: Arc<dyn ReservationStore>, poll_interval: Duration) -> Self {
        Self {
            reservations,
            poll_interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "Reservation sweeper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reservation sweeper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.poll_interval) => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "Failed to release expired reservations");
                    }
                }
            }
        }

        info!("Reservation sweeper stopped");
    }

    /// Release every expired reservation. Returns how many this call released.
    pub async fn sweep_once(&self) -> Result<u64> {
        let mut released = 0;
        loop {
            let now = Utc::now();
            let expired = self
                .reservations
                .list_expired_reservations(now, BATCH_SIZE)
                .await?;
            let fetched = expired.len();

            for reservation in expired {
                if self.reservations.release_reservation(reservation.id, now).await? {
                    info!(
                        reservation_id = %reservation.id,
                        vm_id = reservation.vm_id,
                        host_id = reservation.host_id,
                        "Expired reservation released"
                    );
                    released += 1;
                }
            }

            if (fetched as i64) < BATCH_SIZE {
                break;
            }
        }

        if released == 0 {
            debug!("No expired reservations");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeployDestination;
    use crate::reservations::{NewReservation, SqliteReservationStore};
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    async fn store() -> Arc<dyn ReservationStore> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        crate::db::apply_sqlite_schema(&pool)
            .await
            .expect("Failed to apply schema");
        Arc::new(SqliteReservationStore::new(pool))
    }

    async fn reserve(store: &Arc<dyn ReservationStore>, ttl: chrono::Duration) -> Uuid {
        let request = NewReservation {
            id: Uuid::new_v4(),
            vm_id: 1,
            cpu: 1,
            memory: 256,
            destination: DeployDestination {
                data_center_id: 1,
                pod_id: 1,
                cluster_id: 1,
                host_id: 1,
                volume_pools: BTreeMap::new(),
            },
            expires_at: Utc::now() + ttl,
        };
        store
            .create_reservation(&request, Utc::now())
            .await
            .unwrap()
            .unwrap();
        request.id
    }

    #[tokio::test]
    async fn test_sweep_releases_only_expired() {
        let store = store().await;
        store.ensure_host_capacity(1, 8, 8192).await.unwrap();
        let expired = reserve(&store, chrono::Duration::seconds(-1)).await;
        let live = reserve(&store, chrono::Duration::minutes(10)).await;

        let sweeper = ReservationSweeper::new(store.clone(), Duration::from_secs(60));
        assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);

        let status = |id| {
            let store = store.clone();
            async move { store.get_reservation(id).await.unwrap().unwrap().status }
        };
        assert_eq!(status(expired).await, "released");
        assert_eq!(status(live).await, "reserved");

        let cap = store.get_host_capacity(1).await.unwrap().unwrap();
        assert_eq!(cap.used_cpu, 1);
    }

    #[tokio::test]
    async fn test_consumed_reservations_are_not_swept() {
        let store = store().await;
        store.ensure_host_capacity(1, 8, 8192).await.unwrap();
        let id = reserve(&store, chrono::Duration::milliseconds(50)).await;
        assert!(store.consume_reservation(id, Utc::now()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sweeper = ReservationSweeper::new(store.clone(), Duration::from_secs(60));
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let sweeper = Arc::new(ReservationSweeper::new(
            store().await,
            Duration::from_millis(10),
        ));
        let shutdown = sweeper.shutdown_handle();
        let task = {
            let sweeper = sweeper.clone();
            tokio::spawn(async move { sweeper.run().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}

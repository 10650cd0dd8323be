// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database bootstrap.
//!
//! Orchestration shares the database with nimbus-core. Core owns
//! `_sqlx_migrations`; the reservation tables are created from idempotent
//! schema scripts applied after the core migrations.

use std::str::FromStr;
use std::sync::Arc;

use nimbus_core::{Persistence, PostgresPersistence, SqlitePersistence};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{PgPool, SqlitePool};
use tracing::info;

use crate::error::Result;
use crate::reservations::{PostgresReservationStore, ReservationStore, SqliteReservationStore};

/// Create the reservation tables on SQLite if missing.
pub async fn apply_sqlite_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(include_str!("../migrations/sqlite_schema.sql"))
        .execute(pool)
        .await?;
    Ok(())
}

/// Create the reservation tables on PostgreSQL if missing.
pub async fn apply_postgres_schema(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(include_str!("../migrations/postgres_schema.sql"))
        .execute(pool)
        .await?;
    Ok(())
}

/// Both stores over one database.
#[derive(Clone)]
pub struct Database {
    /// Job framework persistence.
    pub persistence: Arc<dyn Persistence>,
    /// Reservation and capacity store.
    pub reservations: Arc<dyn ReservationStore>,
}

impl Database {
    /// Wrap an SQLite pool, migrating it first.
    pub async fn sqlite(pool: SqlitePool) -> Result<Self> {
        nimbus_core::migrations::run_sqlite(&pool).await?;
        apply_sqlite_schema(&pool).await?;
        Ok(Self {
            persistence: Arc::new(SqlitePersistence::new(pool.clone())),
            reservations: Arc::new(SqliteReservationStore::new(pool)),
        })
    }

    /// Wrap a PostgreSQL pool, migrating it first.
    pub async fn postgres(pool: PgPool) -> Result<Self> {
        nimbus_core::migrations::run_postgres(&pool).await?;
        apply_postgres_schema(&pool).await?;
        Ok(Self {
            persistence: Arc::new(PostgresPersistence::new(pool.clone())),
            reservations: Arc::new(PostgresReservationStore::new(pool)),
        })
    }

    /// Connect by URL: `sqlite:` URLs use SQLite (the file is created when
    /// missing), anything else PostgreSQL.
    pub async fn connect(url: &str) -> Result<Self> {
        if url.starts_with("sqlite:") {
            let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?;
            info!("Connected to SQLite database");
            Self::sqlite(pool).await
        } else {
            let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
            info!("Connected to PostgreSQL database");
            Self::postgres(pool).await
        }
    }
}

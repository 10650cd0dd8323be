// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Nimbus Node - Management Server
//!
//! One management server of a nimbus cluster:
//! - Async job dispatch, heartbeat and recovery (nimbus-core)
//! - VM start/stop/destroy handlers backed by the placement planners
//! - Expired reservation sweeper

use std::sync::Arc;

use tracing::{info, warn};

use nimbus_core::JobRuntime;
use nimbus_orchestration::agent::HttpAgentClient;
use nimbus_orchestration::config::Config;
use nimbus_orchestration::db::Database;
use nimbus_orchestration::handlers::{register_vm_handlers, vm_resolvers};
use nimbus_orchestration::inventory::{Inventory, StaticInventory};
use nimbus_orchestration::planner::{PlannerContext, PlannerRegistry};
use nimbus_orchestration::reservation_sweeper::ReservationSweeper;
use nimbus_orchestration::{VmEntityManager, VmOrchestrator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nimbus_core=info,nimbus_orchestration=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        msid = config.core.msid,
        node_name = %config.core.node_name,
        inventory = %config.inventory_path.display(),
        "Starting Nimbus node"
    );

    let db = Database::connect(&config.core.database_url).await?;
    info!("Database schema verified");

    let inventory: Arc<dyn Inventory> =
        Arc::new(StaticInventory::from_file(&config.inventory_path).await?);
    let agent = Arc::new(HttpAgentClient::new(config.agent_port, config.agent_timeout)?);

    let orchestrator = Arc::new(VmOrchestrator::new(
        inventory.clone(),
        agent,
        db.reservations.clone(),
        config.agent_timeout,
    ));
    let manager = Arc::new(VmEntityManager::new(
        PlannerContext {
            inventory: inventory.clone(),
            reservations: db.reservations.clone(),
        },
        PlannerRegistry::with_defaults(),
        orchestrator,
        config.reservation_ttl,
        config.placement_attempts,
    ));

    let mut registry = nimbus_core::HandlerRegistry::new();
    register_vm_handlers(&mut registry, manager);

    let runtime = JobRuntime::builder()
        .persistence(db.persistence.clone())
        .msid(config.core.msid)
        .node_name(&config.core.node_name)
        .registry(registry)
        .resolvers(vm_resolvers(inventory))
        .config(config.core.runtime.clone())
        .build()?
        .start()
        .await?;

    let sweeper = Arc::new(ReservationSweeper::new(
        db.reservations.clone(),
        config.reservation_sweep_interval,
    ));
    let sweeper_shutdown = sweeper.shutdown_handle();
    let sweeper_task = {
        let sweeper = sweeper.clone();
        tokio::spawn(async move { sweeper.run().await })
    };

    info!(msid = runtime.msid(), "Nimbus node ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    sweeper_shutdown.notify_one();
    if let Err(e) = sweeper_task.await {
        warn!("Reservation sweeper panicked: {}", e);
    }
    runtime.shutdown().await?;

    info!("Nimbus node shut down");

    Ok(())
}

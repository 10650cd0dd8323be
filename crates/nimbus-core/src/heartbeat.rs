// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node liveness heartbeat.
//!
//! Keeps this node's `mshost` row fresh so that other nodes' recovery
//! monitors do not treat it as dead.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::persistence::Persistence;

/// Periodically stamps this node's heartbeat.
pub struct NodeHeartbeat {
    persistence: Arc<dyn Persistence>,
    msid: i64,
    name: String,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl NodeHeartbeat {
    /// Create a heartbeat for node `msid`.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        msid: i64,
        name: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            persistence,
            msid,
            name: name.into(),
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Register the node row (or mark it up again).
    pub async fn register(&self) -> Result<()> {
        self.persistence
            .register_node(self.msid, &self.name, Utc::now())
            .await?;
        info!(msid = self.msid, name = %self.name, "Node registered");
        Ok(())
    }

    /// Stamp one heartbeat, re-registering if the row disappeared.
    pub async fn beat(&self) -> Result<()> {
        if !self.persistence.heartbeat_node(self.msid, Utc::now()).await? {
            warn!(msid = self.msid, "Node row missing, registering again");
            self.register().await?;
        } else {
            debug!(msid = self.msid, "Heartbeat");
        }
        Ok(())
    }

    /// Run until shutdown.
    pub async fn run(&self) {
        info!(
            msid = self.msid,
            interval_secs = self.interval.as_secs(),
            "Node heartbeat started"
        );

        if let Err(e) = self.register().await {
            error!(error = %e, "Failed to register node");
        }

        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately; registration just stamped.
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Node heartbeat received shutdown signal");
                    break;
                }

                _ = interval.tick() => {
                    if let Err(e) = self.beat().await {
                        error!(error = %e, "Failed to record heartbeat");
                    }
                }
            }
        }

        info!("Node heartbeat stopped");
    }
}

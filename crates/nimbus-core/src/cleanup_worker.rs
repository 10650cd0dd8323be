// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that expunges finished jobs.
//!
//! Terminal jobs whose last update is older than `max_age` are soft-removed
//! in batches (status queries then report them as not found), and sync
//! queues that have stayed empty for as long are deleted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::{CoreError, Result};
use crate::persistence::Persistence;

/// Configuration for the job cleanup worker.
#[derive(Debug, Clone)]
pub struct JobCleanupConfig {
    /// Whether cleanup runs at all.
    pub enabled: bool,
    /// How often to run cleanup.
    pub poll_interval: Duration,
    /// Age of a finished job before it is removed.
    pub max_age: Duration,
    /// Jobs removed per statement.
    pub batch_size: i64,
}

impl Default for JobCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: Duration::from_secs(3600),
            max_age: Duration::from_secs(24 * 3600),
            batch_size: 100,
        }
    }
}

impl JobCleanupConfig {
    /// Load configuration from environment variables.
    ///
    /// - `NIMBUS_JOB_CLEANUP_ENABLED`: "true" or "1" to enable (default: false)
    /// - `NIMBUS_JOB_CLEANUP_INTERVAL_SECS`: seconds between runs (default: 3600)
    /// - `NIMBUS_JOB_CLEANUP_MAX_AGE_HOURS`: hours before a finished job is removed (default: 24)
    /// - `NIMBUS_JOB_CLEANUP_BATCH_SIZE`: jobs per batch (default: 100)
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let enabled = var("NIMBUS_JOB_CLEANUP_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(defaults.enabled);

        let poll_interval = var("NIMBUS_JOB_CLEANUP_INTERVAL_SECS")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_interval);

        let max_age = var("NIMBUS_JOB_CLEANUP_MAX_AGE_HOURS")
            .and_then(|v| v.parse::<u64>().ok())
            .map(|hours| Duration::from_secs(hours * 3600))
            .unwrap_or(defaults.max_age);

        let batch_size = var("NIMBUS_JOB_CLEANUP_BATCH_SIZE")
            .and_then(|v| v.parse().ok())
            .filter(|n: &i64| *n > 0)
            .unwrap_or(defaults.batch_size);

        Self {
            enabled,
            poll_interval,
            max_age,
            batch_size,
        }
    }
}

/// Counts from one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Jobs soft-removed.
    pub jobs_removed: u64,
    /// Empty queues deleted.
    pub queues_purged: u64,
}

/// Background worker that removes old finished jobs.
pub struct JobCleanupWorker {
    persistence: Arc<dyn Persistence>,
    config: JobCleanupConfig,
    shutdown: Arc<Notify>,
}

impl JobCleanupWorker {
    /// Create a new cleanup worker.
    pub fn new(persistence: Arc<dyn Persistence>, config: JobCleanupConfig) -> Self {
        Self {
            persistence,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the cleanup loop until shutdown.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Job cleanup worker disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_hours = self.config.max_age.as_secs() / 3600,
            batch_size = self.config.batch_size,
            "Job cleanup worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Job cleanup worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.cleanup_once().await {
                        error!(error = %e, "Failed to clean up finished jobs");
                    }
                }
            }
        }

        info!("Job cleanup worker stopped");
    }

    /// One cleanup pass.
    pub async fn cleanup_once(&self) -> Result<CleanupReport> {
        let max_age = chrono::Duration::from_std(self.config.max_age)
            .map_err(|e| CoreError::validation("max_age", e.to_string()))?;
        let cutoff = Utc::now() - max_age;

        let mut report = CleanupReport::default();
        loop {
            let removed = self
                .persistence
                .remove_terminal_jobs(cutoff, Utc::now(), self.config.batch_size)
                .await?;
            report.jobs_removed += removed;
            if removed < self.config.batch_size as u64 {
                break;
            }
        }

        report.queues_purged = self.persistence.purge_empty_queues(cutoff).await?;

        if report.jobs_removed > 0 || report.queues_purged > 0 {
            info!(
                jobs_removed = report.jobs_removed,
                queues_purged = report.queues_purged,
                cutoff = %cutoff,
                "Job cleanup cycle completed"
            );
        } else {
            debug!("Job cleanup cycle completed, nothing to remove");
        }
        Ok(report)
    }
}

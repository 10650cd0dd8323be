// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use crate::cleanup_worker::JobCleanupConfig;

/// Tunables of a running node, independent of where they came from.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker pool size (handlers running at once on this node).
    pub max_concurrent_jobs: usize,
    /// Dispatcher tick when nothing wakes it earlier.
    pub dispatch_poll_interval: Duration,
    /// How often this node stamps its liveness row.
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which another node is considered dead.
    pub node_timeout: Duration,
    /// `last_updated` age after which a dead node's running job is requeued.
    pub job_stale_after: Duration,
    /// Job expunge settings.
    pub cleanup: JobCleanupConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 16,
            dispatch_poll_interval: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_secs(10),
            node_timeout: Duration::from_secs(60),
            job_stale_after: Duration::from_secs(120),
            cleanup: JobCleanupConfig::default(),
        }
    }
}

/// Nimbus node configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// This management server's id
    pub msid: i64,
    /// Name recorded in the liveness table
    pub node_name: String,
    /// Worker, heartbeat and recovery tunables
    pub runtime: RuntimeConfig,
}

fn parse_or<T: std::str::FromStr>(
    key: &'static str,
    default: T,
    message: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid(key, message)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `NIMBUS_DATABASE_URL`: PostgreSQL or SQLite connection string
    /// - `NIMBUS_MSID`: this node's id (positive integer)
    ///
    /// Optional (with defaults):
    /// - `NIMBUS_NODE_NAME`: liveness row name (default: `nimbus-<msid>`)
    /// - `NIMBUS_MAX_CONCURRENT_JOBS`: worker pool size (default: 16)
    /// - `NIMBUS_DISPATCH_POLL_INTERVAL_MS`: dispatcher tick (default: 1000)
    /// - `NIMBUS_HEARTBEAT_INTERVAL_SECS`: liveness heartbeat (default: 10)
    /// - `NIMBUS_NODE_TIMEOUT_SECS`: heartbeat age that marks a node dead (default: 60)
    /// - `NIMBUS_JOB_STALE_SECS`: requeue threshold for a dead node's jobs (default: 120)
    /// - `NIMBUS_JOB_CLEANUP_*`: see [`JobCleanupConfig::from_env`]
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("NIMBUS_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("NIMBUS_DATABASE_URL"))?;

        let msid: i64 = std::env::var("NIMBUS_MSID")
            .map_err(|_| ConfigError::Missing("NIMBUS_MSID"))?
            .parse()
            .map_err(|_| ConfigError::Invalid("NIMBUS_MSID", "must be a positive integer"))?;
        if msid <= 0 {
            return Err(ConfigError::Invalid(
                "NIMBUS_MSID",
                "must be a positive integer",
            ));
        }

        let node_name =
            std::env::var("NIMBUS_NODE_NAME").unwrap_or_else(|_| format!("nimbus-{}", msid));

        let max_concurrent_jobs: usize = parse_or(
            "NIMBUS_MAX_CONCURRENT_JOBS",
            16,
            "must be a positive integer",
        )?;
        if max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "NIMBUS_MAX_CONCURRENT_JOBS",
                "must be a positive integer",
            ));
        }

        let poll_ms: u64 = parse_or(
            "NIMBUS_DISPATCH_POLL_INTERVAL_MS",
            1000,
            "must be a number of milliseconds",
        )?;
        let heartbeat_secs: u64 = parse_or(
            "NIMBUS_HEARTBEAT_INTERVAL_SECS",
            10,
            "must be a number of seconds",
        )?;
        let node_timeout_secs: u64 =
            parse_or("NIMBUS_NODE_TIMEOUT_SECS", 60, "must be a number of seconds")?;
        let stale_secs: u64 =
            parse_or("NIMBUS_JOB_STALE_SECS", 120, "must be a number of seconds")?;

        if node_timeout_secs <= heartbeat_secs {
            return Err(ConfigError::Invalid(
                "NIMBUS_NODE_TIMEOUT_SECS",
                "must be greater than NIMBUS_HEARTBEAT_INTERVAL_SECS",
            ));
        }

        Ok(Self {
            database_url,
            msid,
            node_name,
            runtime: RuntimeConfig {
                max_concurrent_jobs,
                dispatch_poll_interval: Duration::from_millis(poll_ms),
                heartbeat_interval: Duration::from_secs(heartbeat_secs),
                node_timeout: Duration::from_secs(node_timeout_secs),
                job_stale_after: Duration::from_secs(stale_secs),
                cleanup: JobCleanupConfig::from_env(),
            },
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

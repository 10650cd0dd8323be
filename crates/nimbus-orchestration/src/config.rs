// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration of an orchestration node.

use std::path::PathBuf;
use std::time::Duration;

use nimbus_core::config::{Config as CoreConfig, ConfigError};

/// Orchestration node configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Job framework settings (database, msid, workers)
    pub core: CoreConfig,
    /// Topology JSON file
    pub inventory_path: PathBuf,
    /// Port host agents listen on
    pub agent_port: u16,
    /// Timeout of one agent command
    pub agent_timeout: Duration,
    /// Lifetime of an unconsumed reservation
    pub reservation_ttl: Duration,
    /// How often expired reservations are swept
    pub reservation_sweep_interval: Duration,
    /// Placement attempts after losing a capacity race
    pub placement_attempts: u32,
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
    /// Everything [`CoreConfig::from_env`] reads, plus:
    ///
    /// Required:
    /// - `NIMBUS_INVENTORY_PATH`: topology JSON file
    ///
    /// Optional (with defaults):
    /// - `NIMBUS_AGENT_PORT`: host agent HTTP port (default: 8250)
    /// - `NIMBUS_AGENT_TIMEOUT_SECS`: agent command timeout (default: 60)
    /// - `NIMBUS_RESERVATION_TTL_SECS`: unconsumed reservation lifetime (default: 600)
    /// - `NIMBUS_RESERVATION_SWEEP_INTERVAL_SECS`: expiry sweep period (default: 30)
    /// - `NIMBUS_PLACEMENT_ATTEMPTS`: re-plans after a lost capacity race (default: 3)
    pub fn from_env() -> Result<Self, ConfigError> {
        let core = CoreConfig::from_env()?;

        let inventory_path = std::env::var("NIMBUS_INVENTORY_PATH")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::Missing("NIMBUS_INVENTORY_PATH"))?;

        let agent_port: u16 = parse_or("NIMBUS_AGENT_PORT", 8250, "must be a port number")?;
        let agent_timeout_secs: u64 = parse_or(
            "NIMBUS_AGENT_TIMEOUT_SECS",
            60,
            "must be a number of seconds",
        )?;
        let ttl_secs: u64 = parse_or(
            "NIMBUS_RESERVATION_TTL_SECS",
            600,
            "must be a number of seconds",
        )?;
        let sweep_secs: u64 = parse_or(
            "NIMBUS_RESERVATION_SWEEP_INTERVAL_SECS",
            30,
            "must be a number of seconds",
        )?;
        let placement_attempts: u32 = parse_or(
            "NIMBUS_PLACEMENT_ATTEMPTS",
            3,
            "must be a positive integer",
        )?;
        if placement_attempts == 0 {
            return Err(ConfigError::Invalid(
                "NIMBUS_PLACEMENT_ATTEMPTS",
                "must be a positive integer",
            ));
        }
        if agent_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "NIMBUS_AGENT_TIMEOUT_SECS",
                "must be greater than zero",
            ));
        }

        Ok(Self {
            core,
            inventory_path,
            agent_port,
            agent_timeout: Duration::from_secs(agent_timeout_secs),
            reservation_ttl: Duration::from_secs(ttl_secs),
            reservation_sweep_interval: Duration::from_secs(sweep_secs),
            placement_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Sets env vars for a test and restores them on drop
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    fn base_env(guard: &mut EnvGuard) {
        guard.set("NIMBUS_DATABASE_URL", "sqlite::memory:");
        guard.set("NIMBUS_MSID", "2");
        guard.set("NIMBUS_INVENTORY_PATH", "/etc/nimbus/topology.json");
        for key in [
            "NIMBUS_AGENT_PORT",
            "NIMBUS_AGENT_TIMEOUT_SECS",
            "NIMBUS_RESERVATION_TTL_SECS",
            "NIMBUS_RESERVATION_SWEEP_INTERVAL_SECS",
            "NIMBUS_PLACEMENT_ATTEMPTS",
            "NIMBUS_HEARTBEAT_INTERVAL_SECS",
            "NIMBUS_NODE_TIMEOUT_SECS",
            "NIMBUS_MAX_CONCURRENT_JOBS",
        ] {
            guard.remove(key);
        }
    }

    #[test]
    fn test_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        base_env(&mut guard);

        let config = Config::from_env().unwrap();
        assert_eq!(config.core.msid, 2);
        assert_eq!(
            config.inventory_path,
            PathBuf::from("/etc/nimbus/topology.json")
        );
        assert_eq!(config.agent_port, 8250);
        assert_eq!(config.agent_timeout, Duration::from_secs(60));
        assert_eq!(config.reservation_ttl, Duration::from_secs(600));
        assert_eq!(config.reservation_sweep_interval, Duration::from_secs(30));
        assert_eq!(config.placement_attempts, 3);
    }

    #[test]
    fn test_custom_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        base_env(&mut guard);
        guard.set("NIMBUS_AGENT_PORT", "9000");
        guard.set("NIMBUS_RESERVATION_TTL_SECS", "5");
        guard.set("NIMBUS_PLACEMENT_ATTEMPTS", "7");

        let config = Config::from_env().unwrap();
        assert_eq!(config.agent_port, 9000);
        assert_eq!(config.reservation_ttl, Duration::from_secs(5));
        assert_eq!(config.placement_attempts, 7);
    }

    #[test]
    fn test_missing_inventory_path() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        base_env(&mut guard);
        guard.remove("NIMBUS_INVENTORY_PATH");

        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Missing("NIMBUS_INVENTORY_PATH")
        ));
    }

    #[test]
    fn test_invalid_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        base_env(&mut guard);

        guard.set("NIMBUS_AGENT_PORT", "70000");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("NIMBUS_AGENT_PORT", _)
        ));
        guard.remove("NIMBUS_AGENT_PORT");

        guard.set("NIMBUS_PLACEMENT_ATTEMPTS", "0");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("NIMBUS_PLACEMENT_ATTEMPTS", _)
        ));
    }
}

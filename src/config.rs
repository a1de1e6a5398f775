//! Daemon configuration, loaded from a `fleetd.toml` file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration structure matching the `fleetd.toml` schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Directory holding `pool-state.json`, `registry.json`, `dispatch-audit.jsonl`.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// Address the operator WebSocket + daemon health endpoint binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Address the in-VM runner registration endpoint binds to.
    #[serde(default = "default_registration_addr")]
    pub registration_addr: String,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_warm_size")]
    pub warm_size: usize,
    #[serde(default = "default_max_vms")]
    pub max_vms: usize,
    #[serde(default = "default_master_name")]
    pub master_name: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            warm_size: default_warm_size(),
            max_vms: default_max_vms(),
            master_name: default_master_name(),
        }
    }
}

fn default_base_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".agentkernel/fleet")
    } else {
        PathBuf::from("/tmp/agentkernel-fleet")
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:7080".to_string()
}

fn default_registration_addr() -> String {
    "127.0.0.1:7081".to_string()
}

fn default_warm_size() -> usize {
    3
}

fn default_max_vms() -> usize {
    10
}

fn default_master_name() -> String {
    "agent-master".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            bind_addr: default_bind_addr(),
            registration_addr: default_registration_addr(),
            pool: PoolSettings::default(),
            log_level: default_log_level(),
        }
    }
}

impl FleetConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse fleetd TOML configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = FleetConfig::default();
        assert_eq!(config.pool.warm_size, 3);
        assert_eq!(config.pool.max_vms, 10);
        assert_eq!(config.pool.master_name, "agent-master");
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml = r#"
            bind_addr = "0.0.0.0:9000"

            [pool]
            warm_size = 5
            max_vms = 20
        "#;
        let config = FleetConfig::from_str(toml).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.pool.warm_size, 5);
        assert_eq!(config.pool.max_vms, 20);
        assert_eq!(config.pool.master_name, "agent-master");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn parses_full_toml() {
        let toml = r#"
            base_dir = "/var/lib/fleetd"
            bind_addr = "127.0.0.1:8080"
            registration_addr = "127.0.0.1:8081"
            log_level = "debug"

            [pool]
            warm_size = 2
            max_vms = 4
            master_name = "golden-master"
        "#;
        let config = FleetConfig::from_str(toml).unwrap();
        assert_eq!(config.base_dir, PathBuf::from("/var/lib/fleetd"));
        assert_eq!(config.pool.master_name, "golden-master");
        assert_eq!(config.log_level, "debug");
    }
}

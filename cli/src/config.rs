// Configuration management for the PeerMesh CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/peermesh/config.json
// - Linux: ~/.config/peermesh/config.json
// - Windows: %APPDATA%\peermesh\config.json

use anyhow::{Context, Result};
use peermesh_core::CoordinatorConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage path for the record store (defaults to the data directory)
    pub storage_path: Option<String>,

    /// Directory for rolling log files; stderr only when unset
    pub log_dir: Option<String>,

    /// Coordinator tuning
    pub coordinator: CoordinatorConfig,
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("peermesh");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("peermesh");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Resolved record store location
    pub fn storage_dir(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("store")),
        }
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value (in memory; call `save` to persist)
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let c = &mut self.coordinator;
        match key {
            "storage_path" => self.storage_path = non_empty(value),
            "log_dir" => self.log_dir = non_empty(value),
            "maintenance_interval_ms" => {
                c.maintenance.interval_ms = value.parse().context("Invalid number")?;
            }
            "peer_max_age_ms" => {
                c.maintenance.peer_max_age_ms = value.parse().context("Invalid number")?;
            }
            "connecting_timeout_ms" => {
                c.maintenance.connecting_timeout_ms = value.parse().context("Invalid number")?;
            }
            "topology_probability" => {
                c.maintenance.topology_probability = parse_probability(value)?;
            }
            "retention_probability" => {
                c.maintenance.retention_probability = parse_probability(value)?;
            }
            "min_degree" => c.topology.min_degree = value.parse().context("Invalid number")?,
            "max_degree" => c.topology.max_degree = value.parse().context("Invalid number")?,
            "announce_fanout" => {
                c.topology.announce_fanout = value.parse().context("Invalid number")?;
            }
            "announce_jitter_ms" => {
                c.topology.announce_jitter_ms = value.parse().context("Invalid number")?;
            }
            "signal_ttl_ms" => c.retention.signal_ttl_ms = value.parse().context("Invalid number")?,
            "data_ttl_ms" => c.retention.data_ttl_ms = value.parse().context("Invalid number")?,
            "rng_seed" => {
                c.rng_seed = if value.is_empty() {
                    None
                } else {
                    Some(value.parse().context("Invalid seed")?)
                };
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let c = &self.coordinator;
        vec![
            ("storage_path".to_string(), self.storage_path.clone().unwrap_or_else(|| "(auto)".to_string())),
            ("log_dir".to_string(), self.log_dir.clone().unwrap_or_else(|| "(stderr)".to_string())),
            ("maintenance_interval_ms".to_string(), c.maintenance.interval_ms.to_string()),
            ("peer_max_age_ms".to_string(), c.maintenance.peer_max_age_ms.to_string()),
            ("connecting_timeout_ms".to_string(), c.maintenance.connecting_timeout_ms.to_string()),
            ("topology_probability".to_string(), c.maintenance.topology_probability.to_string()),
            ("retention_probability".to_string(), c.maintenance.retention_probability.to_string()),
            ("min_degree".to_string(), c.topology.min_degree.to_string()),
            ("max_degree".to_string(), c.topology.max_degree.to_string()),
            ("announce_fanout".to_string(), c.topology.announce_fanout.to_string()),
            ("announce_jitter_ms".to_string(), c.topology.announce_jitter_ms.to_string()),
            ("signal_ttl_ms".to_string(), c.retention.signal_ttl_ms.to_string()),
            ("data_ttl_ms".to_string(), c.retention.data_ttl_ms.to_string()),
            ("rng_seed".to_string(), c.rng_seed.map_or_else(|| "(random)".to_string(), |s| s.to_string())),
        ]
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_probability(value: &str) -> Result<f64> {
    let p: f64 = value.parse().context("Invalid probability")?;
    if !(0.0..=1.0).contains(&p) {
        anyhow::bail!("Probability must be between 0 and 1: {}", p);
    }
    Ok(p)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.storage_path.is_none());
        assert_eq!(config.coordinator.maintenance.interval_ms, 120_000);
        assert_eq!(config.get("max_degree").as_deref(), Some("6"));
    }

    #[test]
    fn test_set_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        config.set("topology_probability", "0.5").unwrap();
        config.set("rng_seed", "42").unwrap();
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.coordinator.maintenance.topology_probability, 0.5);
        assert_eq!(reloaded.coordinator.rng_seed, Some(42));
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.set("topology_probability", "1.5").is_err());
        assert!(config.set("min_degree", "three").is_err());
        assert!(config.set("no_such_key", "1").is_err());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"log_dir": "/tmp/peermesh-logs"}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.log_dir.as_deref(), Some("/tmp/peermesh-logs"));
        assert_eq!(config.coordinator.limits.peers, 20);
    }
}

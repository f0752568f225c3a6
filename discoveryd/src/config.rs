use std::path::{Path, PathBuf};
use serde::Deserialize;
use anyhow::{Context, Result};
use robot_discovery::{DiscoveryOptions, ProbeOptions};
use shared::protocol::{DEFAULT_PROBE_TIMEOUT_MS, ROBOT_SERVICE_TYPE};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    #[serde(default)]
    pub name_filter: Vec<String>,
    #[serde(default)]
    pub ip_filter: Vec<String>,
    #[serde(default)]
    pub port_filter: Vec<u16>,
    /// Addresses handed to `add()` at startup
    #[serde(default)]
    pub manual_candidates: Vec<ManualCandidate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManualCandidate {
    pub ip: String,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_persist_interval")]
    pub persist_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_service_type() -> String {
    ROBOT_SERVICE_TYPE.to_string()
}

fn default_probe_timeout() -> u64 {
    DEFAULT_PROBE_TIMEOUT_MS
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/robot-discovery/directory.db")
}

fn default_persist_interval() -> u64 {
    30
}

fn default_listen() -> String {
    "127.0.0.1:31949".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            poll_interval_ms: None,
            probe_timeout_ms: default_probe_timeout(),
            name_filter: Vec::new(),
            ip_filter: Vec::new(),
            port_filter: Vec::new(),
            manual_candidates: Vec::new(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            persist_interval_secs: default_persist_interval(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl DiscoveryConfig {
    /// Client options, without any persisted state
    pub fn options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            poll_interval_ms: self.poll_interval_ms,
            name_filter: self.name_filter.clone(),
            ip_filter: self.ip_filter.clone(),
            port_filter: self.port_filter.clone(),
            ..Default::default()
        }
    }

    pub fn probe(&self) -> ProbeOptions {
        ProbeOptions {
            probe_timeout_ms: self.probe_timeout_ms,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.discovery.service_type, "_http._tcp.local.");
        assert_eq!(config.discovery.probe_timeout_ms, 3000);
        assert_eq!(config.store.persist_interval_secs, 30);
        assert_eq!(config.api.listen, "127.0.0.1:31949");
        assert_eq!(
            config.discovery.options().poll_interval(),
            std::time::Duration::from_millis(5000)
        );
    }

    #[test]
    fn test_full_config() {
        let config: Config = toml::from_str(
            r#"
            [discovery]
            poll_interval_ms = 1000
            name_filter = ["opentrons"]
            port_filter = [31950]

            [[discovery.manual_candidates]]
            ip = "169.254.1.2"

            [[discovery.manual_candidates]]
            ip = "localhost"
            port = 31951

            [store]
            db_path = "/tmp/directory.db"

            [api]
            listen = "0.0.0.0:8080"
            "#,
        )
        .unwrap();

        let options = config.discovery.options();
        assert_eq!(options.poll_interval(), std::time::Duration::from_millis(1000));
        assert_eq!(options.filters().name, vec!["opentrons"]);
        assert_eq!(config.discovery.manual_candidates.len(), 2);
        assert_eq!(config.discovery.manual_candidates[1].port, Some(31951));
        assert_eq!(config.store.db_path, PathBuf::from("/tmp/directory.db"));
        assert_eq!(config.api.listen, "0.0.0.0:8080");
    }
}

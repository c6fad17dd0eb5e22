//! Configuration management for the transaction watcher
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::error::{WatcherError, WatcherResult};

use alloy_primitives::B256;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub watcher: WatcherConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    pub networks: HashMap<String, NetworkConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    pub instance_id: String,
    /// Bound on a single watch
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Records kept by the retention policy
    #[serde(default = "default_retention_limit")]
    pub retention_limit: usize,
    pub health_check_interval_secs: u64,
}

fn default_timeout_secs() -> u64 {
    90
}

fn default_retention_limit() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Empty selects the in-memory store
    #[serde(default)]
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
    pub enabled: bool,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub genesis_hash: String,
    pub name: String,
    pub ws_url: String,
    pub explorer_url: Option<String>,
    /// JSON type registry; the built-in registry is used when absent
    pub registry_path: Option<String>,
    pub enabled: bool,
}

impl NetworkConfig {
    pub fn genesis_hash(&self) -> WatcherResult<B256> {
        self.genesis_hash.parse::<B256>().map_err(|e| {
            WatcherError::Config(format!(
                "network {} has an invalid genesis hash: {}",
                self.name, e
            ))
        })
    }
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("TX_WATCHER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_networks().is_empty() {
            anyhow::bail!("At least one network must be enabled");
        }

        if self.watcher.timeout_secs == 0 {
            anyhow::bail!("watcher.timeout_secs must be positive");
        }
        if self.watcher.retention_limit == 0 {
            anyhow::bail!("watcher.retention_limit must be positive");
        }

        for (key, network) in self.enabled_networks() {
            if network.ws_url.is_empty() {
                anyhow::bail!("Network {} has no WebSocket URL configured", key);
            }
            network.genesis_hash()?;
            if network.explorer_url.is_none() {
                tracing::warn!("Network {} has no explorer URL - notifications carry no link", key);
            }
        }

        Ok(())
    }

    /// Get list of enabled networks
    pub fn enabled_networks(&self) -> Vec<(&String, &NetworkConfig)> {
        let mut networks: Vec<_> = self.networks.iter().filter(|(_, n)| n.enabled).collect();
        networks.sort_by(|a, b| a.0.cmp(b.0));
        networks
    }

    /// Whether records live in memory only
    pub fn uses_memory_store(&self) -> bool {
        self.database.url.trim().is_empty()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };

    re.replace_all(input, |cap: &regex::Captures| {
        env::var(&cap[1]).unwrap_or_default()
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[watcher]
instance_id = "watcher-1"
health_check_interval_secs = 30

[database]
url = "${TX_WATCHER_TEST_DB}"
max_connections = 5
min_connections = 1

[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090

[networks.polkadot]
genesis_hash = "0x91b171bb158e2d3848fa23a9f1c25182fb8e20313b2c1eb49219da7a70ce90c3"
name = "Polkadot"
ws_url = "wss://rpc.polkadot.io"
explorer_url = "https://polkadot.subscan.io"
enabled = true

[networks.kusama]
genesis_hash = "0xb0a8d493285c2df73290dfb7e61f870f17b41801197a149ca93654499ea3dafe"
name = "Kusama"
ws_url = "wss://kusama-rpc.polkadot.io"
enabled = false
"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_with_defaults() {
        env::set_var("TX_WATCHER_TEST_DB", "");
        let file = write_config(SAMPLE);
        let settings = Settings::load_from(file.path()).unwrap();

        assert_eq!(settings.watcher.timeout_secs, 90);
        assert_eq!(settings.watcher.retention_limit, 100);
        assert!(settings.notifications.enabled);
        assert!(settings.uses_memory_store());

        let enabled = settings.enabled_networks();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].1.name, "Polkadot");
        assert_eq!(
            enabled[0].1.genesis_hash().unwrap().to_string(),
            "0x91b171bb158e2d3848fa23a9f1c25182fb8e20313b2c1eb49219da7a70ce90c3"
        );
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let no_networks = SAMPLE.replace("enabled = true", "enabled = false");
        tokio_test::assert_err!(Settings::load_from(write_config(&no_networks).path()));

        let bad_genesis = SAMPLE.replace("0x91b171bb", "0xzz");
        tokio_test::assert_err!(Settings::load_from(write_config(&bad_genesis).path()));

        let zero_timeout = SAMPLE.replace(
            "instance_id = \"watcher-1\"",
            "instance_id = \"watcher-1\"\ntimeout_secs = 0",
        );
        tokio_test::assert_err!(Settings::load_from(write_config(&zero_timeout).path()));
    }
}

//! Agent configuration
//!
//! TOML file under the OS config directory. Defaults match the observed
//! behavior of the deployed system (retry intervals, backend timeout,
//! device filter), so a missing file yields a working agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub backend: BackendConfig,
    pub device: DeviceConfig,
    pub location: LocationConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Case-insensitive substring matched against bonded device names;
    /// the first match wins.
    pub name_filter: String,
    /// System device name used as an identity-recovery hint.
    pub system_name: Option<String>,
    /// Reachable devices for the TCP development adapter.
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: String,
    pub display_name: String,
    pub alias: Option<String>,
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationConfig {
    pub update_interval_ms: u64,
    pub min_update_interval_ms: u64,
    /// Fixed coordinate replayed by the TCP development adapter.
    pub fixed: Option<FixedLocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedLocation {
    pub lat: f64,
    pub lon: f64,
    pub accuracy_m: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub mode_fetch_delay_ms: u64,
    pub mode_fetch_limit: u32,
    pub reconnect_delay_ms: u64,
    pub post_retry_delay_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                base_url: "http://127.0.0.1:1880".to_string(),
                request_timeout_ms: 5_000,
            },
            device: DeviceConfig {
                name_filter: "watch".to_string(),
                system_name: None,
                devices: Vec::new(),
            },
            location: LocationConfig {
                update_interval_ms: 30_000,
                min_update_interval_ms: 5_000,
                fixed: None,
            },
            retry: RetryConfig {
                mode_fetch_delay_ms: 500,
                mode_fetch_limit: 8,
                reconnect_delay_ms: 3_000,
                post_retry_delay_ms: 3_000,
            },
        }
    }
}

impl AgentConfig {
    /// Load config from the OS-specific location, or defaults on first run.
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;
        if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path).await?;
            let config: AgentConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to the OS-specific location.
    pub async fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path()?;
        if let Some(parent) = config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&config_path, content).await?;
        Ok(())
    }

    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("could not find config directory"))?;
        path.push("wristlink");
        path.push("config.toml");
        Ok(path)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_the_deployed_constants() {
        let config = AgentConfig::default();
        assert_eq!(config.retry.mode_fetch_delay_ms, 500);
        assert_eq!(config.retry.mode_fetch_limit, 8);
        assert_eq!(config.retry.reconnect_delay_ms, 3_000);
        assert_eq!(config.backend.request_timeout_ms, 5_000);
        assert_eq!(config.device.name_filter, "watch");
    }

    #[test]
    fn config_file_path_is_scoped_to_the_app() {
        let path = AgentConfig::config_file_path().unwrap();
        assert!(path.to_string_lossy().contains("wristlink"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn config_round_trips_through_toml() {
        let mut config = AgentConfig::default();
        config.device.devices.push(DeviceEntry {
            id: "watch-1".into(),
            display_name: "Galaxy Watch 5".into(),
            alias: Some("UserID-7-SmartWatchID-3".into()),
            addr: "127.0.0.1:9100".into(),
        });
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: AgentConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.device.devices[0].id, "watch-1");
        assert_eq!(parsed.retry.mode_fetch_limit, config.retry.mode_fetch_limit);
    }
}

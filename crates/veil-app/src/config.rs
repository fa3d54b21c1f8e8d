//! Application configuration file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use veil_session::SessionConfig;

/// Configuration loaded from `veil.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Panel subscription URL. Without it the client starts with an empty
    /// node list and waits for a refresh.
    pub subscription_url: Option<String>,
    /// Node to select after the first successful refresh
    pub node_id: Option<String>,
    /// Re-fetch the subscription on this interval, in minutes
    pub auto_refresh_minutes: Option<u64>,
    /// Log filter when `RUST_LOG` is unset (e.g. "info", "veil_session=debug")
    pub log_level: Option<String>,
    /// Minimum spacing between traffic snapshot publications, in ms
    #[serde(default = "default_traffic_interval_ms")]
    pub traffic_publish_interval_ms: u64,
}

fn default_traffic_interval_ms() -> u64 {
    250
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            subscription_url: None,
            node_id: None,
            auto_refresh_minutes: None,
            log_level: None,
            traffic_publish_interval_ms: default_traffic_interval_ms(),
        }
    }
}

impl AppConfig {
    /// Load from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Load from the path in `VEIL_CONFIG`, falling back to `veil.toml` in
    /// the working directory, falling back to defaults when neither exists.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("VEIL_CONFIG") {
            return Self::from_toml_file(Path::new(&path));
        }
        let default_path = Path::new("veil.toml");
        if default_path.exists() {
            return Self::from_toml_file(default_path);
        }
        Ok(Self::default())
    }

    /// Coordinator settings derived from this file.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            traffic_publish_interval: Duration::from_millis(self.traffic_publish_interval_ms),
            auto_refresh: self
                .auto_refresh_minutes
                .map(|minutes| Duration::from_secs(minutes * 60)),
            ..SessionConfig::default()
        }
    }
}

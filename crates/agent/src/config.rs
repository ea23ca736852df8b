//! Agent configuration

use anyhow::{Context, Result};
use hostwatch_lib::MonitorConfig;
use serde::Deserialize;
use std::path::Path;

/// Default configuration file, read when present
pub const DEFAULT_CONFIG_FILE: &str = "hostwatch.toml";

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Name reported in logs and passed to the analysis engine
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default)]
    pub monitor: MonitorConfig,
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("NODE_NAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

fn default_api_port() -> u16 {
    8080
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            api_port: default_api_port(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load from `HOSTWATCH_CONFIG` (or `hostwatch.toml`) overlaid with
    /// `HOSTWATCH_*` environment variables
    pub fn load() -> Result<Self> {
        let path = std::env::var("HOSTWATCH_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("HOSTWATCH")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(" ")
                    .with_list_parse_key("monitor.investigation.command")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;

        config
            .try_deserialize()
            .context("Invalid hostwatch configuration")
    }
}

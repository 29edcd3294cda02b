//! Server configuration (§6.3, §6.4, §4.8): bind address, history base directory, proxy
//! port range, and the default node ready timeout. Loaded from a single TOML file with
//! built-in defaults, the way the teacher's standalone orchestrator loads `orca.toml` —
//! simplified to one location since a server process has no per-project override tier.

use crate::error::{Result, ServerError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

fn default_bind_address() -> String {
    "127.0.0.1:7420".to_string()
}

fn default_history_base_dir() -> PathBuf {
    PathBuf::from("./nodeforge-history")
}

fn default_server_name() -> String {
    "nodeforge".to_string()
}

fn default_ready_timeout_ms() -> u64 {
    10_000
}

fn default_proxy_port_start() -> u16 {
    18_000
}

fn default_proxy_port_end() -> u16 {
    18_999
}

fn default_proxy_bind_retries() -> usize {
    5
}

fn default_proxy_health_timeout_ms() -> u64 {
    5_000
}

/// Top-level server configuration (§6.3/§6.4/§4.8 combined into one process config).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the command transport binds to.
    pub bind_address: String,

    /// Identifies this server instance in the history layout
    /// `<base_dir>/<server>/<session>/<node_id>/` (§6.4).
    pub server_name: String,

    /// Whether node history is recorded at all.
    pub history_enabled: bool,

    /// Base directory for history logs.
    pub history_base_dir: PathBuf,

    /// Default `ready_timeout` for nodes that don't specify one, in milliseconds.
    pub default_ready_timeout_ms: u64,

    #[serde(default)]
    pub proxy: ProxyPoolConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            server_name: default_server_name(),
            history_enabled: true,
            history_base_dir: default_history_base_dir(),
            default_ready_timeout_ms: default_ready_timeout_ms(),
            proxy: ProxyPoolConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn default_ready_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.default_ready_timeout_ms)
    }

    pub fn history_config(&self, session: &str) -> nodeforge_core::HistoryConfig {
        nodeforge_core::HistoryConfig {
            enabled: self.history_enabled,
            base_dir: self.history_base_dir.clone(),
            server_name: self.server_name.clone(),
            session_name: session.to_string(),
        }
    }
}

/// Port range and retry policy for the proxy manager (§4.8 step 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyPoolConfig {
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub bind_retries: usize,
    pub health_timeout_ms: u64,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            port_range_start: default_proxy_port_start(),
            port_range_end: default_proxy_port_end(),
            bind_retries: default_proxy_bind_retries(),
            health_timeout_ms: default_proxy_health_timeout_ms(),
        }
    }
}

impl ProxyPoolConfig {
    pub fn health_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.health_timeout_ms)
    }
}

/// Loads configuration from a single TOML file, falling back to defaults if the file
/// is absent (mirrors the teacher's `ConfigLoader`, minus the dual user/project tier).
pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> Result<ServerConfig> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "config file not found, using defaults");
            return Ok(ServerConfig::default());
        }
        self.load_from(&self.path).await
    }

    async fn load_from(&self, path: &Path) -> Result<ServerConfig> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| ServerError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: ServerConfig = toml::from_str(&content)
            .map_err(|e| ServerError::Config(format!("failed to parse {}: {e}", path.display())))?;
        info!(path = %path.display(), "loaded server configuration");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address, "127.0.0.1:7420");
        assert!(config.proxy.port_range_start < config.proxy.port_range_end);
    }

    #[tokio::test]
    async fn missing_file_falls_back_to_defaults() {
        let loader = ConfigLoader::new("/nonexistent/nodeforge.toml");
        let config = loader.load().await.unwrap();
        assert_eq!(config.server_name, "nodeforge");
    }

    #[tokio::test]
    async fn parses_a_minimal_toml_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodeforge.toml");
        tokio::fs::write(&path, "bind_address = \"0.0.0.0:9000\"\n")
            .await
            .unwrap();
        let loader = ConfigLoader::new(&path);
        let config = loader.load().await.unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:9000");
        assert_eq!(config.server_name, "nodeforge");
    }
}

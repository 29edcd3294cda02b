//! Proxy manager (§4.8): owns one LLM translation proxy per node, keyed by node id.
//!
//! Port allocation races time-of-check/time-of-use the same way any "find a free
//! port" helper does — `TcpListener::bind` itself is the only reliable check, so
//! contention is handled by retrying the bind with a fresh candidate port and
//! exponential backoff rather than pre-checking availability.

use nodeforge_llm::proxy::{wait_healthy, ApiFormat, PassthroughProxy, Proxy, ProxyConfig, ProxyHandle, TransformProxy};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::ProxyPoolConfig;
use crate::error::{Result, ServerError};

/// Provider configuration for a terminal node that fronts an LLM CLI (§6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_format: String,
    pub base_url: String,
    pub api_key: String,
    pub model: Option<String>,
    pub debug_dir: Option<String>,
}

impl ProviderConfig {
    fn into_proxy_config(self) -> Result<(ApiFormat, ProxyConfig)> {
        let format = ApiFormat::parse(&self.api_format)
            .ok_or_else(|| ServerError::InvalidRequest(format!("unknown api_format {:?}", self.api_format)))?;
        Ok((
            format,
            ProxyConfig {
                api_format: format,
                base_url: self.base_url,
                api_key: self.api_key,
                model: self.model,
            },
        ))
    }
}

struct ManagedProxy {
    handle: ProxyHandle,
}

pub struct ProxyManager {
    config: ProxyPoolConfig,
    active: Mutex<HashMap<String, ManagedProxy>>,
    port_cursor: AtomicU32,
}

impl ProxyManager {
    pub fn new(config: ProxyPoolConfig) -> Self {
        Self {
            config,
            active: Mutex::new(HashMap::new()),
            port_cursor: AtomicU32::new(0),
        }
    }

    fn next_candidate_port(&self) -> u16 {
        let span = (self.config.port_range_end - self.config.port_range_start) as u32 + 1;
        let offset = self.port_cursor.fetch_add(1, Ordering::Relaxed) % span;
        self.config.port_range_start + offset as u16
    }

    /// Starts a proxy for `node_id` (§4.8 steps 1-4): pick a port, bind, health-poll,
    /// and return the URL to inject into the child's environment. Retries on bind
    /// contention up to `config.bind_retries` times with `50ms * 2^attempt` backoff.
    pub async fn start_for_node(&self, node_id: &str, provider: ProviderConfig) -> Result<String> {
        let (format, proxy_config) = provider.into_proxy_config()?;

        let mut last_err = None;
        for attempt in 0..self.config.bind_retries {
            let port = self.next_candidate_port();
            let started = match format {
                ApiFormat::Anthropic => PassthroughProxy::start(proxy_config.clone(), port).await,
                ApiFormat::OpenAi => TransformProxy::start(proxy_config.clone(), port).await,
            };

            let handle = match started {
                Ok(h) => h,
                Err(e) => {
                    warn!(node_id, port, attempt, error = %e, "proxy bind failed, retrying");
                    last_err = Some(e);
                    tokio::time::sleep(backoff(attempt)).await;
                    continue;
                }
            };

            if let Err(e) = wait_healthy(&handle.url, self.config.health_timeout()).await {
                warn!(node_id, port, error = %e, "proxy never became healthy");
                last_err = Some(e);
                continue;
            }

            let url = handle.url.clone();
            info!(node_id, port, "proxy attached");
            self.active.lock().insert(node_id.to_string(), ManagedProxy { handle });
            return Ok(url);
        }

        Err(ServerError::Internal(format!(
            "failed to start proxy for node {node_id:?} after {} attempts: {}",
            self.config.bind_retries,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Stops and releases the proxy for `node_id`, if any (§4.8 step 5). Stopping one
    /// proxy never affects another — each owns its own listener and shutdown channel.
    pub async fn stop_for_node(&self, node_id: &str) {
        let managed = self.active.lock().remove(node_id);
        if let Some(mut managed) = managed {
            managed.handle.stop().await;
            info!(node_id, "proxy released");
        }
    }

    pub fn url_for(&self, node_id: &str) -> Option<String> {
        self.active.lock().get(node_id).map(|m| m.handle.url.clone())
    }

    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.active.lock().keys().cloned().collect();
        for id in ids {
            self.stop_for_node(&id).await;
        }
    }
}

fn backoff(attempt: usize) -> Duration {
    Duration::from_millis(50 * (1u64 << attempt.min(6)))
}

/// Builds the shell-quoted `export` line a pane is sent before its child command runs
/// (§4.8 "Environment injection", §6.5). Unquoted interpolation is forbidden by the
/// spec; `shell_words::quote` is the same quoting primitive used elsewhere in the
/// corpus for shell-templated env injection.
pub fn anthropic_base_url_export(proxy_url: &str) -> String {
    format!("export ANTHROPIC_BASE_URL={}\n", shell_words::quote(proxy_url))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_line_quotes_the_url() {
        let line = anthropic_base_url_export("http://127.0.0.1:8080");
        assert_eq!(line, "export ANTHROPIC_BASE_URL=http://127.0.0.1:8080\n");
    }

    #[test]
    fn export_line_quotes_urls_with_shell_metacharacters() {
        let line = anthropic_base_url_export("http://127.0.0.1:8080/;rm -rf /");
        assert!(line.contains("'"));
        assert!(!line.contains("rf /'\n"));
    }

    #[tokio::test]
    async fn rejects_unknown_api_format() {
        let manager = ProxyManager::new(ProxyPoolConfig::default());
        let err = manager
            .start_for_node(
                "n1",
                ProviderConfig {
                    api_format: "carrier-pigeon".to_string(),
                    base_url: "http://x".to_string(),
                    api_key: "k".to_string(),
                    model: None,
                    debug_dir: None,
                },
            )
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn starts_and_stops_a_passthrough_proxy() {
        let manager = ProxyManager::new(ProxyPoolConfig {
            port_range_start: 19500,
            port_range_end: 19599,
            bind_retries: 5,
            health_timeout_ms: 2000,
        });
        let url = manager
            .start_for_node(
                "n1",
                ProviderConfig {
                    api_format: "anthropic".to_string(),
                    base_url: "http://localhost:1".to_string(),
                    api_key: "k".to_string(),
                    model: None,
                    debug_dir: None,
                },
            )
            .await
            .unwrap();
        assert!(url.starts_with("http://127.0.0.1:"));
        assert!(manager.url_for("n1").is_some());
        manager.stop_for_node("n1").await;
        assert!(manager.url_for("n1").is_none());
    }
}

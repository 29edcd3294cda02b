//! Command dispatcher (§4.7): routes a typed `{type, params, request_id}` command to
//! a handler and returns `{success, data|error, request_id}`.
//!
//! Each handler family lives in its own module under `handlers/`, mirroring how the
//! distilled spec groups them (node lifecycle, node interaction, script execution,
//! REPL meta-commands, graph, session, workflow, server). A single shared validation
//! helper (`Dispatcher::resolve_session`) resolves `session_id | default` through the
//! registry so no handler duplicates that lookup.

pub mod handlers;

use nodeforge_core::EventSink;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::graph_run::GraphRun;
use crate::proxy_manager::ProxyManager;
use crate::registry::SessionRegistry;
use crate::script::ScriptRegistry;
use crate::session::Session;

/// A command as it arrives over the wire (§6.1): `type` selects the handler, `params`
/// is handler-specific, `request_id` is opaque and echoed back verbatim.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub request_id: Value,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub request_id: Value,
}

impl CommandResponse {
    fn ok(data: Value, request_id: Value) -> Self {
        Self { success: true, data: Some(data), error: None, request_id }
    }

    fn err(error: impl Into<String>, request_id: Value) -> Self {
        Self { success: false, data: None, error: Some(error.into()), request_id }
    }
}

pub struct Dispatcher {
    pub registry: Arc<SessionRegistry>,
    pub proxies: Arc<ProxyManager>,
    pub config: Arc<ServerConfig>,
    pub scripts: Arc<ScriptRegistry>,
    pub sink: Arc<dyn EventSink>,
    /// Tracks the most recent `run_graph` task per stored graph id, so `cancel_graph`
    /// has something cooperative to stop and `get_graph_run` has a result to hand
    /// back once it lands (§4.7 "Graph: ... run (stored graph), cancel"). Ad-hoc
    /// `execute_graph` calls run to completion inline and never enter this map —
    /// there's no id to cancel or poll them by.
    pub(crate) graph_runs: Mutex<HashMap<String, Arc<GraphRun>>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        proxies: Arc<ProxyManager>,
        config: Arc<ServerConfig>,
        scripts: Arc<ScriptRegistry>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self { registry, proxies, config, scripts, sink, graph_runs: Mutex::new(HashMap::new()) }
    }

    /// Shared validation helper (§4.7): resolves `session_id | default` via the
    /// registry. Every handler goes through this instead of touching the registry
    /// directly.
    pub fn resolve_session(&self, session_id: Option<&str>) -> Result<Arc<Session>> {
        self.registry.get_session(session_id)
    }

    /// Routes one command to its handler and turns panics/errors into the response
    /// shapes §7 specifies: validation/user errors are a failed response with no
    /// event; this method itself only ever returns, it never propagates — the
    /// transport is expected to call it inside a `catch_unwind`-free async task since
    /// Rust has no catchable panics across `.await` boundaries worth emulating here.
    pub async fn dispatch(&self, envelope: CommandEnvelope) -> CommandResponse {
        let request_id = envelope.request_id.clone();
        let result = self.route(&envelope.kind, envelope.params).await;
        match result {
            Ok(data) => CommandResponse::ok(data, request_id),
            Err(e) => {
                if matches!(e, ServerError::Internal(_)) {
                    self.sink
                        .emit(
                            nodeforge_core::Event::new(nodeforge_core::EventType::Error)
                                .with_data("error", e.to_string())
                                .with_data("error_type", e.kind()),
                        )
                        .await;
                }
                CommandResponse::err(e.to_string(), request_id)
            }
        }
    }

    async fn route(&self, kind: &str, params: Value) -> Result<Value> {
        match kind {
            "create_node" => handlers::node::create_node(self, parse(params)?).await,
            "delete_node" => handlers::node::delete_node(self, parse(params)?).await,
            "list_nodes" => handlers::node::list_nodes(self, parse(params)?).await,
            "get_node" => handlers::node::get_node(self, parse(params)?).await,
            "execute_input" => handlers::node::execute_input(self, parse(params)?).await,
            "run_command" => handlers::node::run_command(self, parse(params)?).await,
            "send_interrupt" => handlers::node::send_interrupt(self, parse(params)?).await,
            "fork_node" => handlers::node::fork_node(self, parse(params)?).await,
            "read_history" => handlers::node::read_history(self, parse(params)?).await,

            "execute_script" => handlers::script::execute_script(self, parse(params)?).await,

            "create_graph" => handlers::graph::create_graph(self, parse(params)?).await,
            "delete_graph" => handlers::graph::delete_graph(self, parse(params)?).await,
            "list_graphs" => handlers::graph::list_graphs(self, parse(params)?).await,
            "get_graph" => handlers::graph::get_graph(self, parse(params)?).await,
            "validate_graph" => handlers::graph::validate_graph(self, parse(params)?).await,
            "execute_graph" => handlers::graph::execute_graph(self, parse(params)?).await,
            "run_graph" => handlers::graph::run_graph(self, parse(params)?).await,
            "get_graph_run" => handlers::graph::get_graph_run(self, parse(params)?).await,
            "cancel_graph" => handlers::graph::cancel_graph(self, parse(params)?).await,

            "create_session" => handlers::session::create_session(self, parse(params)?).await,
            "delete_session" => handlers::session::delete_session(self, parse(params)?).await,
            "list_sessions" => handlers::session::list_sessions(self).await,
            "get_session" => handlers::session::get_session(self, parse(params)?).await,
            "set_default_session" => handlers::session::set_default_session(self, parse(params)?).await,

            "execute_workflow" => handlers::workflow::execute_workflow(self, parse(params)?).await,
            "list_workflows" => handlers::workflow::list_workflows(self, parse(params)?).await,
            "get_workflow_run" => handlers::workflow::get_workflow_run(self, parse(params)?).await,
            "list_workflow_runs" => handlers::workflow::list_workflow_runs(self, parse(params)?).await,
            "answer_gate" => handlers::workflow::answer_gate(self, parse(params)?).await,
            "cancel_workflow_run" => handlers::workflow::cancel_workflow_run(self, parse(params)?).await,

            "stop" => handlers::server::stop(self).await,
            "ping" => handlers::server::ping(self).await,

            other => Err(ServerError::InvalidRequest(format!("unknown command type {other:?}"))),
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| ServerError::InvalidRequest(format!("invalid params: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn test_dispatcher() -> Dispatcher {
        let config = Arc::new(ServerConfig::default());
        let registry = Arc::new(SessionRegistry::new(config.history_config("default")));
        let proxies = Arc::new(ProxyManager::new(config.proxy.clone()));
        let scripts = Arc::new(ScriptRegistry::new());
        Dispatcher::new(registry, proxies, config, scripts, Arc::new(nodeforge_core::NullSink))
    }

    #[tokio::test]
    async fn unknown_command_type_is_invalid_request() {
        let dispatcher = test_dispatcher();
        let response = dispatcher
            .dispatch(CommandEnvelope {
                kind: "not_a_real_command".to_string(),
                params: Value::Null,
                request_id: Value::String("r1".to_string()),
            })
            .await;
        assert!(!response.success);
        assert_eq!(response.request_id, Value::String("r1".to_string()));
    }

    #[tokio::test]
    async fn ping_reports_entity_counts() {
        let dispatcher = test_dispatcher();
        let response = dispatcher
            .dispatch(CommandEnvelope {
                kind: "ping".to_string(),
                params: Value::Null,
                request_id: Value::Null,
            })
            .await;
        assert!(response.success);
        assert_eq!(response.data.unwrap()["pong"], true);
    }
}

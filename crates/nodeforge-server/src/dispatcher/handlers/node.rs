//! Node lifecycle and interaction handlers (§6.2).
//!
//! `create_node` directly constructs the backends buildable from wire parameters
//! alone: `identity`, `bash`, `pty`, `stateless_llm`, `stateful_llm`. The remaining
//! catalogue backends need a collaborator this package doesn't provide a concrete
//! implementation for — `external_terminal`/`claude_terminal`/`mcp` need an injected
//! [`nodeforge_core::terminal::external::PaneMultiplexer`] or
//! [`nodeforge_core::node::mcp_node`] transport, both explicitly out of scope — so
//! requesting them returns `not_implemented_error` rather than a half-working stub.

use nodeforge_core::node::bash::BashNode;
use nodeforge_core::node::identity::IdentityNode;
use nodeforge_core::node::llm_node::{StatefulLLMNode, StatelessLLMNode};
use nodeforge_core::terminal::pty::PtySpawnConfig;
use nodeforge_core::node::terminal_node::PTYNode;
use nodeforge_core::{ExecutionContext, Node, NodeInput};
use nodeforge_llm::providers::anthropic::{AnthropicClient, AnthropicConfig};
use nodeforge_llm::providers::openai::{OpenAiClient, OpenAiConfig};
use nodeforge_llm::ChatModel;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::dispatcher::Dispatcher;
use crate::error::{Result, ServerError};

#[derive(Debug, Deserialize)]
pub struct LlmProviderParams {
    pub api_format: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn build_chat_model(provider: &LlmProviderParams) -> Result<Arc<dyn ChatModel>> {
    match provider.api_format.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicClient::new(AnthropicConfig::new(
            provider.base_url.clone(),
            provider.api_key.clone(),
        )))),
        "openai" => Ok(Arc::new(OpenAiClient::new(OpenAiConfig::new(
            provider.base_url.clone(),
            provider.api_key.clone(),
        )))),
        other => Err(ServerError::InvalidRequest(format!("unknown api_format {other:?}"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct PtyParams {
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
    #[serde(default)]
    pub tail_lines: Option<usize>,
    #[serde(default)]
    pub ready_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateNodeParams {
    #[serde(default)]
    pub session_id: Option<String>,
    pub id: String,
    pub backend: String,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub provider: Option<LlmProviderParams>,
    #[serde(default)]
    pub pty: Option<PtyParams>,
}

pub async fn create_node(dispatcher: &Dispatcher, params: CreateNodeParams) -> Result<Value> {
    let session = dispatcher.resolve_session(params.session_id.as_deref())?;

    let node: Arc<dyn Node> = match params.backend.as_str() {
        "identity" => Arc::new(IdentityNode::new(params.id.clone())),
        "bash" => {
            let mut node = BashNode::new(params.id.clone());
            if let Some(shell) = params.shell {
                node = node.with_shell(shell);
            }
            Arc::new(node)
        }
        "stateless_llm" => {
            let provider = params
                .provider
                .ok_or_else(|| ServerError::InvalidRequest("stateless_llm requires a provider".to_string()))?;
            let client = build_chat_model(&provider)?;
            let mut node = StatelessLLMNode::new(params.id.clone(), client, provider.model.clone());
            if let Some(prompt) = provider.system_prompt {
                node = node.with_system_prompt(prompt);
            }
            Arc::new(node)
        }
        "stateful_llm" => {
            let provider = params
                .provider
                .ok_or_else(|| ServerError::InvalidRequest("stateful_llm requires a provider".to_string()))?;
            let client = build_chat_model(&provider)?;
            let mut node = StatefulLLMNode::new(params.id.clone(), client, provider.model.clone());
            if let Some(prompt) = provider.system_prompt {
                node = node.with_system_prompt(prompt);
            }
            Arc::new(node)
        }
        "pty" => {
            let pty_params = params.pty.unwrap_or(PtyParams {
                program: None,
                args: Vec::new(),
                cwd: None,
                env: Vec::new(),
                cols: None,
                rows: None,
                tail_lines: None,
                ready_timeout_ms: None,
            });
            let default = PtySpawnConfig::default();
            let config = PtySpawnConfig {
                program: pty_params.program.unwrap_or(default.program),
                args: pty_params.args,
                cwd: pty_params.cwd,
                env: pty_params.env,
                cols: pty_params.cols.unwrap_or(default.cols),
                rows: pty_params.rows.unwrap_or(default.rows),
                tail_lines: pty_params.tail_lines.unwrap_or(default.tail_lines),
            };
            let ready_timeout = pty_params
                .ready_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| dispatcher.config.default_ready_timeout());
            let history = session.history_config().clone();
            let node = PTYNode::spawn(params.id.clone(), config, None, &history, ready_timeout)
                .map_err(ServerError::Node)?;
            Arc::new(node)
        }
        "external_terminal" | "claude_terminal" | "mcp" | "function" => {
            return Err(ServerError::InvalidRequest(format!(
                "backend {:?} requires a host-injected collaborator not available over the wire",
                params.backend
            )))
        }
        other => return Err(ServerError::InvalidRequest(format!("unknown node backend {other:?}"))),
    };

    node.start().await.map_err(ServerError::Node)?;
    session.add_node(params.id.clone(), node.clone()).map_err(ServerError::Node)?;

    dispatcher
        .sink
        .emit(
            nodeforge_core::Event::new(nodeforge_core::EventType::NodeCreated)
                .with_node(params.id.clone()),
        )
        .await;
    dispatcher
        .sink
        .emit(nodeforge_core::Event::new(nodeforge_core::EventType::NodeReady).with_node(params.id.clone()))
        .await;

    Ok(serde_json::to_value(node.to_info().await).unwrap_or(Value::Null))
}

#[derive(Debug, Deserialize)]
pub struct NodeIdParams {
    #[serde(default)]
    pub session_id: Option<String>,
    pub node_id: String,
}

pub async fn delete_node(dispatcher: &Dispatcher, params: NodeIdParams) -> Result<Value> {
    let session = dispatcher.resolve_session(params.session_id.as_deref())?;
    let node = session
        .remove_node(&params.node_id)
        .ok_or_else(|| ServerError::NodeNotFound(params.node_id.clone()))?;
    node.stop().await.map_err(ServerError::Node)?;
    dispatcher
        .proxies
        .stop_for_node(&params.node_id)
        .await;
    dispatcher
        .sink
        .emit(nodeforge_core::Event::new(nodeforge_core::EventType::NodeDeleted).with_node(params.node_id.clone()))
        .await;
    Ok(serde_json::json!({"deleted": true}))
}

#[derive(Debug, Deserialize)]
pub struct SessionScopeParams {
    #[serde(default)]
    pub session_id: Option<String>,
}

pub async fn list_nodes(dispatcher: &Dispatcher, params: SessionScopeParams) -> Result<Value> {
    let session = dispatcher.resolve_session(params.session_id.as_deref())?;
    let infos = session.list_node_infos().await;
    Ok(serde_json::to_value(infos).unwrap_or(Value::Null))
}

pub async fn get_node(dispatcher: &Dispatcher, params: NodeIdParams) -> Result<Value> {
    let session = dispatcher.resolve_session(params.session_id.as_deref())?;
    let node = session
        .get_node(&params.node_id)
        .ok_or_else(|| ServerError::NodeNotFound(params.node_id.clone()))?;
    Ok(serde_json::to_value(node.to_info().await).unwrap_or(Value::Null))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteInputParams {
    #[serde(default)]
    pub session_id: Option<String>,
    pub node_id: String,
    pub text: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// `execute_input` (§6.2): runs the node's own `execute` to completion and returns its
/// `NodeResult` verbatim as `response`. Terminal-backed nodes' results already carry
/// the `raw`/`sections`/`is_ready`/`is_complete` shape the distilled spec calls
/// `ParsedResponse`; other backends (bash, LLM) surface their own §4.4 attribute set
/// under the same key rather than being coerced into a parser-shaped wrapper.
pub async fn execute_input(dispatcher: &Dispatcher, params: ExecuteInputParams) -> Result<Value> {
    let session = dispatcher.resolve_session(params.session_id.as_deref())?;
    let node = session
        .get_node(&params.node_id)
        .ok_or_else(|| ServerError::NodeNotFound(params.node_id.clone()))?;

    let mut ctx = ExecutionContext::new(NodeInput::Text(params.text)).with_sink(dispatcher.sink.clone());
    if let Some(ms) = params.timeout_ms {
        ctx = ctx.with_timeout(Duration::from_millis(ms));
    }
    let result = node.execute(ctx).await;
    Ok(serde_json::json!({"response": result}))
}

#[derive(Debug, Deserialize)]
pub struct RunCommandParams {
    #[serde(default)]
    pub session_id: Option<String>,
    pub node_id: String,
    pub command: String,
}

/// `run_command` (§6.2): fire-and-forget send, for REPL-style interaction where the
/// caller watches the node's event stream rather than waiting on a response. Spawned
/// on its own task so the dispatcher call returns immediately with `{executed: true}`.
pub async fn run_command(dispatcher: &Dispatcher, params: RunCommandParams) -> Result<Value> {
    let session = dispatcher.resolve_session(params.session_id.as_deref())?;
    let node = session
        .get_node(&params.node_id)
        .ok_or_else(|| ServerError::NodeNotFound(params.node_id.clone()))?;
    let sink = dispatcher.sink.clone();
    let command = params.command;
    tokio::spawn(async move {
        let ctx = ExecutionContext::new(NodeInput::Text(command)).with_sink(sink);
        let _ = node.execute(ctx).await;
    });
    Ok(serde_json::json!({"executed": true}))
}

pub async fn send_interrupt(dispatcher: &Dispatcher, params: NodeIdParams) -> Result<Value> {
    let session = dispatcher.resolve_session(params.session_id.as_deref())?;
    let node = session
        .get_node(&params.node_id)
        .ok_or_else(|| ServerError::NodeNotFound(params.node_id.clone()))?;
    node.interrupt().await;
    Ok(serde_json::json!({"interrupted": true}))
}

#[derive(Debug, Deserialize)]
pub struct ForkNodeParams {
    #[serde(default)]
    pub session_id: Option<String>,
    pub source_id: String,
    pub target_id: String,
}

pub async fn fork_node(dispatcher: &Dispatcher, params: ForkNodeParams) -> Result<Value> {
    let session = dispatcher.resolve_session(params.session_id.as_deref())?;
    let source = session
        .get_node(&params.source_id)
        .ok_or_else(|| ServerError::NodeNotFound(params.source_id.clone()))?;
    let forked = source.try_fork(params.target_id.clone()).await.map_err(ServerError::Node)?;
    session
        .add_node(params.target_id.clone(), forked)
        .map_err(ServerError::Node)?;
    Ok(serde_json::json!({"node_id": params.target_id, "forked_from": params.source_id}))
}

#[derive(Debug, Deserialize)]
pub struct ReadHistoryParams {
    #[serde(default)]
    pub session_id: Option<String>,
    pub node_id: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `read_history` (§6.4): node history is append-only JSONL on disk; reading it back
/// over the wire is a plain file read, not something the in-memory node holds onto.
pub async fn read_history(dispatcher: &Dispatcher, params: ReadHistoryParams) -> Result<Value> {
    let session = dispatcher.resolve_session(params.session_id.as_deref())?;
    if session.get_node(&params.node_id).is_none() {
        return Err(ServerError::NodeNotFound(params.node_id.clone()));
    }
    let path = session
        .history_config()
        .base_dir
        .join(&session.history_config().server_name)
        .join(&session.history_config().session_name)
        .join(&params.node_id)
        .join("history.jsonl");

    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(serde_json::json!({"records": []})),
        Err(e) => return Err(ServerError::Internal(format!("failed to read history at {}: {e}", path.display()))),
    };

    let mut records: Vec<Value> = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();
    if let Some(limit) = params.limit {
        let start = records.len().saturating_sub(limit);
        records = records.split_off(start);
    }
    Ok(serde_json::json!({"records": records}))
}

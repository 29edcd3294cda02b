//! Node: the polymorphic executable unit (§3.1, §4.4).
//!
//! Every node variant — shell, terminal, LLM, function, tool-server — implements the
//! same [`Node`] trait. Capability checks that only make sense for a subset of
//! variants (forking, tool calls) are separate extension traits so a caller can ask
//! "is this a terminal" or "can this fork" without every node paying for methods it
//! can't support.

pub mod bash;
pub mod function;
pub mod identity;
pub mod llm_node;
pub mod mcp_node;
pub mod terminal_node;

use crate::error::Result;
use crate::event::EventSink;
use crate::parser::Parser;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Created,
    Starting,
    Ready,
    Busy,
    Stopping,
    Stopped,
    Error,
}

/// Structured or freeform input to a node call (§4.4 `execute(context)`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeInput {
    Text(String),
    Structured(Value),
}

impl NodeInput {
    pub fn as_text(&self) -> String {
        match self {
            NodeInput::Text(s) => s.clone(),
            NodeInput::Structured(Value::String(s)) => s.clone(),
            NodeInput::Structured(v) => v.to_string(),
        }
    }
}

impl From<&str> for NodeInput {
    fn from(s: &str) -> Self {
        NodeInput::Text(s.to_string())
    }
}

impl From<String> for NodeInput {
    fn from(s: String) -> Self {
        NodeInput::Text(s)
    }
}

impl From<Value> for NodeInput {
    fn from(v: Value) -> Self {
        NodeInput::Structured(v)
    }
}

/// Per-call arguments threaded through `execute` (§4.4).
pub struct ExecutionContext {
    pub input: NodeInput,
    pub parser: Option<Arc<dyn Parser>>,
    pub timeout: Option<Duration>,
    pub sink: Arc<dyn EventSink>,
}

impl ExecutionContext {
    pub fn new(input: impl Into<NodeInput>) -> Self {
        Self {
            input: input.into(),
            parser: None,
            timeout: None,
            sink: Arc::new(crate::event::NullSink),
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn Parser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }
}

/// The mandatory shape every `execute` call returns (§4.4): `success`, `error`,
/// `error_type`, plus node-type-specific keys folded into `attributes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl NodeResult {
    pub fn ok(attributes: Map<String, Value>) -> Self {
        Self {
            success: true,
            error: None,
            error_type: None,
            attributes,
        }
    }

    pub fn err(error: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            error_type: Some(error_type.into()),
            attributes: Map::new(),
        }
    }

    pub fn from_node_error(e: &crate::error::NodeError) -> Self {
        Self::err(e.to_string(), e.kind())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub node_type: String,
    pub state: NodeState,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A chunk of a node's streamed output (§4.4 `execute_stream`).
#[derive(Debug, Clone)]
pub enum OutputChunk {
    Delta(String),
    Done(NodeResult),
}

/// The common operation contract every node variant implements (§4.4).
#[async_trait]
pub trait Node: Send + Sync {
    fn id(&self) -> &str;

    fn node_type(&self) -> &'static str;

    fn is_persistent(&self) -> bool;

    async fn state(&self) -> NodeState;

    async fn execute(&self, ctx: ExecutionContext) -> NodeResult;

    /// Default streaming implementation for nodes that don't produce partial output:
    /// a single `Done` chunk equal to `execute`'s result.
    async fn execute_stream(&self, ctx: ExecutionContext) -> BoxStream<'static, OutputChunk> {
        let result = self.execute(ctx).await;
        Box::pin(futures::stream::once(async move { OutputChunk::Done(result) }))
    }

    async fn interrupt(&self);

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn to_info(&self) -> NodeInfo;

    /// Type-erased bridge to [`Forkable`] for callers holding only `Arc<dyn Node>`
    /// (the dispatcher's node registry, in particular). Node types that implement
    /// `Forkable` override this to delegate; everything else inherits the
    /// `not_implemented` default.
    async fn try_fork(&self, new_id: String) -> Result<Arc<dyn Node>> {
        let _ = new_id;
        Err(crate::error::NodeError::NotImplemented(format!(
            "{} nodes cannot be forked",
            self.node_type()
        )))
    }
}

/// Capability extension for nodes that expose tools to an LLM tool loop (§4.4).
#[async_trait]
pub trait ToolCapable: Node {
    fn tool_definitions(&self) -> Vec<nodeforge_llm::ToolDefinition>;

    async fn call_tool(&self, name: &str, args: Value) -> Result<String>;
}

/// Capability extension for nodes that can be forked into an independent copy (§4.4).
#[async_trait]
pub trait Forkable: Node {
    async fn fork(&self, new_id: String) -> Result<Arc<dyn Node>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_result_err_carries_error_type_and_no_attributes() {
        let r = NodeResult::err("boom", "internal_error");
        assert!(!r.success);
        assert_eq!(r.error_type.as_deref(), Some("internal_error"));
        assert!(r.attributes.is_empty());
    }

    #[test]
    fn node_input_as_text_stringifies_structured_input() {
        let input = NodeInput::Structured(serde_json::json!({"a": 1}));
        assert_eq!(input.as_text(), "{\"a\":1}");
    }

    #[test]
    fn node_input_as_text_unwraps_a_structured_plain_string() {
        // A graph step's JSON `input` always arrives as `Structured`, even when the
        // caller just meant plain text (e.g. a shell command); it must come out the
        // way `Text` would, not JSON-quoted.
        let input = NodeInput::Structured(serde_json::json!("sleep 5"));
        assert_eq!(input.as_text(), "sleep 5");
    }
}

//! MCPNode (§3.1, §4.4): persistent connection to an external tool server.
//!
//! Only the client protocol matters here, not the server subprocess itself (that's an
//! external collaborator). [`McpTransport`] is the abstract boundary: a real
//! implementation speaks the tool-server's wire protocol (stdio-framed JSON-RPC, in
//! the common case) over a child process this crate doesn't manage directly.

use super::{ExecutionContext, Node, NodeInfo, NodeResult, NodeState, ToolCapable};
use crate::error::{NodeError, Result};
use async_trait::async_trait;
use nodeforge_llm::ToolDefinition;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>>;
    async fn call_tool(&self, name: &str, args: Value) -> Result<String>;
    async fn disconnect(&self) -> Result<()>;
}

pub struct MCPNode {
    id: String,
    transport: Arc<dyn McpTransport>,
    state: Mutex<NodeState>,
    tools: Mutex<Vec<ToolDefinition>>,
}

impl MCPNode {
    pub fn new(id: impl Into<String>, transport: Arc<dyn McpTransport>) -> Self {
        Self {
            id: id.into(),
            transport,
            state: Mutex::new(NodeState::Created),
            tools: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Node for MCPNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "mcp"
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn state(&self) -> NodeState {
        *self.state.lock()
    }

    /// Interprets `execute`'s input as `{"tool": name, "args": value}` — the uniform
    /// shape the dispatcher's tool-call routing produces for MCP nodes.
    async fn execute(&self, ctx: ExecutionContext) -> NodeResult {
        if *self.state.lock() != NodeState::Ready {
            return NodeResult::from_node_error(&NodeError::NodeStopped(self.id.clone()));
        }

        let request: Value = match &ctx.input {
            crate::node::NodeInput::Structured(v) => v.clone(),
            crate::node::NodeInput::Text(s) => match serde_json::from_str(s) {
                Ok(v) => v,
                Err(e) => {
                    return NodeResult::from_node_error(&NodeError::InvalidRequest(format!(
                        "expected a {{tool, args}} object: {e}"
                    )))
                }
            },
        };

        let tool = match request.get("tool").and_then(|v| v.as_str()) {
            Some(t) => t.to_string(),
            None => return NodeResult::from_node_error(&NodeError::InvalidRequest("missing `tool`".into())),
        };
        let args = request.get("args").cloned().unwrap_or(Value::Null);

        *self.state.lock() = NodeState::Busy;
        let outcome = self.transport.call_tool(&tool, args.clone()).await;
        *self.state.lock() = if outcome.is_ok() { NodeState::Ready } else { NodeState::Error };

        match outcome {
            Ok(output) => {
                let mut attributes = serde_json::Map::new();
                attributes.insert("output".to_string(), output.into());
                let mut call_attrs = serde_json::Map::new();
                call_attrs.insert("tool".to_string(), tool.into());
                call_attrs.insert("args".to_string(), args);
                attributes.insert("attributes".to_string(), Value::Object(call_attrs));
                NodeResult::ok(attributes)
            }
            Err(e) => NodeResult::from_node_error(&e),
        }
    }

    async fn interrupt(&self) {}

    async fn start(&self) -> Result<()> {
        *self.state.lock() = NodeState::Starting;
        self.transport.connect().await?;
        let tools = self.transport.list_tools().await?;
        *self.tools.lock() = tools;
        *self.state.lock() = NodeState::Ready;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        *self.state.lock() = NodeState::Stopping;
        self.transport.disconnect().await?;
        *self.state.lock() = NodeState::Stopped;
        Ok(())
    }

    async fn to_info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            node_type: self.node_type().to_string(),
            state: *self.state.lock(),
            metadata: Default::default(),
        }
    }
}

#[async_trait]
impl ToolCapable for MCPNode {
    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.lock().clone()
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<String> {
        if *self.state.lock() != NodeState::Ready {
            return Err(NodeError::NodeStopped(self.id.clone()));
        }
        self.transport.call_tool(name, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeTransport {
        tools: Vec<ToolDefinition>,
    }

    #[async_trait]
    impl McpTransport for FakeTransport {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
            Ok(self.tools.clone())
        }

        async fn call_tool(&self, name: &str, args: Value) -> Result<String> {
            Ok(format!("{name}({args})"))
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    fn transport() -> Arc<dyn McpTransport> {
        Arc::new(FakeTransport {
            tools: vec![ToolDefinition {
                name: "search".to_string(),
                description: "search the web".to_string(),
                parameters: serde_json::json!({"type": "object"}),
                node_id: "m1".to_string(),
            }],
        })
    }

    #[tokio::test]
    async fn start_populates_tool_definitions_from_transport() {
        let node = MCPNode::new("m1", transport());
        node.start().await.unwrap();
        assert_eq!(node.tool_definitions().len(), 1);
        assert_eq!(node.tool_definitions()[0].name, "search");
    }

    #[tokio::test]
    async fn execute_routes_tool_and_args_to_transport() {
        let node = MCPNode::new("m1", transport());
        node.start().await.unwrap();
        let ctx = ExecutionContext::new(serde_json::json!({"tool": "search", "args": {"q": "rust"}}));
        let result = node.execute(ctx).await;
        assert!(result.success);
        assert!(result.attributes["output"].as_str().unwrap().starts_with("search("));
    }

    #[tokio::test]
    async fn execute_before_start_is_node_stopped() {
        let node = MCPNode::new("m1", transport());
        let ctx = ExecutionContext::new("{}");
        let result = node.execute(ctx).await;
        assert!(!result.success);
        assert_eq!(result.error_type.as_deref(), Some("node_stopped"));
    }
}

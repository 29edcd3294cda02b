//! FunctionNode (§3.1): ephemeral wrapper around a host-language callable.
//!
//! The callable is a boxed closure rather than a trait object with a fixed signature
//! so graph steps can wire in arbitrary pure transforms (§8 scenario 3: `input_fn λd:
//! d.a.output + "!"` composed with a function node).

use super::{ExecutionContext, Node, NodeInfo, NodeResult, NodeState};
use crate::error::{NodeError, Result};
use async_trait::async_trait;
use std::sync::Arc;

pub type NodeFn = Arc<dyn Fn(&str) -> std::result::Result<String, String> + Send + Sync>;

pub struct FunctionNode {
    id: String,
    func: NodeFn,
}

impl FunctionNode {
    pub fn new(id: impl Into<String>, func: NodeFn) -> Self {
        Self { id: id.into(), func }
    }
}

#[async_trait]
impl Node for FunctionNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "function"
    }

    fn is_persistent(&self) -> bool {
        false
    }

    async fn state(&self) -> NodeState {
        NodeState::Ready
    }

    async fn execute(&self, ctx: ExecutionContext) -> NodeResult {
        let input = ctx.input.as_text();
        let func = self.func.clone();
        let input_for_call = input.clone();
        let outcome = tokio::task::spawn_blocking(move || (func)(&input_for_call)).await;

        match outcome {
            Ok(Ok(output)) => {
                let mut attributes = serde_json::Map::new();
                attributes.insert("input".to_string(), input.into());
                attributes.insert("output".to_string(), output.into());
                NodeResult::ok(attributes)
            }
            Ok(Err(message)) => NodeResult::from_node_error(&NodeError::Internal(message)),
            Err(join_error) => {
                NodeResult::from_node_error(&NodeError::Internal(join_error.to_string()))
            }
        }
    }

    async fn interrupt(&self) {}

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn to_info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            node_type: self.node_type().to_string(),
            state: NodeState::Ready,
            metadata: Default::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn applies_wrapped_callable_to_input() {
        let node = FunctionNode::new("f1", Arc::new(|input: &str| Ok(format!("{input}!"))));
        let result = node.execute(ExecutionContext::new("x")).await;
        assert!(result.success);
        assert_eq!(result.attributes["output"], "x!");
    }

    #[tokio::test]
    async fn callable_error_becomes_internal_error_result() {
        let node = FunctionNode::new("f1", Arc::new(|_: &str| Err("boom".to_string())));
        let result = node.execute(ExecutionContext::new("x")).await;
        assert!(!result.success);
        assert_eq!(result.error_type.as_deref(), Some("internal_error"));
    }
}

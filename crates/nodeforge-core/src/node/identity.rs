//! IdentityNode (§3.1): ephemeral test fixture that echoes its input unchanged.

use super::{ExecutionContext, Node, NodeInfo, NodeResult, NodeState};
use crate::error::Result;
use async_trait::async_trait;

pub struct IdentityNode {
    id: String,
}

impl IdentityNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl Node for IdentityNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "identity"
    }

    fn is_persistent(&self) -> bool {
        false
    }

    async fn state(&self) -> NodeState {
        NodeState::Ready
    }

    async fn execute(&self, ctx: ExecutionContext) -> NodeResult {
        let text = ctx.input.as_text();
        let mut attributes = serde_json::Map::new();
        attributes.insert("output".to_string(), text.clone().into());
        attributes.insert("input".to_string(), text.into());
        NodeResult::ok(attributes)
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
    async fn echoes_input_as_output() {
        let node = IdentityNode::new("id1");
        let result = node.execute(ExecutionContext::new("hello")).await;
        assert!(result.success);
        assert_eq!(result.attributes["output"], "hello");
        assert_eq!(result.attributes["input"], "hello");
    }
}

//! Dispatcher-level error taxonomy (§7).
//!
//! Node-level failures are carried inside `NodeResult` and never reach here. This enum
//! exists for the layer above a single node: session/graph/workflow lookups, config
//! loading, and the dispatcher's own validation. `kind()` lines up with the same §7
//! strings a node result uses so a handler can map either error family onto one
//! `{success: false, error, error_type}` response shape.

use nodeforge_core::NodeError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("graph not found: {0}")]
    GraphNotFound(String),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("workflow run not found: {0}")]
    RunNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("node error: {0}")]
    Node(#[from] NodeError),

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::SessionNotFound(_)
            | ServerError::NodeNotFound(_)
            | ServerError::GraphNotFound(_)
            | ServerError::WorkflowNotFound(_)
            | ServerError::RunNotFound(_)
            | ServerError::InvalidRequest(_) => "invalid_request_error",
            ServerError::Node(e) => e.kind(),
            ServerError::Config(_) => "internal_error",
            ServerError::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_failures_map_to_invalid_request() {
        assert_eq!(ServerError::SessionNotFound("s".into()).kind(), "invalid_request_error");
        assert_eq!(ServerError::RunNotFound("r".into()).kind(), "invalid_request_error");
    }

    #[test]
    fn node_error_kind_passes_through() {
        let e = ServerError::Node(NodeError::RateLimit("slow".into()));
        assert_eq!(e.kind(), "rate_limit_error");
    }
}

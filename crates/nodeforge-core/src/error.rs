//! Error taxonomy shared by nodes, graphs, and the workflow runtime (§7).
//!
//! Node-level failures never raise out of `execute` — they come back as a
//! [`NodeResult`](crate::node::NodeResult) with `success = false`. This enum exists for
//! the handful of places that do need a `Result`-returning API (graph/workflow setup,
//! history writer, terminal backend) and is always reducible to one of the `kind()`
//! strings that ends up on a node result.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Debug, Error, Clone)]
pub enum NodeError {
    #[error("node is stopped or not yet started: {0}")]
    NodeStopped(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation interrupted")]
    Interrupted,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("authentication error: {0}")]
    Authentication(String),

    #[error("permission error: {0}")]
    Permission(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    #[error("upstream api error: {0}")]
    Api(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("child process error: {0}")]
    Process(String),

    #[error("not implemented for this node variant: {0}")]
    NotImplemented(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl NodeError {
    /// The `error_type` string recorded on a node `Result` (§7 taxonomy).
    pub fn kind(&self) -> &'static str {
        match self {
            NodeError::NodeStopped(_) => "node_stopped",
            NodeError::Timeout => "timeout",
            NodeError::Interrupted => "interrupted",
            NodeError::InvalidRequest(_) => "invalid_request_error",
            NodeError::Authentication(_) => "authentication_error",
            NodeError::Permission(_) => "permission_error",
            NodeError::RateLimit(_) => "rate_limit_error",
            NodeError::Api(_) => "api_error",
            NodeError::Network(_) => "network_error",
            NodeError::Process(_) => "process_error",
            NodeError::NotImplemented(_) => "not_implemented",
            NodeError::Internal(_) => "internal_error",
        }
    }
}

impl From<nodeforge_llm::LlmError> for NodeError {
    fn from(e: nodeforge_llm::LlmError) -> Self {
        use nodeforge_llm::LlmError as L;
        match e {
            L::Authentication(m) => NodeError::Authentication(m),
            L::Permission(m) => NodeError::Permission(m),
            L::RateLimit(m) => NodeError::RateLimit(m),
            L::Api(m) => NodeError::Api(m),
            L::Network(err) => NodeError::Network(err.to_string()),
            L::InvalidRequest(m) => NodeError::InvalidRequest(m),
            L::Timeout => NodeError::Timeout,
            L::Interrupted => NodeError::Interrupted,
            L::NotImplemented(m) => NodeError::NotImplemented(m),
            L::Internal(m) => NodeError::Internal(m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llm_error_conversion_preserves_kind() {
        let err: NodeError = nodeforge_llm::LlmError::RateLimit("slow down".into()).into();
        assert_eq!(err.kind(), "rate_limit_error");
    }
}

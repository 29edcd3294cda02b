//! Error taxonomy for LLM clients and proxies.
//!
//! Variant names line up with the `error_type` kinds a node's `execute` result carries,
//! so a node can map an `LlmError` straight onto its result without a second translation.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    #[error("upstream API error: {0}")]
    Api(String),

    #[error("network error reaching upstream: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request timed out")]
    Timeout,

    #[error("request interrupted")]
    Interrupted,

    #[error("operation not implemented for this provider: {0}")]
    NotImplemented(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl LlmError {
    /// The `error_type` string recorded on a node `Result` (§7 taxonomy).
    pub fn kind(&self) -> &'static str {
        match self {
            LlmError::Authentication(_) => "authentication_error",
            LlmError::Permission(_) => "permission_error",
            LlmError::RateLimit(_) => "rate_limit_error",
            LlmError::Api(_) => "api_error",
            LlmError::Network(_) => "network_error",
            LlmError::InvalidRequest(_) => "invalid_request_error",
            LlmError::Timeout => "timeout",
            LlmError::Interrupted => "interrupted",
            LlmError::NotImplemented(_) => "not_implemented",
            LlmError::Internal(_) => "internal_error",
        }
    }

    /// Classify an HTTP status code the way every remote provider client needs to.
    pub fn from_status(status: reqwest::StatusCode, body: impl Into<String>) -> Self {
        let body = body.into();
        match status.as_u16() {
            401 => LlmError::Authentication(body),
            403 => LlmError::Permission(body),
            429 => LlmError::RateLimit(body),
            400..=499 => LlmError::InvalidRequest(body),
            _ => LlmError::Api(body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_expected_kinds() {
        assert_eq!(
            LlmError::from_status(reqwest::StatusCode::UNAUTHORIZED, "x").kind(),
            "authentication_error"
        );
        assert_eq!(
            LlmError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "x").kind(),
            "rate_limit_error"
        );
        assert_eq!(
            LlmError::from_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "x").kind(),
            "api_error"
        );
    }
}

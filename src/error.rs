//! Broker error taxonomy.
//!
//! Kinds map onto the HTTP surface in `server::error` and onto MCP error
//! content blocks in the façade. Library code propagates with `?`;
//! per-tool indexing failures are logged and skipped by the indexer.

use thiserror::Error;

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Embedding configuration missing: {0}")]
    ConfigMissing(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Vector dimension mismatch: expected {expected}, got {got}")]
    Shape { expected: usize, got: usize },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Stable machine-readable code, used in HTTP error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::Validation(_) => "validation_error",
            BrokerError::NotFound(_) => "not_found",
            BrokerError::Conflict(_) => "conflict",
            BrokerError::ConfigMissing(_) => "config_missing",
            BrokerError::Upstream(_) => "upstream_error",
            BrokerError::Shape { .. } => "shape_mismatch",
            BrokerError::Internal(_) => "internal_error",
        }
    }
}

impl From<rusqlite::Error> for BrokerError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, _) = &e {
            if failure.code == rusqlite::ErrorCode::ConstraintViolation {
                return BrokerError::Conflict(e.to_string());
            }
        }
        BrokerError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Internal(format!("serialization: {}", e))
    }
}

impl From<dext_mcp::McpError> for BrokerError {
    fn from(e: dext_mcp::McpError) -> Self {
        match e {
            dext_mcp::McpError::ToolNotFound(s) => BrokerError::NotFound(s),
            dext_mcp::McpError::Config(s) => BrokerError::Validation(s),
            other => BrokerError::Upstream(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(BrokerError::Validation("x".into()).code(), "validation_error");
        assert_eq!(BrokerError::NotFound("x".into()).code(), "not_found");
        assert_eq!(BrokerError::Conflict("x".into()).code(), "conflict");
        assert_eq!(
            BrokerError::Shape {
                expected: 4,
                got: 3
            }
            .code(),
            "shape_mismatch"
        );
    }

    #[test]
    fn test_mcp_error_mapping() {
        let e: BrokerError = dext_mcp::McpError::ToolNotFound("srv__t".into()).into();
        assert!(matches!(e, BrokerError::NotFound(_)));

        let e: BrokerError = dext_mcp::McpError::Transport("boom".into()).into();
        assert!(matches!(e, BrokerError::Upstream(_)));
    }
}

//! Error types for Almanac

use thiserror::Error;

/// Result type alias for Almanac operations
pub type Result<T> = std::result::Result<T, AlmanacError>;

/// Main error type for Almanac
#[derive(Error, Debug)]
pub enum AlmanacError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Connection not initialized: {0}")]
    Ordering(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Capability call timed out after {0}ms")]
    Timeout(u64),

    #[error("Dependency error: {0}")]
    Dependency(String),

    #[error("Ambiguous templates: {0}")]
    AmbiguousTemplates(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AlmanacError {
    /// Check if error is retryable by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(self, AlmanacError::Timeout(_))
    }

    /// Get error code for the JSON-RPC protocol
    pub fn code(&self) -> i64 {
        match self {
            AlmanacError::Parse(_) => -32700,
            AlmanacError::InvalidRequest(_) => -32600,
            AlmanacError::MethodNotFound(_) => -32601,
            AlmanacError::InvalidParams(_) => -32602,
            AlmanacError::NotFound(_) => -32001,
            AlmanacError::Ordering(_) => -32002,
            AlmanacError::Auth(_) => -32003,
            AlmanacError::Forbidden(_) => -32004,
            AlmanacError::Conflict(_) => -32005,
            AlmanacError::Timeout(_) => -32008,
            // Dependency detail stays in server logs; the caller sees Internal
            AlmanacError::Dependency(_) => -32000,
            _ => -32000,
        }
    }

    /// Message as sent to the caller. Dependency failures are collapsed so
    /// collaborator internals never leak into responses.
    pub fn public_message(&self) -> String {
        match self {
            AlmanacError::Dependency(_) => "Internal error".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(AlmanacError::Parse("x".into()).code(), -32700);
        assert_eq!(AlmanacError::MethodNotFound("x".into()).code(), -32601);
        assert_eq!(AlmanacError::NotFound("x".into()).code(), -32001);
        assert_eq!(AlmanacError::Ordering("x".into()).code(), -32002);
        assert_eq!(AlmanacError::Auth("x".into()).code(), -32003);
        assert_eq!(AlmanacError::Forbidden("x".into()).code(), -32004);
        assert_eq!(AlmanacError::Timeout(30_000).code(), -32008);
    }

    #[test]
    fn test_dependency_detail_hidden() {
        let err = AlmanacError::Dependency("postgres at 10.0.0.3 refused".into());
        assert_eq!(err.public_message(), "Internal error");
        assert_eq!(err.code(), -32000);
    }

    #[test]
    fn test_only_timeout_is_retryable() {
        assert!(AlmanacError::Timeout(1000).is_retryable());
        assert!(!AlmanacError::Dependency("x".into()).is_retryable());
        assert!(!AlmanacError::NotFound("x".into()).is_retryable());
    }
}

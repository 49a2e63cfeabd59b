//! Error types shared by every storage backend
//!
//! Variants are grouped by the stable category a caller can observe
//! through [`StoreError::kind`].

use thiserror::Error;

use crate::config::ConfigError;

/// Stable error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Precondition,
    NotFound,
    Conflict,
    Safety,
    Transient,
    Server,
    DryRun,
    InvalidBackup,
    Timeout,
    Partial,
    Io,
}

/// Core error type for graph store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Graph store is not connected")]
    NotConnected,

    #[error("Invalid graph name '{0}': must be non-empty and match [A-Za-z0-9_-]+")]
    InvalidGraphName(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Graph '{0}' does not exist")]
    GraphNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Graph '{0}' already exists")]
    GraphAlreadyExists(String),

    #[error("Index '{0}' already exists")]
    IndexAlreadyExists(String),

    #[error("Refusing to delete: {0}")]
    UnsafeDelete(String),

    #[error("Database unavailable: {0}")]
    Transient(String),

    #[error("{context}: {message}")]
    Server { context: String, message: String },

    #[error("Dry run: {matched} matching items would be deleted")]
    DryRun { matched: u64 },

    #[error("Invalid backup data: {0}")]
    InvalidBackup(String),

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("{} of the extraction results failed: {}", failures.len(), failures.join("; "))]
    Partial { failures: Vec<String> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Build a server error with call context
    pub fn server(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Server {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::NotConnected
            | Self::InvalidGraphName(_)
            | Self::Precondition(_)
            | Self::Unsupported(_) => ErrorKind::Precondition,
            Self::GraphNotFound(_) | Self::NotFound(_) => ErrorKind::NotFound,
            Self::GraphAlreadyExists(_) | Self::IndexAlreadyExists(_) => ErrorKind::Conflict,
            Self::UnsafeDelete(_) => ErrorKind::Safety,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Server { .. } => ErrorKind::Server,
            Self::DryRun { .. } => ErrorKind::DryRun,
            Self::InvalidBackup(_) | Self::Serialization(_) => ErrorKind::InvalidBackup,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Partial { .. } => ErrorKind::Partial,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether the caller may retry the operation as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Prefix the error with the operation it happened in.
    ///
    /// Only server errors gain context; typed errors keep their identity.
    pub fn with_context(self, context: &str) -> Self {
        match self {
            Self::Server {
                context: inner,
                message,
            } => Self::Server {
                context: format!("{context}: {inner}"),
                message,
            },
            other => other,
        }
    }
}

impl From<ConfigError> for StoreError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(StoreError::NotConnected.kind(), ErrorKind::Precondition);
        assert_eq!(
            StoreError::GraphAlreadyExists("a".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(StoreError::DryRun { matched: 3 }.kind(), ErrorKind::DryRun);
        assert!(StoreError::Transient("routing table".into()).is_retryable());
        assert!(!StoreError::server("query", "boom").is_retryable());
    }

    #[test]
    fn test_with_context_only_wraps_server_errors() {
        let err = StoreError::server("execute", "syntax error").with_context("query on graph 'A'");
        assert_eq!(err.to_string(), "query on graph 'A': execute: syntax error");

        let err = StoreError::GraphNotFound("A".into()).with_context("query");
        assert!(matches!(err, StoreError::GraphNotFound(_)));
    }

    #[test]
    fn test_partial_message() {
        let err = StoreError::Partial {
            failures: vec!["result 0: boom".into(), "result 2: bang".into()],
        };
        assert_eq!(
            err.to_string(),
            "2 of the extraction results failed: result 0: boom; result 2: bang"
        );
    }
}

//! Error types for mcpflow

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Connect error: {0}")]
    Connect(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Connection pool exhausted for server: {0}")]
    PoolExhausted(String),

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Pool shutdown forced after grace period ({0} connections closed)")]
    ShutdownForced(usize),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Node {node_id} failed: {source}")]
    Node {
        node_id: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Undefined variable: {0}")]
    UndefinedVariable(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap an error with the node it surfaced from.
    pub fn at_node(self, node_id: impl Into<String>) -> Self {
        match self {
            // Cancellation surfaces unchanged so the engine can tell it
            // apart from a node failure.
            Error::Cancelled => Error::Cancelled,
            other => Error::Node {
                node_id: node_id.into(),
                source: Box::new(other),
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connect(_) | Error::Timeout(_) | Error::Internal(_)
        )
    }

    pub fn is_cancellation(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Node { source, .. } => source.is_cancellation(),
            _ => false,
        }
    }
}

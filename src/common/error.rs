//! Error types for trinode

use crate::common::NodeId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("Database unreachable: {0}")]
    Connectivity(String),

    #[error("Lock conflict: {0}")]
    LockConflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // === Routing Errors ===
    #[error("No database node available")]
    NoAvailableNode,

    #[error("No write-capable node available (Main is down and Node A is not acting master)")]
    NoWritableNode,

    #[error("All nodes unreachable from {node} (attempted: {attempted:?}): {last_error}")]
    NoTargetAvailable {
        node: NodeId,
        attempted: Vec<NodeId>,
        last_error: String,
    },

    // === Transaction Log Errors ===
    #[error("Transaction log write failed: {0}")]
    LogWrite(String),

    #[error("Transaction {id} already {current}, refusing transition to {requested}")]
    LogConflict {
        id: String,
        current: String,
        requested: String,
    },

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Log record corrupted: {0}")]
    LogCorrupted(String),

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    // === Request / Config Errors ===
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Does this error mean the target could not be reached at all?
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Connectivity(_))
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidRequest(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::LockConflict(_) => StatusCode::CONFLICT,
            Error::Connectivity(_)
            | Error::NoAvailableNode
            | Error::NoWritableNode
            | Error::NoTargetAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable code for JSON error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Error::Connectivity(_) => "DATABASE_UNREACHABLE",
            Error::LockConflict(_) => "LOCK_CONFLICT",
            Error::NoAvailableNode | Error::NoTargetAvailable { .. } => "NO_NODE_AVAILABLE",
            Error::NoWritableNode => "NO_WRITABLE_NODE",
            Error::NotFound(_) => "NOT_FOUND",
            Error::InvalidRequest(_) => "INVALID_REQUEST",
            _ => "INTERNAL",
        }
    }
}

impl From<crate::storage::StorageError> for Error {
    fn from(e: crate::storage::StorageError) -> Self {
        use crate::storage::StorageErrorKind;
        match e.kind {
            StorageErrorKind::Connection => Error::Connectivity(e.message),
            StorageErrorKind::LockConflict => Error::LockConflict(e.message),
            StorageErrorKind::SyntaxOrLogic => Error::Storage(e.message),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_request() {
            Error::Connectivity(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidRequest(e.to_string())
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

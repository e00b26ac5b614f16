use thiserror::Error;

use crate::security::validation::{redact_secret, sanitize_for_display};

/// Errors surfaced by the report engine to its callers.
///
/// Each variant maps to one failure class: no variant is ever retried by the
/// engine, and none may carry a connection secret.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// Template or filter-value shape problem. No database was contacted.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Dial, authentication or timeout failure while reaching the backend.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The backend accepted the connection but rejected or failed the statement.
    #[error("Query execution error: {0}")]
    QueryExecution(String),

    /// Normalization or spreadsheet serialization failure.
    #[error("Export error: {0}")]
    Export(String),

    /// Misconfiguration: unsupported backend kind, undecryptable secret, bad settings.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The audit store could not be written or read.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Build a connection error from driver text, scrubbing the secret out of it.
    pub fn connection(err: &anyhow::Error, secret: Option<&str>) -> Self {
        Self::Connection(scrub(err, secret))
    }

    /// Build a query error from driver text, scrubbing the secret out of it.
    pub fn query(err: &anyhow::Error, secret: Option<&str>) -> Self {
        Self::QueryExecution(scrub(err, secret))
    }

    /// Short machine-friendly category name.
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Connection(_) => "connection",
            EngineError::QueryExecution(_) => "query",
            EngineError::Export(_) => "export",
            EngineError::Configuration(_) => "configuration",
            EngineError::Storage(_) => "storage",
        }
    }
}

fn scrub(err: &anyhow::Error, secret: Option<&str>) -> String {
    let text = format!("{:#}", err);
    let text = match secret {
        Some(secret) => redact_secret(&text, secret),
        None => text,
    };
    sanitize_for_display(&text)
}

pub type Result<T> = std::result::Result<T, EngineError>;

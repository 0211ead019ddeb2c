//! Error types for the autopilot risk core.
//!
//! Deny decisions from the guards are *not* errors; they travel as
//! [`crate::types::Verdict::Deny`]. Everything here is a failed operation.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("External dependency failure ({service}): {message}")]
    ExternalDependency { service: String, message: String },

    #[error("Timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Hedge error: {0}")]
    Hedge(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration file error: {0}")]
    ConfigFile(#[from] config::ConfigError),
}

/// Coarse classification used by transport layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    PermissionDenied,
    NotConfigured,
    ExternalDependency,
    Timeout,
    Internal,
}

impl Error {
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    pub fn external(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalDependency {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::Hedge(_) => ErrorKind::Validation,
            Error::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Error::NotConfigured(_) => ErrorKind::NotConfigured,
            Error::ExternalDependency { .. } | Error::Database(_) => ErrorKind::ExternalDependency,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Internal(_) | Error::Json(_) | Error::ConfigFile(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status an API layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::PermissionDenied => 403,
            ErrorKind::ExternalDependency => 502,
            ErrorKind::NotConfigured => 503,
            ErrorKind::Timeout => 504,
            ErrorKind::Internal => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

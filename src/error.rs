//! Error types for the CSI volume controller
//!
//! Every error maps onto a CSI status [`Code`]. Status-class variants carry
//! the complete user-visible message, including the operation name and the
//! volume or snapshot it concerns, so callers can correlate a failure with
//! its ledger record.

use thiserror::Error;

/// Unified error type for the controller
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Request Status Errors
    // =========================================================================
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Aborted(String),

    #[error("{0}")]
    Internal(String),

    #[error("{0}")]
    DeadlineExceeded(String),

    #[error("{0}")]
    Cancelled(String),

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Backend unavailable: {backend}")]
    BackendUnavailable { backend: String },

    #[error("Backend rejected {operation}: {reason}")]
    BackendRejected { operation: String, reason: String },

    // =========================================================================
    // Ledger Errors
    // =========================================================================
    #[error("Operation ledger unavailable: {store}")]
    LedgerUnavailable { store: String },

    #[error("Illegal ledger transition for {instance_name}: {from} -> {to}")]
    LedgerTransition {
        instance_name: String,
        from: String,
        to: String,
    },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Metrics registration error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// CSI status code an error is reported as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Aborted,
    Internal,
    Unavailable,
    DeadlineExceeded,
    Cancelled,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::InvalidArgument => "InvalidArgument",
            Code::NotFound => "NotFound",
            Code::AlreadyExists => "AlreadyExists",
            Code::FailedPrecondition => "FailedPrecondition",
            Code::Aborted => "Aborted",
            Code::Internal => "Internal",
            Code::Unavailable => "Unavailable",
            Code::DeadlineExceeded => "DeadlineExceeded",
            Code::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Status code reported to the orchestrator
    pub fn code(&self) -> Code {
        match self {
            Error::InvalidArgument(_) | Error::BackendRejected { .. } => Code::InvalidArgument,
            Error::FailedPrecondition(_) => Code::FailedPrecondition,
            Error::AlreadyExists(_) => Code::AlreadyExists,
            Error::NotFound(_) => Code::NotFound,
            Error::Aborted(_) => Code::Aborted,
            Error::DeadlineExceeded(_) => Code::DeadlineExceeded,
            Error::Cancelled(_) => Code::Cancelled,

            Error::BackendUnavailable { .. } | Error::LedgerUnavailable { .. } => {
                Code::Unavailable
            }

            Error::Internal(_)
            | Error::LedgerTransition { .. }
            | Error::Configuration(_)
            | Error::Kube(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_)
            | Error::Metrics(_)
            | Error::Io(_) => Code::Internal,
        }
    }

    /// Check if this error is transient (safe to retry unchanged)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::BackendUnavailable { .. } | Error::LedgerUnavailable { .. } | Error::Kube(_)
        )
    }

    /// Check if the caller may retry after this error
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.code(),
            Code::InvalidArgument | Code::AlreadyExists | Code::NotFound
        )
    }
}

/// Result type alias for the controller
pub type Result<T> = std::result::Result<T, Error>;

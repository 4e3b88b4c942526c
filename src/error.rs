use thiserror::Error;
use uuid::Uuid;

/// Unified error type for the runner
#[derive(Error, Debug)]
pub enum RunnerError {
    // Construction errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Control errors
    #[error("Cannot {operation} while {status}")]
    InvalidState {
        operation: &'static str,
        status: String,
    },

    #[error("Not supported: {0}")]
    NotSupported(String),

    // Job errors
    #[error("Job setup failed: {0}")]
    JobSetup(String),

    #[error("Job not found: {id}")]
    JobNotFound { id: Uuid },

    // Proxy errors
    #[error("No proxies available")]
    NoProxiesAvailable,

    #[error("Proxy connection failed: {0}")]
    ProxyConnectionFailed(String),

    /// Handshake failure reported by a proxy protocol client
    #[error("{0}")]
    ProxyProtocol(String),

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Operation was cancelled")]
    Cancelled,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for runner operations
pub type Result<T> = std::result::Result<T, RunnerError>;

impl RunnerError {
    pub(crate) fn invalid_state(operation: &'static str, status: impl std::fmt::Display) -> Self {
        RunnerError::InvalidState {
            operation,
            status: status.to_string(),
        }
    }

    /// Check if this error represents a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunnerError::Cancelled)
    }

    /// Check if this error was produced while talking to a proxy
    pub fn is_proxy_error(&self) -> bool {
        matches!(
            self,
            RunnerError::ProxyConnectionFailed(_)
                | RunnerError::ProxyProtocol(_)
                | RunnerError::InvalidProxyAddress(_)
                | RunnerError::UnsupportedProtocol(_)
                | RunnerError::Timeout
        )
    }
}

/// Check whether an opaque operation error is a cancellation
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<RunnerError>()
        .map(RunnerError::is_cancelled)
        .unwrap_or(false)
}

// Convert from hyper errors
impl From<hyper::Error> for RunnerError {
    fn from(err: hyper::Error) -> Self {
        RunnerError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for RunnerError {
    fn from(err: url::ParseError) -> Self {
        RunnerError::InvalidConfig(format!("invalid URL: {}", err))
    }
}

impl From<regex::Error> for RunnerError {
    fn from(err: regex::Error) -> Self {
        RunnerError::JobSetup(format!("invalid data regex: {}", err))
    }
}

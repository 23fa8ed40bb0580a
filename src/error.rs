//! Error types for the fragment cache

use thiserror::Error;

/// Result type alias for fragment cache operations
pub type Result<T> = std::result::Result<T, FragmentError>;

/// Error types that can occur in the fragment cache
#[derive(Error, Debug, Clone)]
pub enum FragmentError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Fragment {id} is already committed; metadata can no longer change")]
    FragmentCommitted { id: String },

    #[error("Unknown generator '{name}' for resource '{resource}'")]
    UnknownGenerator { name: String, resource: String },

    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("External cache '{adapter}' failed: {message}")]
    AdapterError { adapter: String, message: String },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("External cache returned {status}: {message}")]
    ExternalStatus { status: u16, message: String },

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for FragmentError {
    fn from(err: std::io::Error) -> Self {
        FragmentError::IoError(err.to_string())
    }
}

impl FragmentError {
    /// Determine if this error should trigger a retry of an external cache call
    ///
    /// Transient failures (transport errors, timeouts surfaced as IO, 5xx from the
    /// external cache) are retried. Configuration and protocol errors, 4xx
    /// replies and state violations are not.
    pub fn should_retry(&self) -> bool {
        match self {
            FragmentError::HttpError(_) => true,
            FragmentError::IoError(_) => true,
            FragmentError::ExternalStatus { status, .. } => *status >= 500,

            FragmentError::ConfigError(_) => false,
            FragmentError::FragmentCommitted { .. } => false,
            FragmentError::UnknownGenerator { .. } => false,
            FragmentError::AdapterError { .. } => false,
            FragmentError::ParseError(_) => false,
            FragmentError::InternalError(_) => false,
        }
    }

    /// Create an error from an external cache HTTP status code
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        FragmentError::ExternalStatus {
            status,
            message: message.into(),
        }
    }

    /// Create an adapter error tagged with the adapter name
    pub fn adapter(adapter: impl Into<String>, message: impl Into<String>) -> Self {
        FragmentError::AdapterError {
            adapter: adapter.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(FragmentError::HttpError("reset".into()).should_retry());
        assert!(FragmentError::from_http_status(503, "busy").should_retry());
        assert!(!FragmentError::from_http_status(404, "gone").should_retry());
        assert!(!FragmentError::ConfigError("bad".into()).should_retry());
        assert!(!FragmentError::FragmentCommitted { id: "/a".into() }.should_retry());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: FragmentError = io.into();
        assert!(matches!(err, FragmentError::IoError(ref msg) if msg.contains("pipe closed")));
    }
}

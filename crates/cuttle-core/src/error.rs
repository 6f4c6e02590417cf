//! Error types for the handler pipeline

/// Result type alias using [`Error`]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error surfaced to the pipeline's error-handling path
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid HTTP request
    #[error("Invalid HTTP request: {0}")]
    InvalidRequest(String),

    /// Configuration error (never reaches request handling)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A handler stage failed while processing the request
    #[error("Handler error in '{handler}': {message}")]
    Handler {
        /// Handler name
        handler: String,
        /// Error message
        message: String,
    },

    /// The request was cancelled (client disconnect, deadline)
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// I/O error, including failed writes to the client
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    HttpError(#[from] http::Error),

    /// Internal error (should not happen in production)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert error to HTTP status code
    pub fn to_status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::Cancelled(_) => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Create a handler error
    pub fn handler(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Handler {
            handler: handler.into(),
            message: message.into(),
        }
    }

    /// Whether this error represents a client-initiated abort rather than a bug
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            Error::InvalidRequest("bad".to_string()).to_status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Cancelled("client went away".to_string()).to_status_code(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            Error::handler("script", "boom").to_status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_handler_error() {
        let err = Error::handler("script", "type mismatch");
        assert!(matches!(err, Error::Handler { .. }));
        assert!(err.to_string().contains("script"));
        assert!(!err.is_cancellation());
        assert!(Error::Cancelled("deadline".into()).is_cancellation());
    }
}

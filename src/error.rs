//! Error types for dataverse-sync.

use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for dataverse-sync operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
        /// Source error if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Requested job keys that are not in the registry
    #[error("Unknown table keys: {invalid:?}. Valid keys: {valid:?}")]
    Selection {
        /// Keys that were requested but not registered
        invalid: Vec<String>,
        /// Every registered key, in registry order
        valid: Vec<String>,
    },

    /// Token acquisition failed
    #[error("Authentication error: {message}")]
    Auth {
        /// Error message
        message: String,
        /// HTTP status returned by the token endpoint, if any
        status: Option<u16>,
        /// Source error
        #[source]
        source: Option<reqwest::Error>,
    },

    /// Non-success, non-throttle HTTP status from the Web API
    #[error("Request to {url} failed with HTTP {status}: {body}")]
    RemoteRequest {
        /// HTTP status code
        status: u16,
        /// Request URL
        url: String,
        /// Response body (truncated)
        body: String,
    },

    /// Throttle retry ceiling reached
    #[error("Request to {url} still throttled after {attempts} attempts")]
    ThrottleExhausted {
        /// Request URL
        url: String,
        /// Number of throttled attempts
        attempts: u32,
    },

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Staging store connection error
    #[error("Store connection error: {message}")]
    StoreConnection {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<tokio_postgres::Error>,
    },

    /// Staging store operation error
    #[error("Storage error on '{location}': {message}")]
    Storage {
        /// Staging location (schema.table) or statement context
        location: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<tokio_postgres::Error>,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with source.
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a selection error.
    pub fn selection(invalid: Vec<String>, valid: Vec<String>) -> Self {
        Self::Selection { invalid, valid }
    }

    /// Create an authentication error.
    pub fn auth(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Auth {
            message: message.into(),
            status,
            source: None,
        }
    }

    /// Create an authentication error from a transport failure.
    pub fn auth_transport(message: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Auth {
            message: message.into(),
            status: source.status().map(|s| s.as_u16()),
            source: Some(source),
        }
    }

    /// Create a remote request error.
    pub fn remote_request(status: u16, url: impl Into<String>, body: impl Into<String>) -> Self {
        Self::RemoteRequest {
            status,
            url: url.into(),
            body: truncate(body.into(), 512),
        }
    }

    /// Create a store connection error.
    pub fn store_connection(message: impl Into<String>, source: tokio_postgres::Error) -> Self {
        Self::StoreConnection {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a storage error without an underlying driver error.
    pub fn storage(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            location: location.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a storage error from a driver error.
    pub fn storage_pg(
        location: impl Into<String>,
        message: impl Into<String>,
        source: tokio_postgres::Error,
    ) -> Self {
        Self::Storage {
            location: location.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a serialization error.
    pub fn serialization(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::StoreConnection { .. } => true,
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            Error::Auth { status, source, .. } => match (status, source) {
                (Some(code), _) => *code >= 500 || *code == 429,
                (None, Some(e)) => e.is_timeout() || e.is_connect(),
                (None, None) => false,
            },
            _ => false,
        }
    }

    /// Get the error code for metrics/logging.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "CONFIG_ERROR",
            Error::Selection { .. } => "SELECTION_ERROR",
            Error::Auth { .. } => "AUTH_ERROR",
            Error::RemoteRequest { .. } => "REMOTE_REQUEST_ERROR",
            Error::ThrottleExhausted { .. } => "THROTTLE_EXHAUSTED",
            Error::Http(_) => "HTTP_ERROR",
            Error::StoreConnection { .. } => "STORE_CONNECTION_ERROR",
            Error::Storage { .. } => "STORAGE_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Serialization { .. } => "SERIALIZATION_ERROR",
        }
    }

    /// Process exit status for this error.
    ///
    /// Unknown job keys are reported with a distinct status so wrappers can
    /// tell a bad invocation apart from a failed sync.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Selection { .. } => 2,
            _ => 1,
        }
    }
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push_str("...");
    }
    s
}

/// Error context extension trait.
pub trait ErrorContext<T> {
    /// Add context with a closure (lazy evaluation).
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ErrorContext<T>
    for std::result::Result<T, E>
{
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::config_with_source(f(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_wraps_source() {
        let io: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "missing"));
        let err = io.with_context(|| "Failed to read app.toml".to_string()).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
        assert!(err.to_string().contains("app.toml"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::config("test").code(), "CONFIG_ERROR");
        assert_eq!(Error::validation("test").code(), "VALIDATION_ERROR");
        assert_eq!(Error::storage("s.t", "boom").code(), "STORAGE_ERROR");
        assert_eq!(
            Error::remote_request(404, "http://x", "").code(),
            "REMOTE_REQUEST_ERROR"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(!Error::config("test").is_retryable());
        assert!(!Error::remote_request(500, "http://x", "").is_retryable());
        assert!(Error::auth("token endpoint unavailable", Some(503)).is_retryable());
        assert!(!Error::auth("bad secret", Some(401)).is_retryable());
    }

    #[test]
    fn test_selection_exit_code_and_message() {
        let err = Error::selection(
            vec!["unknown_key".into()],
            vec!["new_servloc".into(), "systemusers".into()],
        );
        assert_eq!(err.exit_code(), 2);
        let msg = err.to_string();
        assert!(msg.contains("unknown_key"));
        assert!(msg.contains("systemusers"));
        assert_eq!(Error::config("x").exit_code(), 1);
    }

    #[test]
    fn test_remote_request_body_truncated() {
        let err = Error::remote_request(500, "http://x", "é".repeat(600));
        match err {
            Error::RemoteRequest { body, .. } => {
                assert!(body.len() <= 515);
                assert!(body.ends_with("..."));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

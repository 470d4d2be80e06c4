//! Common error types for etcdform.

use thiserror::Error;

/// Top-level error type for etcdform operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Provider configuration is invalid (scheme, endpoints, credentials).
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS material could not be loaded or is malformed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Request could not be delivered to any endpoint.
    #[error("Network error: {0}")]
    Network(String),

    /// No response headers arrived within the per-request timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Store rejected the supplied credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Key or directory not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Key or directory already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Precondition failed: the remote version moved since it was last read.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Any other error reported by the store.
    #[error("Store error {code}: {message} ({cause})")]
    Store {
        code: u32,
        message: String,
        cause: String,
    },

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether the failure is worth retrying by the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_))
    }

    /// Whether the failure is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Whether the error should abort provider initialization.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Tls(_))
    }

    /// Prefix the message with the resource path, keeping the error kind.
    ///
    /// Messages that already start with the path are left as they are.
    pub fn for_path(self, path: impl std::fmt::Display) -> Self {
        let path = path.to_string();
        let prefix = |m: String| {
            if m.strip_prefix(path.as_str()).is_some_and(|rest| rest.starts_with(':')) {
                m
            } else {
                format!("{}: {}", path, m)
            }
        };
        match self {
            Error::Config(m) => Error::Config(prefix(m)),
            Error::Tls(m) => Error::Tls(prefix(m)),
            Error::Network(m) => Error::Network(prefix(m)),
            Error::Timeout(m) => Error::Timeout(prefix(m)),
            Error::Authentication(m) => Error::Authentication(prefix(m)),
            Error::InvalidInput(m) => Error::InvalidInput(prefix(m)),
            Error::NotFound(m) => Error::NotFound(prefix(m)),
            Error::AlreadyExists(m) => Error::AlreadyExists(prefix(m)),
            Error::Conflict(m) => Error::Conflict(prefix(m)),
            Error::Store {
                code,
                message,
                cause,
            } => Error::Store {
                code,
                message: prefix(message),
                cause,
            },
            Error::Serialization(m) => Error::Serialization(prefix(m)),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), prefix(e.to_string()))),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

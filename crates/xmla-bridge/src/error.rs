//! Error types for xmla-bridge
//!
//! Errors are classified so the executor knows what it may retry:
//! - Connection-class failures (transport or session unusable) are retried
//! - Everything else (configuration, naming, query content, cancellation)
//!   propagates immediately

use std::fmt;
use thiserror::Error;

/// Result type for xmla-bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Invalid options, raised at startup
    Configuration,
    /// Transport or session failure (retriable)
    Connection,
    /// Session proactively detected as past its validity window
    SessionExpired,
    /// Parameter name violates the naming convention
    ParameterNaming,
    /// Caller aborted the operation
    Cancelled,
    /// Connection failures persisted past the attempt budget
    RetryExhausted,
    /// Query content errors reported by the engine
    Query,
    /// Result column could not be bound to a destination field
    Mapping,
    /// Pool could not hand out a connection in time, or is shut down
    Pool,
    /// Output sink or serialization failure
    Io,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether the query executor retries errors in this category
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection)
    }
}

/// Main error type for xmla-bridge
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Invalid connection or pool options
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Transient failure talking to the remote engine
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Session is past its usable window
    #[error("session {session_id} expired")]
    SessionExpired { session_id: String },

    /// Parameter name carries the query language's marker prefix
    #[error("invalid parameter name '{name}': {message}")]
    ParameterNaming { name: String, message: String },

    /// Operation cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// Connection failures exceeded the attempt budget
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// Query rejected or failed on the engine
    #[error("query error: {message}")]
    Query { message: String },

    /// Declared column mapping failed
    #[error("mapping error: {message}")]
    Mapping { message: String },

    /// Timed out waiting for a pooled connection
    #[error("pool exhausted: {message}")]
    PoolExhausted { message: String },

    /// Pool has been shut down
    #[error("pool is closed")]
    PoolClosed,

    /// Output sink failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::SessionExpired { .. } => ErrorCategory::SessionExpired,
            Self::ParameterNaming { .. } => ErrorCategory::ParameterNaming,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::RetryExhausted { .. } => ErrorCategory::RetryExhausted,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Mapping { .. } => ErrorCategory::Mapping,
            Self::PoolExhausted { .. } | Self::PoolClosed => ErrorCategory::Pool,
            Self::Io(_) | Self::Serialization(_) => ErrorCategory::Io,
            Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable by the query executor
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Whether the connection that produced this error must be replaced
    #[inline]
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Whether this error is raised at startup and cannot be fixed by
    /// retrying the call
    #[inline]
    pub fn is_startup(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a parameter naming error
    pub fn parameter_naming(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ParameterNaming {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }

    /// Create a mapping error
    pub fn mapping(message: impl Into<String>) -> Self {
        Self::Mapping {
            message: message.into(),
        }
    }

    /// Wrap the last connection failure once the attempt budget is spent
    pub fn retry_exhausted(attempts: u32, last: Error) -> Self {
        Self::RetryExhausted {
            attempts,
            source: Box::new(last),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Connection => write!(f, "connection"),
            Self::SessionExpired => write!(f, "session_expired"),
            Self::ParameterNaming => write!(f, "parameter_naming"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::RetryExhausted => write!(f, "retry_exhausted"),
            Self::Query => write!(f, "query"),
            Self::Mapping => write!(f, "mapping"),
            Self::Pool => write!(f, "pool"),
            Self::Io => write!(f, "io"),
            Self::Other => write!(f, "other"),
        }
    }
}

//! Error types for the tiered cache

use std::sync::Arc;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, CacheError>;

/// Boxed error accepted from factories and external collaborators
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Coarse classification of a [`CacheError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotRegistered,
    Deserialization,
    Serialization,
    UnsupportedOperation,
    Upstream,
    Cancelled,
    Config,
}

/// Errors that can occur in the tiered cache.
///
/// The type is `Clone` so that a single factory outcome can be handed to
/// every caller coalesced onto the same in-flight computation.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// Malformed input (empty key, empty cache name)
    #[error("Invalid argument '{argument}': {reason}")]
    InvalidArgument { argument: &'static str, reason: String },

    /// Provider lookup failure
    #[error("{kind} provider '{name}' is not registered")]
    NotRegistered { kind: ProviderKind, name: String },

    /// Payload could not be reconstructed into its declared type
    #[error("Failed to deserialize cache value of type '{type_name}': {source}")]
    Deserialization {
        type_name: String,
        #[source]
        source: Arc<serde_json::Error>,
    },

    /// Value could not be encoded into the cache envelope
    #[error("Failed to serialize cache value of type '{type_name}': {source}")]
    Serialization {
        type_name: String,
        #[source]
        source: Arc<serde_json::Error>,
    },

    /// Operation not supported by the configured tier combination
    #[error("Operation '{operation}' is not supported: {reason}")]
    UnsupportedOperation {
        operation: &'static str,
        reason: String,
    },

    /// Factory, distributed cache or backplane call failed
    #[error("Upstream failure: {message}")]
    Upstream {
        message: String,
        #[source]
        source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// Caller gave up (cancellation token fired or deadline elapsed)
    #[error("Operation cancelled: {reason}")]
    Cancelled { reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Provider role used in registry errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Distributed,
    Backplane,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Distributed => write!(f, "Distributed cache"),
            ProviderKind::Backplane => write!(f, "Backplane"),
        }
    }
}

impl CacheError {
    /// Wrap any error raised by a factory or remote tier as an upstream failure
    pub fn upstream<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        let boxed: BoxError = err.into();
        Self::Upstream {
            message: boxed.to_string(),
            source: Some(Arc::from(boxed)),
        }
    }

    /// Upstream failure carrying only a message
    pub fn upstream_msg(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
            source: None,
        }
    }

    pub fn invalid_argument(argument: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            argument,
            reason: reason.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn unsupported(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            operation,
            reason: reason.into(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            CacheError::NotRegistered { .. } => ErrorKind::NotRegistered,
            CacheError::Deserialization { .. } => ErrorKind::Deserialization,
            CacheError::Serialization { .. } => ErrorKind::Serialization,
            CacheError::UnsupportedOperation { .. } => ErrorKind::UnsupportedOperation,
            CacheError::Upstream { .. } => ErrorKind::Upstream,
            CacheError::Cancelled { .. } => ErrorKind::Cancelled,
            CacheError::Config(_) => ErrorKind::Config,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, CacheError::Cancelled { .. })
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self, CacheError::Upstream { .. })
    }

    /// Whether fail-safe may absorb this error by serving a stale value
    pub fn is_recoverable_by_fail_safe(&self) -> bool {
        matches!(
            self,
            CacheError::Upstream { .. } | CacheError::Cancelled { .. }
        )
    }
}

impl From<serde_yaml::Error> for CacheError {
    fn from(err: serde_yaml::Error) -> Self {
        CacheError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_wraps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "db down");
        let err = CacheError::upstream(io);
        assert_eq!(err.kind(), ErrorKind::Upstream);
        assert!(err.to_string().contains("db down"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_not_registered_display() {
        let err = CacheError::NotRegistered {
            kind: ProviderKind::Backplane,
            name: "Redis".into(),
        };
        assert_eq!(err.to_string(), "Backplane provider 'Redis' is not registered");
    }

    #[test]
    fn test_clone_preserves_kind() {
        let err = CacheError::cancelled("deadline elapsed");
        let cloned = err.clone();
        assert!(cloned.is_cancellation());
        assert!(cloned.is_recoverable_by_fail_safe());
        assert!(!CacheError::invalid_argument("key", "empty").is_recoverable_by_fail_safe());
    }
}

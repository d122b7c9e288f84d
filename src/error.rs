//! Error types for the query cache.

use std::fmt;

/// Result type for query cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the query cache.
///
/// Every fallible operation returns `Result<T>`. The variants follow the
/// stages of a cached call: building the key, talking to the cache store,
/// decoding a stored entry, and running the real query.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The query could not be turned into a canonical statement.
    ///
    /// Raised before any cache or database interaction happens.
    /// Common causes:
    /// - Include names an association the model does not declare
    /// - Aggregate over an empty column name
    /// - Statement compiler rejected the options
    KeyGeneration(String),

    /// Cache store error (Redis, in-memory, custom).
    ///
    /// On the read path this reaches the caller under
    /// [`FailurePolicy::FailClosed`](crate::config::FailurePolicy). On the
    /// populate path it is logged and recorded, never returned.
    Backend(String),

    /// Encoding a fresh result for storage failed.
    Serialization(String),

    /// A stored entry could not be parsed back into a result.
    ///
    /// Not treated as a cache miss: the caller sees the error.
    Deserialization(String),

    /// The stored entry does not carry our envelope header.
    InvalidCacheEntry(String),

    /// The stored entry was written by an incompatible codec version.
    VersionMismatch {
        /// Version understood by this build
        expected: u32,
        /// Version found in the stored entry
        found: u32,
    },

    /// Error raised by the database collaborator, passed through unchanged.
    Database(String),

    /// Invalid configuration value.
    Config(String),

    /// Operation not supported by this backend or data source.
    NotImplemented(String),

    /// Generic error with custom message.
    Other(String),
}

impl Error {
    /// True for the errors a stored entry can produce while decoding.
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            Error::Deserialization(_) | Error::InvalidCacheEntry(_) | Error::VersionMismatch { .. }
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::KeyGeneration(msg) => write!(f, "Key generation error: {}", msg),
            Error::Backend(msg) => write!(f, "Backend error: {}", msg),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Deserialization(msg) => write!(f, "Deserialization error: {}", msg),
            Error::InvalidCacheEntry(msg) => write!(f, "Invalid cache entry: {}", msg),
            Error::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "Cache version mismatch: expected {}, found {}",
                    expected, found
                )
            }
            Error::Database(msg) => write!(f, "Database error: {}", msg),
            Error::Config(msg) => write!(f, "Config error: {}", msg),
            Error::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Error::Backend(e.to_string())
        } else if e.is_syntax() || e.is_eof() || e.is_data() {
            Error::Deserialization(e.to_string())
        } else {
            Error::Serialization(e.to_string())
        }
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Backend(format!("Redis error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::KeyGeneration("unknown association".to_string());
        assert_eq!(
            err.to_string(),
            "Key generation error: unknown association"
        );
    }

    #[test]
    fn test_error_from_string() {
        let err: Error = "test error".into();
        assert!(matches!(err, Error::Other(_)));
    }

    #[test]
    fn test_syntax_error_maps_to_deserialization() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::Deserialization(_)));
        assert!(err.is_decode());
    }

    #[test]
    fn test_version_mismatch_display() {
        let err = Error::VersionMismatch {
            expected: 1,
            found: 7,
        };
        assert_eq!(err.to_string(), "Cache version mismatch: expected 1, found 7");
        assert!(err.is_decode());
    }
}

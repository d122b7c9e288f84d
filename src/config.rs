//! Setup-time configuration.
//!
//! ```
//! use query_cache::config::{CacheConfig, FailurePolicy, StatusScope};
//!
//! let config = CacheConfig::default()
//!     .with_key_prefix("billing")
//!     .with_failure_policy(FailurePolicy::FailOpen)
//!     .with_status_scope(StatusScope::PerConnection);
//!
//! assert_eq!(config.key_prefix, "billing");
//! ```

use crate::error::{Error, Result};
use crate::key::DEFAULT_KEY_PREFIX;

/// What a cached call does when the cache store fails on read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Return the backend error to the caller.
    #[default]
    FailClosed,
    /// Log the error and run the real query as on a miss.
    FailOpen,
}

/// Where the last-call hit/miss flag is kept.
///
/// The flag is shared state: interleaved calls on the same slot overwrite
/// each other. Use the [`Cached`](crate::status::Cached) envelope for a
/// per-call answer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StatusScope {
    /// One flag per model. Free-form queries use the connection flag.
    #[default]
    PerModel,
    /// A single flag for every call.
    PerConnection,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// First segment of every cache key.
    pub key_prefix: String,
    pub failure_policy: FailurePolicy,
    pub status_scope: StatusScope,
    /// Also intercept free-form queries, not just model operations.
    pub intercept_raw_queries: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            failure_policy: FailurePolicy::default(),
            status_scope: StatusScope::default(),
            intercept_raw_queries: true,
        }
    }
}

impl CacheConfig {
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_status_scope(mut self, scope: StatusScope) -> Self {
        self.status_scope = scope;
        self
    }

    pub fn with_raw_queries(mut self, intercept: bool) -> Self {
        self.intercept_raw_queries = intercept;
        self
    }

    /// Defaults overridden by environment variables:
    ///
    /// - `QUERY_CACHE_KEY_PREFIX`
    /// - `QUERY_CACHE_FAIL_OPEN` (`true`/`false`/`1`/`0`)
    /// - `QUERY_CACHE_STATUS_SCOPE` (`model`/`connection`)
    /// - `QUERY_CACHE_RAW_QUERIES` (`true`/`false`/`1`/`0`)
    ///
    /// # Errors
    ///
    /// `Error::Config` when a variable is set to an unrecognised value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = CacheConfig::default();

        if let Some(prefix) = lookup("QUERY_CACHE_KEY_PREFIX") {
            if prefix.is_empty() {
                return Err(Error::Config(
                    "QUERY_CACHE_KEY_PREFIX must not be empty".to_string(),
                ));
            }
            config.key_prefix = prefix;
        }
        if let Some(value) = lookup("QUERY_CACHE_FAIL_OPEN") {
            config.failure_policy = if parse_bool("QUERY_CACHE_FAIL_OPEN", &value)? {
                FailurePolicy::FailOpen
            } else {
                FailurePolicy::FailClosed
            };
        }
        if let Some(value) = lookup("QUERY_CACHE_STATUS_SCOPE") {
            config.status_scope = match value.to_ascii_lowercase().as_str() {
                "model" => StatusScope::PerModel,
                "connection" => StatusScope::PerConnection,
                _ => {
                    return Err(Error::Config(format!(
                        "QUERY_CACHE_STATUS_SCOPE={}: expected model or connection",
                        value
                    )))
                }
            };
        }
        if let Some(value) = lookup("QUERY_CACHE_RAW_QUERIES") {
            config.intercept_raw_queries = parse_bool("QUERY_CACHE_RAW_QUERIES", &value)?;
        }

        Ok(config)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(Error::Config(format!(
            "{}={}: expected true or false",
            name, value
        ))),
    }
}

//! Cache key generation.
//!
//! Keys are namespaced strings:
//!
//! ```text
//! model calls:   {prefix}:{table}:{method}:{sha256(statement)}
//! free-form SQL: {prefix}:{table or empty}:{sha256(sql ++ json(replacements) ++ json(bind))}
//! ```

use crate::descriptor::QueryDescriptor;
use crate::error::{Error, Result};
use crate::model::ModelRegistry;
use crate::statement::StatementCompiler;
use sha2::{Digest, Sha256};

/// Namespace used when none is configured.
pub const DEFAULT_KEY_PREFIX: &str = "query-cache";

/// Builder for cache keys.
#[derive(Clone, Debug)]
pub struct CacheKeyBuilder {
    prefix: String,
}

impl CacheKeyBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        CacheKeyBuilder {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Derive the key for one call.
    ///
    /// Model calls hash the statement `compiler` renders for them, so two
    /// calls share a key exactly when they compile to the same SQL.
    /// Free-form queries hash their text plus a stable serialization of the
    /// bound parameters.
    ///
    /// # Errors
    ///
    /// `Error::KeyGeneration` for unregistered models or options the
    /// compiler cannot expand.
    pub fn generate(
        &self,
        descriptor: &QueryDescriptor<'_>,
        registry: &ModelRegistry,
        compiler: &dyn StatementCompiler,
    ) -> Result<String> {
        match descriptor {
            QueryDescriptor::Query { sql, options } => {
                let table = match options.model.as_deref() {
                    Some(name) => registry
                        .get(name)
                        .map(|m| m.table_name().to_string())
                        .ok_or_else(|| unknown_model(name))?,
                    None => String::new(),
                };

                let mut statement = normalize_sql(sql);
                if let Some(replacements) = &options.replacements {
                    statement.push_str(&serde_json::to_string(replacements)?);
                }
                if !options.bind.is_empty() {
                    statement.push_str(&serde_json::to_string(&options.bind)?);
                }

                let hash = Self::content_hash(&statement);
                Ok(Self::build_composite(&[
                    self.prefix.as_str(),
                    table.as_str(),
                    hash.as_str(),
                ]))
            }
            _ => {
                let name = descriptor
                    .model()
                    .ok_or_else(|| Error::KeyGeneration("call has no model".to_string()))?;
                let model = registry.get(name).ok_or_else(|| unknown_model(name))?;
                let statement = compiler.select_query(registry, model, descriptor)?;

                let hash = Self::content_hash(&statement);
                Ok(Self::build_composite(&[
                    self.prefix.as_str(),
                    model.table_name(),
                    descriptor.method().name(),
                    hash.as_str(),
                ]))
            }
        }
    }

    /// Hex-encoded SHA-256 of a canonical statement.
    pub fn content_hash(statement: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(statement.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Build composite key from multiple parts.
    pub fn build_composite(parts: &[&str]) -> String {
        parts.join(":")
    }

    /// Parse a composite key into parts.
    pub fn parse(key: &str) -> Vec<&str> {
        key.split(':').collect()
    }
}

impl Default for CacheKeyBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

fn unknown_model(name: &str) -> Error {
    Error::KeyGeneration(format!("model {} is not registered", name))
}

/// Collapse whitespace runs outside quoted literals and identifiers, and trim.
///
/// Quoted text is copied verbatim, so two statements that differ inside a
/// literal never normalise to the same string.
pub fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;

    for c in sql.trim().chars() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c.is_whitespace() => pending_space = true,
            None => {
                if pending_space {
                    out.push(' ');
                    pending_space = false;
                }
                if c == '\'' || c == '"' {
                    quote = Some(c);
                }
                out.push(c);
            }
        }
    }

    out
}

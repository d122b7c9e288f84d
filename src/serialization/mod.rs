//! Result codec with versioned envelopes.
//!
//! Every cache entry follows this format:
//! ```text
//! ┌─────────────────┬─────────────────┬───────────────┬──────────────────────────┐
//! │  MAGIC (4 bytes)│VERSION (4 bytes)│SHAPE (1 byte) │  JSON PAYLOAD (N bytes)  │
//! └─────────────────┴─────────────────┴───────────────┴──────────────────────────┘
//!   "QCJS"              u32 (LE)        0 / 1 / 2       serde_json::to_vec(result)
//! ```
//!
//! The shape byte records which [`QueryResult`] variant was stored: a scalar,
//! a single row (an object or `null`) or a row collection (an array). The
//! payload is its plain structural form. Decoding uses the [`QueryDescriptor`]
//! of the call to decide whether rows become model records again.
//!
//! # Example
//!
//! ```rust
//! use query_cache::descriptor::QueryDescriptor;
//! use query_cache::model::{ModelRegistry, QueryResult};
//! use query_cache::options::FindOptions;
//! use query_cache::serialization::{decode, encode};
//! use serde_json::json;
//!
//! # fn main() -> query_cache::Result<()> {
//! let options = FindOptions::default();
//! let descriptor = QueryDescriptor::Count { model: "projects", options: &options };
//!
//! let bytes = encode(&QueryResult::Scalar(json!(2)))?;
//! let decoded = decode(&bytes, &descriptor, &ModelRegistry::new())?;
//! assert_eq!(decoded, QueryResult::Scalar(json!(2)));
//! # Ok(())
//! # }
//! ```

use crate::descriptor::{Method, QueryDescriptor};
use crate::error::{Error, Result};
use crate::model::{ModelDef, ModelRegistry, QueryResult, Record};
use serde_json::{Map, Value};
use std::fmt;

/// Magic header for query-cache entries: b"QCJS"
pub const CACHE_MAGIC: [u8; 4] = *b"QCJS";

/// Current payload version.
///
/// Increment when the structural form of a result changes. Entries written
/// by another version fail to decode instead of being misread.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

const VERSIONED_LEN: usize = 8;
const HEADER_LEN: usize = VERSIONED_LEN + 1;

/// Stored variant of a [`QueryResult`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shape {
    Scalar,
    Row,
    Rows,
}

impl Shape {
    pub fn of(result: &QueryResult) -> Self {
        match result {
            QueryResult::Scalar(_) => Shape::Scalar,
            QueryResult::Row(_) => Shape::Row,
            QueryResult::Rows(_) => Shape::Rows,
        }
    }

    /// Shape a model operation always returns. Free-form queries may return any.
    pub fn expected_for(method: Method) -> Option<Self> {
        match method {
            Method::FindOne => Some(Shape::Row),
            Method::FindAll => Some(Shape::Rows),
            Method::Aggregate(_) | Method::Count => Some(Shape::Scalar),
            Method::Query => None,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            Shape::Scalar => 0,
            Shape::Row => 1,
            Shape::Rows => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Shape::Scalar),
            1 => Some(Shape::Row),
            2 => Some(Shape::Rows),
            _ => None,
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Shape::Scalar => "a scalar",
            Shape::Row => "a single row",
            Shape::Rows => "a row collection",
        })
    }
}

/// Serialize a result for cache storage.
///
/// # Errors
///
/// Returns `Error::Serialization` if the payload cannot be encoded.
pub fn encode(result: &QueryResult) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(result).map_err(|e| {
        error!("Cache serialization failed: {}", e);
        Error::Serialization(e.to_string())
    })?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&CACHE_MAGIC);
    bytes.extend_from_slice(&CURRENT_SCHEMA_VERSION.to_le_bytes());
    bytes.push(Shape::of(result).tag());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Validate the envelope and parse its payload.
///
/// # Errors
///
/// - `Error::InvalidCacheEntry`: missing or wrong magic header, or an unknown shape byte
/// - `Error::VersionMismatch`: written by another payload version
/// - `Error::Deserialization`: payload is not valid JSON
pub fn read_payload(bytes: &[u8]) -> Result<(Shape, Value)> {
    if bytes.len() < VERSIONED_LEN || bytes[0..4] != CACHE_MAGIC {
        let found = &bytes[..bytes.len().min(4)];
        warn!(
            "Invalid cache entry: expected magic {:?}, got {:?}",
            CACHE_MAGIC, found
        );
        return Err(Error::InvalidCacheEntry(format!(
            "Invalid magic: expected {:?}, got {:?}",
            CACHE_MAGIC, found
        )));
    }

    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[4..VERSIONED_LEN]);
    let version = u32::from_le_bytes(version);
    if version != CURRENT_SCHEMA_VERSION {
        warn!(
            "Cache version mismatch: expected {}, got {}",
            CURRENT_SCHEMA_VERSION, version
        );
        return Err(Error::VersionMismatch {
            expected: CURRENT_SCHEMA_VERSION,
            found: version,
        });
    }

    let tag = bytes.get(VERSIONED_LEN).copied();
    let shape = tag.and_then(Shape::from_tag).ok_or_else(|| {
        warn!("Invalid cache entry: unknown shape tag {:?}", tag);
        Error::InvalidCacheEntry(format!("Unknown shape tag: {:?}", tag))
    })?;

    let value = serde_json::from_slice(&bytes[HEADER_LEN..]).map_err(|e| {
        error!("Cache deserialization failed: {}", e);
        Error::Deserialization(e.to_string())
    })?;
    Ok((shape, value))
}

/// Rebuild the result a call expects from a stored entry.
///
/// The stored shape decides the variant. Raw calls and calls without a
/// registered model get plain rows. Otherwise rows are rebuilt through
/// [`ModelDef::build_projected`] with the call's attribute projection, which
/// restores defaults and nested includes but not the new-record flag or
/// non-JSON column types.
///
/// # Errors
///
/// Any envelope error from [`read_payload`], or `Error::Deserialization`
/// when the stored shape is not the one the call returns.
pub fn decode(
    bytes: &[u8],
    descriptor: &QueryDescriptor<'_>,
    registry: &ModelRegistry,
) -> Result<QueryResult> {
    let (shape, value) = read_payload(bytes)?;
    if let Some(expected) = Shape::expected_for(descriptor.method()) {
        if expected != shape {
            return Err(Error::Deserialization(format!(
                "expected {}, found {}",
                expected, shape
            )));
        }
    }

    let model = if descriptor.raw() {
        None
    } else {
        descriptor.model().and_then(|name| registry.get(name))
    };
    let rebuild = Rebuild {
        model: model.map(|m| &**m),
        projection: descriptor.find_options().and_then(|o| o.attributes.as_deref()),
        registry,
    };

    match shape {
        Shape::Scalar => Ok(QueryResult::Scalar(value)),
        Shape::Row => match value {
            Value::Null => Ok(QueryResult::Row(None)),
            Value::Object(values) => rebuild.row(values).map(|r| QueryResult::Row(Some(r))),
            other => Err(unexpected("a row or null", &other)),
        },
        Shape::Rows => match value {
            Value::Array(items) => rebuild.rows(items).map(QueryResult::Rows),
            other => Err(unexpected("a row collection", &other)),
        },
    }
}

struct Rebuild<'a> {
    model: Option<&'a ModelDef>,
    projection: Option<&'a [String]>,
    registry: &'a ModelRegistry,
}

impl Rebuild<'_> {
    fn rows(&self, items: Vec<Value>) -> Result<Vec<Record>> {
        items
            .into_iter()
            .map(|item| match item {
                Value::Object(values) => self.row(values),
                other => Err(unexpected("a row", &other)),
            })
            .collect()
    }

    fn row(&self, values: Map<String, Value>) -> Result<Record> {
        match self.model {
            Some(model) => model.build_projected(self.registry, values, self.projection),
            None => Ok(Record::plain(values)),
        }
    }
}

fn unexpected(expected: &str, found: &Value) -> Error {
    Error::Deserialization(format!("expected {}, found {}", expected, found))
}

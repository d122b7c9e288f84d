//! # query-cache
//!
//! A transparent read-through cache for database queries.
//!
//! ## Features
//!
//! - **Opt-in per call:** set `cache` on the call's options; everything else reaches the database untouched
//! - **Deterministic keys:** SHA-256 over the canonical SQL a call compiles to, joins included
//! - **Backend Agnostic:** in-memory (default) and Redis backends, or your own `CacheBackend`
//! - **Shape preserving:** cached rows are rebuilt as model records unless the call asked for raw rows
//! - **Observable:** per-call `Cached<T>` envelope, last-call flags, `log` output and a metrics hook
//!
//! ## Quick Start
//!
//! ```ignore
//! use query_cache::{use_cache, Condition, DataSource, FindOptions, QueryDescriptor};
//! use query_cache::backend::InMemoryBackend;
//!
//! // 1. Activate on a data source (any `DataSource` implementation)
//! let cache = use_cache(database, InMemoryBackend::new());
//!
//! // 2. Opt in per call
//! let options = FindOptions::default()
//!     .filter("title", Condition::Eq("foo".into()))
//!     .cached()
//!     .expire(60);
//! let projects = cache.find_all("projects", &options).await?;
//!
//! // 3. Or ask for the per-call envelope
//! let cached = cache
//!     .resolve(&QueryDescriptor::FindAll { model: "projects", options: &options })
//!     .await?;
//! assert!(cached.status.was_hit() == Some(true));
//! ```
//!
//! Entries are never invalidated; expiration is the only way they leave the
//! store.

#[macro_use]
extern crate log;

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod descriptor;
pub mod error;
pub mod key;
pub mod model;
pub mod observability;
pub mod options;
pub mod repository;
pub mod serialization;
pub mod service;
pub mod statement;
pub mod status;

// Re-exports for convenience
pub use backend::CacheBackend;
pub use config::{CacheConfig, FailurePolicy, StatusScope};
pub use coordinator::ReadThrough;
pub use descriptor::{AggregateFn, QueryDescriptor};
pub use error::{Error, Result};
pub use model::{ModelDef, ModelRegistry, QueryResult, Record};
pub use options::{Condition, FindOptions, Include, QueryKind, RawQueryOptions};
pub use repository::DataSource;
pub use service::{use_cache, QueryCache};
pub use status::{CacheStatus, Cached};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Interception layer.
//!
//! [`QueryCache`] decorates a [`DataSource`] and implements the same trait,
//! so callers keep their call sites and opt in per call with
//! `FindOptions::cached()` / `RawQueryOptions::cached()`.

use crate::backend::CacheBackend;
use crate::config::CacheConfig;
use crate::coordinator::ReadThrough;
use crate::descriptor::{AggregateFn, QueryDescriptor};
use crate::error::Result;
use crate::model::{ModelRegistry, QueryResult, Record};
use crate::observability::CacheMetrics;
use crate::options::{FindOptions, QueryKind, RawQueryOptions};
use crate::repository::DataSource;
use crate::statement::StatementCompiler;
use crate::status::{CacheStatus, Cached, StatusTracker};
use serde_json::Value;

/// Activate caching on `database`, backed by `backend`, with default configuration.
///
/// Models registered on `database` after this call are not intercepted.
///
/// # Example
///
/// ```
/// use query_cache::backend::InMemoryBackend;
/// use query_cache::model::ModelDef;
/// use query_cache::options::FindOptions;
/// use query_cache::repository::{DataSource, InMemoryDatabase};
/// use query_cache::service::use_cache;
/// use query_cache::status::CacheStatus;
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() -> query_cache::Result<()> {
/// let mut db = InMemoryDatabase::new();
/// db.define(ModelDef::new("projects").attribute("title"));
/// db.insert("projects", json!({"title": "foo"}))?;
///
/// let cache = use_cache(db, InMemoryBackend::new());
/// let options = FindOptions::default().cached();
///
/// assert_eq!(cache.count("projects", &options).await?, 1);
/// assert_eq!(cache.last_status("projects"), CacheStatus::Miss);
///
/// // The write-back runs in the background.
/// cache.flush().await;
/// assert_eq!(cache.count("projects", &options).await?, 1);
/// assert_eq!(cache.last_status("projects"), CacheStatus::Hit);
/// # Ok(())
/// # }
/// ```
pub fn use_cache<D: DataSource, B: CacheBackend>(database: D, backend: B) -> QueryCache<D, B> {
    QueryCache::new(database, backend)
}

/// Caching decorator over a data source.
///
/// A call goes through the read-through coordinator when it opted in, targets
/// a model known at activation and (for free-form queries) is a `SELECT`.
/// Everything else reaches the wrapped source untouched.
///
/// Two ways to observe hits:
/// - [`resolve`](Self::resolve) returns a [`Cached`] envelope per call;
/// - [`last_status`](Self::last_status) / [`connection_status`](Self::connection_status)
///   read the shared last-call flag, which interleaved calls overwrite.
pub struct QueryCache<D: DataSource, B: CacheBackend> {
    inner: D,
    registry: ModelRegistry,
    read_through: ReadThrough<B>,
    status: StatusTracker,
    intercept_raw_queries: bool,
}

impl<D: DataSource, B: CacheBackend> QueryCache<D, B> {
    pub fn new(database: D, backend: B) -> Self {
        Self::with_config(database, backend, CacheConfig::default())
    }

    pub fn with_config(database: D, backend: B, config: CacheConfig) -> Self {
        let registry = database.models();
        info!(
            "✓ Query cache active for {} models (prefix: {}, {:?})",
            registry.len(),
            config.key_prefix,
            config.failure_policy
        );

        QueryCache {
            inner: database,
            registry,
            read_through: ReadThrough::new(backend)
                .with_key_prefix(config.key_prefix)
                .with_failure_policy(config.failure_policy),
            status: StatusTracker::new(config.status_scope),
            intercept_raw_queries: config.intercept_raw_queries,
        }
    }

    /// Set custom metrics handler.
    pub fn with_metrics(mut self, metrics: Box<dyn CacheMetrics>) -> Self {
        self.read_through = self.read_through.with_metrics(metrics);
        self
    }

    pub fn with_compiler(mut self, compiler: Box<dyn StatementCompiler>) -> Self {
        self.read_through = self.read_through.with_compiler(compiler);
        self
    }

    /// Run one call and report whether the cache answered it.
    ///
    /// # Errors
    ///
    /// See [`ReadThrough::resolve`]. Calls that are not intercepted return
    /// exactly what the wrapped source returns.
    pub async fn resolve(&self, descriptor: &QueryDescriptor<'_>) -> Result<Cached<QueryResult>> {
        let result = if self.intercepts(descriptor) {
            let inner = &self.inner;
            self.read_through
                .resolve(&self.registry, descriptor, move || inner.execute(descriptor))
                .await?
        } else {
            self.inner
                .execute(descriptor)
                .await
                .map(Cached::not_applicable)?
        };

        let slot = match descriptor {
            QueryDescriptor::Query { .. } => None,
            _ => descriptor.model(),
        };
        self.status.record(slot, result.status);
        Ok(result)
    }

    /// Wait until results of earlier misses are written to the backend.
    pub async fn flush(&self) {
        self.read_through.flush().await;
    }

    /// Key a call would be cached under.
    ///
    /// # Errors
    /// `Error::KeyGeneration` when the call cannot be canonicalised.
    pub fn cache_key(&self, descriptor: &QueryDescriptor<'_>) -> Result<String> {
        self.read_through.key_for(&self.registry, descriptor)
    }

    /// Hit/miss flag of the last call on `model`.
    pub fn last_status(&self, model: &str) -> CacheStatus {
        self.status.last(model)
    }

    /// Hit/miss flag of the last free-form query (or of any call, when the
    /// status scope is per connection).
    pub fn connection_status(&self) -> CacheStatus {
        self.status.last_connection()
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn backend(&self) -> &B {
        self.read_through.backend()
    }

    /// Models intercepted by this cache.
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    fn intercepts(&self, descriptor: &QueryDescriptor<'_>) -> bool {
        match descriptor {
            QueryDescriptor::Query { options, .. } => {
                self.intercept_raw_queries && options.kind == QueryKind::Select
            }
            _ => descriptor
                .model()
                .is_some_and(|model| self.registry.contains(model)),
        }
    }
}

impl<D: DataSource, B: CacheBackend> DataSource for QueryCache<D, B> {
    fn models(&self) -> ModelRegistry {
        self.inner.models()
    }

    async fn find_one(&self, model: &str, options: &FindOptions) -> Result<Option<Record>> {
        self.resolve(&QueryDescriptor::FindOne { model, options })
            .await?
            .into_inner()
            .into_row()
    }

    async fn find_all(&self, model: &str, options: &FindOptions) -> Result<Vec<Record>> {
        self.resolve(&QueryDescriptor::FindAll { model, options })
            .await?
            .into_inner()
            .into_rows()
    }

    async fn aggregate(
        &self,
        model: &str,
        function: AggregateFn,
        column: &str,
        options: &FindOptions,
    ) -> Result<Value> {
        self.resolve(&QueryDescriptor::Aggregate {
            model,
            function,
            column,
            options,
        })
        .await?
        .into_inner()
        .into_scalar()
    }

    async fn count(&self, model: &str, options: &FindOptions) -> Result<u64> {
        self.resolve(&QueryDescriptor::Count { model, options })
            .await?
            .into_inner()
            .into_count()
    }

    async fn query(&self, sql: &str, options: &RawQueryOptions) -> Result<QueryResult> {
        self.resolve(&QueryDescriptor::Query { sql, options })
            .await
            .map(Cached::into_inner)
    }
}

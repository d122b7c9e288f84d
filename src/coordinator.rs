//! Read-through coordinator.
//!
//! Per call: compute the key, check the cache, and on a miss run the real
//! query and write its result back on a spawned task.

use crate::backend::CacheBackend;
use crate::config::FailurePolicy;
use crate::descriptor::QueryDescriptor;
use crate::error::Result;
use crate::key::{CacheKeyBuilder, DEFAULT_KEY_PREFIX};
use crate::model::{ModelRegistry, QueryResult};
use crate::observability::{CacheMetrics, NoOpMetrics};
use crate::serialization;
use crate::statement::{SqlCompiler, StatementCompiler};
use crate::status::Cached;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Resolves cache-eligible calls against a backend.
///
/// Concurrent misses on the same key are not coalesced: each runs the
/// query and the last write wins.
///
/// Write-backs run on `tokio::spawn`, so [`resolve`](Self::resolve) must be
/// called from within a Tokio runtime. [`flush`](Self::flush) waits for the
/// ones still in flight.
///
/// # Example
///
/// ```ignore
/// use query_cache::coordinator::ReadThrough;
/// use query_cache::backend::InMemoryBackend;
///
/// let read_through = ReadThrough::new(InMemoryBackend::new());
/// let cached = read_through
///     .resolve(&registry, &descriptor, || database.execute(&descriptor))
///     .await?;
/// ```
pub struct ReadThrough<B: CacheBackend> {
    backend: B,
    keys: CacheKeyBuilder,
    compiler: Box<dyn StatementCompiler>,
    metrics: Arc<dyn CacheMetrics>,
    failure_policy: FailurePolicy,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: CacheBackend> ReadThrough<B> {
    pub fn new(backend: B) -> Self {
        ReadThrough {
            backend,
            keys: CacheKeyBuilder::new(DEFAULT_KEY_PREFIX),
            compiler: Box::new(SqlCompiler),
            metrics: Arc::new(NoOpMetrics),
            failure_policy: FailurePolicy::default(),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.keys = CacheKeyBuilder::new(prefix);
        self
    }

    /// Set custom metrics handler.
    pub fn with_metrics(mut self, metrics: Box<dyn CacheMetrics>) -> Self {
        self.metrics = Arc::from(metrics);
        self
    }

    /// Replace the statement renderer used for model-call keys.
    pub fn with_compiler(mut self, compiler: Box<dyn StatementCompiler>) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Key the call would be stored under.
    ///
    /// # Errors
    /// `Error::KeyGeneration` when the call cannot be canonicalised.
    pub fn key_for(
        &self,
        registry: &ModelRegistry,
        descriptor: &QueryDescriptor<'_>,
    ) -> Result<String> {
        self.keys.generate(descriptor, registry, self.compiler.as_ref())
    }

    /// Resolve one call, running `execute` only when the cache cannot answer.
    ///
    /// Calls that did not opt in skip the cache entirely and come back as
    /// not applicable. On a miss the fresh result is returned without waiting
    /// for the write-back; a failed write-back is logged and reported to the
    /// metrics handler but never fails the call.
    ///
    /// # Errors
    ///
    /// Returns `Err` in these cases:
    /// - `Error::KeyGeneration`: the call cannot be canonicalised (nothing else is attempted)
    /// - `Error::Backend`: the cache read failed under `FailurePolicy::FailClosed`
    /// - `Error::InvalidCacheEntry` / `Error::VersionMismatch` / `Error::Deserialization`:
    ///   the stored entry cannot be decoded; this is not treated as a miss
    /// - anything `execute` returns, unchanged
    pub async fn resolve<F, Fut>(
        &self,
        registry: &ModelRegistry,
        descriptor: &QueryDescriptor<'_>,
        execute: F,
    ) -> Result<Cached<QueryResult>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<QueryResult>>,
    {
        if !descriptor.cache_enabled() {
            return execute().await.map(Cached::not_applicable);
        }

        let key = self.key_for(registry, descriptor)?;
        debug!("Cache key for {}: {}", descriptor.method(), key);

        let start = Instant::now();
        match self.lookup(&key).await? {
            Some(bytes) => {
                let value = serialization::decode(&bytes, descriptor, registry).map_err(|e| {
                    self.metrics.record_error(&key, &e.to_string());
                    e
                })?;
                self.metrics.record_hit(&key, start.elapsed());
                debug!("✓ Cache HIT: {}", key);
                Ok(Cached::hit(value))
            }
            None => {
                debug!("Cache MISS: {}", key);
                let value = execute().await?;
                self.metrics.record_miss(&key, start.elapsed());
                self.populate(key, &value, descriptor.ttl());
                Ok(Cached::miss(value))
            }
        }
    }

    // Empty entries count as absent.
    async fn lookup(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.backend.get(key).await {
            Ok(bytes) => Ok(bytes.filter(|b| !b.is_empty())),
            Err(e) => {
                self.metrics.record_error(key, &e.to_string());
                match self.failure_policy {
                    FailurePolicy::FailClosed => Err(e),
                    FailurePolicy::FailOpen => {
                        warn!("⚠ Cache read failed for {}, querying database: {}", key, e);
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Wait for write-backs spawned so far.
    pub async fn flush(&self) {
        let handles = std::mem::take(&mut *self.lock_pending());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("⚠ Cache write task failed: {}", e);
            }
        }
    }

    // Encodes inline; only the backend write is detached.
    fn populate(&self, key: String, value: &QueryResult, ttl: Option<Duration>) {
        let bytes = match serialization::encode(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("⚠ Failed to populate cache for {}: {}", key, e);
                self.metrics.record_error(&key, &e.to_string());
                return;
            }
        };

        let backend = self.backend.clone();
        let metrics = Arc::clone(&self.metrics);
        let handle = tokio::spawn(async move {
            let start = Instant::now();
            match backend.set(&key, bytes, ttl).await {
                Ok(()) => {
                    metrics.record_set(&key, start.elapsed());
                    debug!("✓ Cache populated: {} (ttl: {:?})", key, ttl);
                }
                Err(e) => {
                    warn!("⚠ Failed to populate cache for {}: {}", key, e);
                    metrics.record_error(&key, &e.to_string());
                }
            }
        });

        let mut pending = self.lock_pending();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::error::Error;
    use crate::model::ModelDef;
    use crate::options::FindOptions;
    use crate::status::CacheStatus;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn registry() -> ModelRegistry {
        let mut registry = ModelRegistry::new();
        registry.register(ModelDef::new("projects").attribute("title"));
        registry
    }

    #[derive(Clone)]
    struct BrokenBackend;

    impl CacheBackend for BrokenBackend {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Err(Error::Backend("connection refused".to_string()))
        }

        async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Option<Duration>) -> Result<()> {
            Err(Error::Backend("connection refused".to_string()))
        }
    }

    // Holds every write until the gate opens.
    #[derive(Clone)]
    struct GatedBackend {
        inner: InMemoryBackend,
        gate: Arc<Notify>,
    }

    impl CacheBackend for GatedBackend {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
            self.gate.notified().await;
            self.inner.set(key, value, ttl).await
        }
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let registry = registry();
        let read_through = ReadThrough::new(InMemoryBackend::new());
        let options = FindOptions::default().cached();
        let descriptor = QueryDescriptor::Count {
            model: "projects",
            options: &options,
        };
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let execute = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(QueryResult::Scalar(json!(2)))
        };

        let first = read_through
            .resolve(&registry, &descriptor, execute)
            .await
            .expect("Failed to resolve");
        read_through.flush().await;
        let second = read_through
            .resolve(&registry, &descriptor, execute)
            .await
            .expect("Failed to resolve");

        assert_eq!(first.status, CacheStatus::Miss);
        assert_eq!(second.status, CacheStatus::Hit);
        assert_eq!(first.value, second.value);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_miss_returns_before_write_back() {
        let registry = registry();
        let inner = InMemoryBackend::new();
        let gate = Arc::new(Notify::new());
        let read_through = ReadThrough::new(GatedBackend {
            inner: inner.clone(),
            gate: Arc::clone(&gate),
        });
        let options = FindOptions::default().cached();
        let descriptor = QueryDescriptor::Count {
            model: "projects",
            options: &options,
        };
        let execute = || async { Ok(QueryResult::Scalar(json!(2))) };

        let first = read_through
            .resolve(&registry, &descriptor, execute)
            .await
            .expect("Failed to resolve");
        assert_eq!(first, Cached::miss(QueryResult::Scalar(json!(2))));
        assert!(inner.is_empty());

        gate.notify_one();
        read_through.flush().await;
        assert_eq!(inner.len(), 1);

        let second = read_through
            .resolve(&registry, &descriptor, execute)
            .await
            .expect("Failed to resolve");
        assert_eq!(second, Cached::hit(QueryResult::Scalar(json!(2))));
    }

    #[tokio::test]
    async fn test_not_opted_in_skips_cache() {
        let registry = registry();
        let backend = InMemoryBackend::new();
        let read_through = ReadThrough::new(backend.clone());
        let options = FindOptions::default();
        let descriptor = QueryDescriptor::Count {
            model: "projects",
            options: &options,
        };

        let result = read_through
            .resolve(&registry, &descriptor, || async {
                Ok(QueryResult::Scalar(json!(0)))
            })
            .await
            .expect("Failed to resolve");

        assert_eq!(result.status, CacheStatus::NotApplicable);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_failure_policy() {
        let registry = registry();
        let options = FindOptions::default().cached();
        let descriptor = QueryDescriptor::Count {
            model: "projects",
            options: &options,
        };
        let execute = || async { Ok(QueryResult::Scalar(json!(1))) };

        let closed = ReadThrough::new(BrokenBackend);
        let result = closed.resolve(&registry, &descriptor, execute).await;
        assert!(matches!(result, Err(Error::Backend(_))));

        let open = ReadThrough::new(BrokenBackend).with_failure_policy(FailurePolicy::FailOpen);
        let result = open
            .resolve(&registry, &descriptor, execute)
            .await
            .expect("Failed to resolve");
        open.flush().await;
        assert_eq!(result, Cached::miss(QueryResult::Scalar(json!(1))));
    }

    #[tokio::test]
    async fn test_key_error_runs_nothing() {
        let registry = registry();
        let read_through = ReadThrough::new(InMemoryBackend::new());
        let options = FindOptions::default().cached();
        let descriptor = QueryDescriptor::FindAll {
            model: "missing",
            options: &options,
        };
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let result = read_through
            .resolve(&registry, &descriptor, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(QueryResult::Rows(vec![]))
            })
            .await;

        assert!(matches!(result, Err(Error::KeyGeneration(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}

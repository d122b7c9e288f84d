//! Database collaborator abstraction.
//!
//! [`DataSource`] is the capability surface the cache decorates: per-model
//! finds, aggregates and counts, plus free-form parameterized queries.
//! Implement it over your database client (SQLx, tokio-postgres, Diesel or
//! a custom ORM) and wrap it with [`use_cache`](crate::service::use_cache).
//!
//! [`InMemoryDatabase`] evaluates the same option surface over in-process
//! tables and is meant for tests.
//!
//! # Error Handling
//!
//! Return `Error::Database` for connectivity issues, timeouts and any other
//! failure of the underlying store. The cache layer passes it through
//! unchanged.

use crate::descriptor::{AggregateFn, QueryDescriptor};
use crate::error::{Error, Result};
use crate::model::{AssociationKind, Included, ModelDef, ModelRegistry, Record, QueryResult, PRIMARY_KEY};
use crate::options::{compare, Condition, FindOptions, Include, Order, RawQueryOptions};
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};

/// Trait for data source implementations.
///
/// Every method takes `&self`; implementations hold their connection pool or
/// client behind interior mutability.
#[allow(async_fn_in_trait)]
pub trait DataSource: Send + Sync {
    /// Models currently registered on this source.
    fn models(&self) -> ModelRegistry;

    /// Fetch the first row matching `options`.
    ///
    /// # Returns
    /// - `Ok(Some(record))` - Row found
    /// - `Ok(None)` - No row matches (not an error)
    ///
    /// # Errors
    /// Returns `Err` if the data source is unavailable or the query fails
    async fn find_one(&self, model: &str, options: &FindOptions) -> Result<Option<Record>>;

    /// Fetch every row matching `options`.
    ///
    /// # Errors
    /// Returns `Err` if the data source is unavailable or the query fails
    async fn find_all(&self, model: &str, options: &FindOptions) -> Result<Vec<Record>>;

    /// Aggregate `column` over the matching rows. `null` when none match.
    ///
    /// # Errors
    /// Returns `Err` if the data source is unavailable or the query fails
    async fn aggregate(
        &self,
        model: &str,
        function: AggregateFn,
        column: &str,
        options: &FindOptions,
    ) -> Result<Value>;

    /// Count matching rows.
    ///
    /// # Errors
    /// Returns `Err` if the data source is unavailable or the query fails
    async fn count(&self, model: &str, options: &FindOptions) -> Result<u64>;

    /// Run a free-form parameterized statement.
    ///
    /// # Errors
    /// Returns `Err` if the data source is unavailable or the statement fails
    async fn query(&self, sql: &str, options: &RawQueryOptions) -> Result<QueryResult>;

    /// # Errors
    /// Same as [`aggregate`](Self::aggregate)
    async fn min(&self, model: &str, column: &str, options: &FindOptions) -> Result<Value> {
        self.aggregate(model, AggregateFn::Min, column, options).await
    }

    /// # Errors
    /// Same as [`aggregate`](Self::aggregate)
    async fn max(&self, model: &str, column: &str, options: &FindOptions) -> Result<Value> {
        self.aggregate(model, AggregateFn::Max, column, options).await
    }

    /// # Errors
    /// Same as [`aggregate`](Self::aggregate)
    async fn sum(&self, model: &str, column: &str, options: &FindOptions) -> Result<Value> {
        self.aggregate(model, AggregateFn::Sum, column, options).await
    }

    /// Fetch a row by primary key. Expressed as [`find_one`](Self::find_one)
    /// with an added primary-key filter, so it is cached like one.
    ///
    /// # Errors
    /// Same as [`find_one`](Self::find_one)
    async fn find_by_pk(
        &self,
        model: &str,
        id: impl Into<Value>,
        options: &FindOptions,
    ) -> Result<Option<Record>> {
        let options = options.clone().filter(PRIMARY_KEY, Condition::Eq(id.into()));
        self.find_one(model, &options).await
    }

    /// A page of rows together with the total count of matching rows.
    ///
    /// Runs [`find_all`](Self::find_all) and [`count`](Self::count)
    /// concurrently; the count ignores paging, ordering and projection.
    ///
    /// # Errors
    /// Returns the first error of either call
    async fn find_and_count_all(
        &self,
        model: &str,
        options: &FindOptions,
    ) -> Result<(Vec<Record>, u64)> {
        let count_options = FindOptions {
            attributes: None,
            order: Vec::new(),
            limit: None,
            offset: None,
            ..options.clone()
        };
        futures::try_join!(
            self.find_all(model, options),
            self.count(model, &count_options)
        )
    }

    /// Dispatch a descriptor to the operation it names.
    ///
    /// # Errors
    /// Whatever the dispatched operation returns
    async fn execute(&self, descriptor: &QueryDescriptor<'_>) -> Result<QueryResult> {
        match *descriptor {
            QueryDescriptor::FindOne { model, options } => {
                self.find_one(model, options).await.map(QueryResult::Row)
            }
            QueryDescriptor::FindAll { model, options } => {
                self.find_all(model, options).await.map(QueryResult::Rows)
            }
            QueryDescriptor::Aggregate {
                model,
                function,
                column,
                options,
            } => self
                .aggregate(model, function, column, options)
                .await
                .map(QueryResult::Scalar),
            QueryDescriptor::Count { model, options } => self
                .count(model, options)
                .await
                .map(|n| QueryResult::Scalar(Value::from(n))),
            QueryDescriptor::Query { sql, options } => self.query(sql, options).await,
        }
    }
}

/// Handler answering free-form queries on an [`InMemoryDatabase`].
pub type QueryHandler = Box<dyn Fn(&str, &RawQueryOptions) -> Result<QueryResult> + Send + Sync>;

/// In-memory data source for testing.
///
/// Supports filters, includes (`required` and nested), ordering, paging,
/// projection and raw mode. Free-form queries are answered by a handler
/// installed with [`with_query_handler`](Self::with_query_handler).
///
/// # Example
///
/// ```
/// use query_cache::model::ModelDef;
/// use query_cache::repository::InMemoryDatabase;
/// use serde_json::json;
///
/// let mut db = InMemoryDatabase::new();
/// db.define(ModelDef::new("projects").attribute("title"));
/// db.insert("projects", json!({"title": "foo"})).unwrap();
///
/// assert_eq!(db.row_count("projects"), 1);
/// ```
pub struct InMemoryDatabase {
    registry: ModelRegistry,
    tables: DashMap<String, Vec<Map<String, Value>>>,
    query_handler: Option<QueryHandler>,
    executions: AtomicUsize,
    failing: AtomicBool,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        InMemoryDatabase {
            registry: ModelRegistry::new(),
            tables: DashMap::new(),
            query_handler: None,
            executions: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Register a model and create its (empty) table.
    pub fn define(&mut self, model: ModelDef) -> &mut Self {
        self.tables.entry(model.name().to_string()).or_default();
        self.registry.register(model);
        self
    }

    pub fn with_query_handler(
        mut self,
        handler: impl Fn(&str, &RawQueryOptions) -> Result<QueryResult> + Send + Sync + 'static,
    ) -> Self {
        self.query_handler = Some(Box::new(handler));
        self
    }

    /// Insert a row, assigning the next id when none is given.
    ///
    /// # Errors
    /// `Error::Database` for unknown models or non-object rows.
    pub fn insert(&self, model: &str, row: Value) -> Result<Record> {
        let def = self.model(model)?;
        let mut values = match row {
            Value::Object(values) => values,
            other => {
                return Err(Error::Database(format!(
                    "cannot insert {} into {}",
                    other, model
                )))
            }
        };

        let mut table = self.tables.entry(model.to_string()).or_default();
        if values.get(PRIMARY_KEY).map_or(true, Value::is_null) {
            values.insert(PRIMARY_KEY.to_string(), Value::from(table.len() as u64 + 1));
        }
        for attribute in def.attributes() {
            if !values.contains_key(&attribute.name) {
                values.insert(attribute.name.clone(), attribute.default.clone());
            }
        }
        table.push(values.clone());

        Ok(def.load(values))
    }

    pub fn row_count(&self, model: &str) -> usize {
        self.tables.get(model).map_or(0, |t| t.len())
    }

    /// Number of operations that reached this database.
    pub fn executions(&self) -> usize {
        self.executions.load(AtomicOrdering::SeqCst)
    }

    /// Make every subsequent operation fail with `Error::Database`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, AtomicOrdering::SeqCst);
    }

    fn begin(&self) -> Result<()> {
        self.executions.fetch_add(1, AtomicOrdering::SeqCst);
        if self.failing.load(AtomicOrdering::SeqCst) {
            return Err(Error::Database("database unavailable".to_string()));
        }
        Ok(())
    }

    fn model(&self, name: &str) -> Result<&ModelDef> {
        self.registry
            .get(name)
            .map(|m| &**m)
            .ok_or_else(|| Error::Database(format!("unknown model {}", name)))
    }

    fn rows(&self, model: &str) -> Vec<Map<String, Value>> {
        self.tables
            .get(model)
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    fn select(&self, model: &str, options: &FindOptions) -> Result<Vec<Record>> {
        let def = self.model(model)?;
        let includes = options.includes();

        let mut records = Vec::new();
        for values in self.rows(model) {
            if !options.filter.matches(&values) {
                continue;
            }
            let mut record = def.load(values);
            if self.attach(def, &mut record, &includes)? {
                records.push(record);
            }
        }

        if !options.order.is_empty() {
            records.sort_by(|a, b| order(a, b, &options.order));
        }

        let offset = options.offset.unwrap_or(0) as usize;
        let limit = options.limit.map_or(usize::MAX, |l| l as usize);
        let mut records: Vec<Record> = records.into_iter().skip(offset).take(limit).collect();

        if let Some(attributes) = &options.attributes {
            records
                .iter_mut()
                .for_each(|r| r.retain_fields(attributes));
        }
        if options.raw {
            records = records.into_iter().map(Record::into_plain).collect();
        }

        Ok(records)
    }

    // Returns false when a required include found nothing.
    fn attach(&self, def: &ModelDef, record: &mut Record, includes: &[Include]) -> Result<bool> {
        for include in includes {
            let association = def.association(&include.association).ok_or_else(|| {
                Error::Database(format!(
                    "{} has no association {}",
                    def.name(),
                    include.association
                ))
            })?;
            let target = self.model(&association.target)?;

            let (column, key) = match association.kind {
                AssociationKind::BelongsTo => (PRIMARY_KEY, record.get(&association.foreign_key)),
                AssociationKind::HasOne | AssociationKind::HasMany => {
                    (association.foreign_key.as_str(), record.get(PRIMARY_KEY))
                }
            };
            let join = key.filter(|k| !k.is_null()).cloned().map(Condition::Eq);

            let mut matched = Vec::new();
            if let Some(join) = join {
                for values in self.rows(target.name()) {
                    if !join.matches(values.get(column)) || !include.filter.matches(&values) {
                        continue;
                    }
                    let mut nested = target.load(values);
                    if self.attach(target, &mut nested, &include.include)? {
                        matched.push(nested);
                    }
                }
            }

            if include.required && matched.is_empty() {
                return Ok(false);
            }
            let nested = match association.kind {
                AssociationKind::HasMany => Included::Many(matched),
                _ => Included::One(matched.into_iter().next()),
            };
            record.include(association.alias.clone(), nested);
        }
        Ok(true)
    }
}

impl Default for InMemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

fn order(a: &Record, b: &Record, order: &[Order]) -> Ordering {
    for o in order {
        let (column, descending) = match o {
            Order::Asc(column) => (column, false),
            Order::Desc(column) => (column, true),
        };
        let ord = match (a.get(column), b.get(column)) {
            (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        };
        let ord = if descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn aggregate_values(function: AggregateFn, values: Vec<Value>) -> Value {
    let values: Vec<Value> = values.into_iter().filter(|v| !v.is_null()).collect();
    match function {
        AggregateFn::Min | AggregateFn::Max => {
            let wanted = if function == AggregateFn::Min {
                Ordering::Less
            } else {
                Ordering::Greater
            };
            values
                .into_iter()
                .reduce(|best, v| {
                    if compare(&v, &best) == Some(wanted) {
                        v
                    } else {
                        best
                    }
                })
                .unwrap_or(Value::Null)
        }
        AggregateFn::Sum => {
            if values.is_empty() {
                return Value::Null;
            }
            let integers: Option<Vec<i64>> = values.iter().map(Value::as_i64).collect();
            match integers {
                Some(integers) => Value::from(integers.into_iter().sum::<i64>()),
                None => Value::from(values.iter().filter_map(Value::as_f64).sum::<f64>()),
            }
        }
    }
}

impl DataSource for InMemoryDatabase {
    fn models(&self) -> ModelRegistry {
        self.registry.clone()
    }

    async fn find_one(&self, model: &str, options: &FindOptions) -> Result<Option<Record>> {
        self.begin()?;
        let options = FindOptions {
            limit: Some(1),
            ..options.clone()
        };
        Ok(self.select(model, &options)?.into_iter().next())
    }

    async fn find_all(&self, model: &str, options: &FindOptions) -> Result<Vec<Record>> {
        self.begin()?;
        self.select(model, options)
    }

    async fn aggregate(
        &self,
        model: &str,
        function: AggregateFn,
        column: &str,
        options: &FindOptions,
    ) -> Result<Value> {
        self.begin()?;
        let values = self
            .select(model, options)?
            .iter()
            .map(|r| r.get(column).cloned().unwrap_or(Value::Null))
            .collect();
        Ok(aggregate_values(function, values))
    }

    async fn count(&self, model: &str, options: &FindOptions) -> Result<u64> {
        self.begin()?;
        let options = FindOptions {
            limit: None,
            offset: None,
            ..options.clone()
        };
        Ok(self.select(model, &options)?.len() as u64)
    }

    async fn query(&self, sql: &str, options: &RawQueryOptions) -> Result<QueryResult> {
        self.begin()?;
        match &self.query_handler {
            Some(handler) => handler(sql, options),
            None => Err(Error::NotImplemented(
                "no query handler installed".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn database() -> InMemoryDatabase {
        let mut db = InMemoryDatabase::new();
        db.define(
            ModelDef::new("projects")
                .attribute("title")
                .has_many("users", "users", "projectId"),
        )
        .define(
            ModelDef::new("users")
                .attribute("name")
                .belongs_to("project", "projects", "projectId"),
        );
        db.insert("projects", json!({"title": "foo"})).expect("Failed to insert");
        db.insert("projects", json!({"title": "bar"})).expect("Failed to insert");
        db.insert("users", json!({"name": "baz", "projectId": 1}))
            .expect("Failed to insert");
        db.insert("users", json!({"name": "quz"})).expect("Failed to insert");
        db
    }

    #[test]
    fn test_insert_assigns_ids_and_defaults() {
        let db = database();
        let record = db
            .insert("projects", json!({}))
            .expect("Failed to insert");

        assert_eq!(record.get("id"), Some(&json!(3)));
        assert_eq!(record.get("title"), Some(&Value::Null));
        assert!(db.insert("nope", json!({})).is_err());
    }

    #[tokio::test]
    async fn test_find_with_filter_and_order() {
        let db = database();

        let found = db
            .find_one(
                "projects",
                &FindOptions::default().filter("title", Condition::Eq(json!("bar"))),
            )
            .await
            .expect("Failed to find");
        assert_eq!(found.and_then(|r| r.get("id").cloned()), Some(json!(2)));

        let all = db
            .find_all(
                "projects",
                &FindOptions::default().order(Order::Desc("id".to_string())),
            )
            .await
            .expect("Failed to find");
        let ids: Vec<_> = all.iter().filter_map(|r| r.get("id").cloned()).collect();
        assert_eq!(ids, vec![json!(2), json!(1)]);
    }

    #[tokio::test]
    async fn test_includes() {
        let db = database();

        let users = db
            .find_all("users", &FindOptions::default().include(Include::new("project")))
            .await
            .expect("Failed to find");
        assert_eq!(users.len(), 2);
        assert!(matches!(users[1].included("project"), Some(Included::One(None))));

        let required = db
            .find_all(
                "users",
                &FindOptions::default().include(Include::new("project").required()),
            )
            .await
            .expect("Failed to find");
        assert_eq!(required.len(), 1);

        let projects = db
            .find_all(
                "projects",
                &FindOptions::default().include(Include::new("users")),
            )
            .await
            .expect("Failed to find");
        match projects[0].included("users") {
            Some(Included::Many(users)) => assert_eq!(users.len(), 1),
            other => panic!("unexpected include: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_aggregates_and_count() {
        let db = database();
        let all = FindOptions::default();

        assert_eq!(db.min("projects", "id", &all).await, Ok(json!(1)));
        assert_eq!(db.max("projects", "id", &all).await, Ok(json!(2)));
        assert_eq!(db.sum("projects", "id", &all).await, Ok(json!(3)));
        assert_eq!(db.count("projects", &all).await, Ok(2));

        let none = FindOptions::default().filter("id", Condition::Gt(json!(10)));
        assert_eq!(db.sum("projects", "id", &none).await, Ok(Value::Null));
    }

    #[tokio::test]
    async fn test_find_and_count_all_ignores_paging_in_count() {
        let db = database();
        let (rows, total) = db
            .find_and_count_all("projects", &FindOptions::default().limit(1))
            .await
            .expect("Failed to find");

        assert_eq!(rows.len(), 1);
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn test_raw_rows_are_plain() {
        let db = database();
        let row = db
            .find_by_pk("projects", 1, &FindOptions::default().raw())
            .await
            .expect("Failed to find")
            .expect("row exists");

        assert!(row.is_plain());
        assert_eq!(row.get("title"), Some(&json!("foo")));
    }

    #[tokio::test]
    async fn test_failing_database_and_missing_handler() {
        let db = database();
        assert!(matches!(
            db.query("SELECT 1", &RawQueryOptions::select()).await,
            Err(Error::NotImplemented(_))
        ));

        db.set_failing(true);
        assert!(matches!(
            db.count("projects", &FindOptions::default()).await,
            Err(Error::Database(_))
        ));
        assert_eq!(db.executions(), 2);
    }
}

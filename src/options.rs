//! Per-call options recognised by every intercepted data-access operation.
//!
//! Defaults: `cache = false`, `raw = false`, `expire = None`.
//!
//! ```
//! use query_cache::options::{Condition, FindOptions};
//!
//! let options = FindOptions::default()
//!     .filter("title", Condition::Eq("bar".into()))
//!     .cached()
//!     .expire(5);
//!
//! assert!(options.cache);
//! assert_eq!(options.ttl(), Some(std::time::Duration::from_secs(5)));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

/// A predicate on one column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Like(String),
    IsNull,
    NotNull,
}

impl Condition {
    /// Evaluate against a column value. Used by in-process data sources.
    pub fn matches(&self, value: Option<&Value>) -> bool {
        let value = value.unwrap_or(&Value::Null);
        match self {
            Condition::Eq(expected) => loosely_equal(value, expected),
            Condition::Ne(expected) => !value.is_null() && !loosely_equal(value, expected),
            Condition::Gt(bound) => compare(value, bound) == Some(Ordering::Greater),
            Condition::Gte(bound) => matches!(
                compare(value, bound),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Condition::Lt(bound) => compare(value, bound) == Some(Ordering::Less),
            Condition::Lte(bound) => {
                matches!(compare(value, bound), Some(Ordering::Less | Ordering::Equal))
            }
            Condition::In(candidates) => candidates.iter().any(|c| loosely_equal(value, c)),
            Condition::Like(pattern) => value
                .as_str()
                .map(|s| like(s.as_bytes(), pattern.as_bytes()))
                .unwrap_or(false),
            Condition::IsNull => value.is_null(),
            Condition::NotNull => !value.is_null(),
        }
    }
}

/// Order two JSON scalars the way SQL would: numbers numerically, strings
/// lexically, anything else is incomparable.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

// `%` matches any run, `_` a single byte.
fn like(text: &[u8], pattern: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'%', rest)) => (0..=text.len()).any(|i| like(&text[i..], rest)),
        Some((b'_', rest)) => !text.is_empty() && like(&text[1..], rest),
        Some((c, rest)) => text.first() == Some(c) && like(&text[1..], rest),
    }
}

/// Conjunction of column conditions.
///
/// Backed by an ordered map so two filters naming the same columns render
/// the same statement regardless of insertion order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter(BTreeMap<String, Condition>);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn and(mut self, column: impl Into<String>, condition: Condition) -> Self {
        self.0.insert(column.into(), condition);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Condition)> {
        self.0.iter()
    }

    pub fn matches(&self, row: &serde_json::Map<String, Value>) -> bool {
        self.0
            .iter()
            .all(|(column, condition)| condition.matches(row.get(column)))
    }
}

/// Eager-load specification for one association.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Include {
    /// Association alias declared on the parent model.
    pub association: String,
    pub filter: Filter,
    /// Inner join instead of left outer join.
    pub required: bool,
    pub include: Vec<Include>,
}

impl Include {
    pub fn new(association: impl Into<String>) -> Self {
        Include {
            association: association.into(),
            filter: Filter::default(),
            required: false,
            include: Vec::new(),
        }
    }

    pub fn filter(mut self, column: impl Into<String>, condition: Condition) -> Self {
        self.filter = self.filter.and(column, condition);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn nested(mut self, include: Include) -> Self {
        self.include.push(include);
        self
    }
}

/// A single include or a list of them, as callers may pass either.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum IncludeSpec {
    One(Include),
    Many(Vec<Include>),
}

impl IncludeSpec {
    /// Normalised list form.
    pub fn into_vec(self) -> Vec<Include> {
        match self {
            IncludeSpec::One(include) => vec![include],
            IncludeSpec::Many(includes) => includes,
        }
    }
}

impl From<Include> for IncludeSpec {
    fn from(include: Include) -> Self {
        IncludeSpec::One(include)
    }
}

impl From<Vec<Include>> for IncludeSpec {
    fn from(includes: Vec<Include>) -> Self {
        IncludeSpec::Many(includes)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
    Asc(String),
    Desc(String),
}

/// Options for the model operations (`find_one`, `find_all`, aggregates, `count`).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FindOptions {
    pub filter: Filter,
    pub include: Option<IncludeSpec>,
    /// Projected columns. `None` selects every declared attribute.
    pub attributes: Option<Vec<String>>,
    pub order: Vec<Order>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Opt in to the read-through cache.
    pub cache: bool,
    /// Expiration of the written entry in seconds. `None` or `0` means no expiration.
    pub expire: Option<u64>,
    /// Return plain rows instead of model records.
    pub raw: bool,
}

impl FindOptions {
    pub fn filter(mut self, column: impl Into<String>, condition: Condition) -> Self {
        self.filter = self.filter.and(column, condition);
        self
    }

    pub fn include(mut self, include: impl Into<IncludeSpec>) -> Self {
        self.include = Some(include.into());
        self
    }

    pub fn attributes(mut self, attributes: &[&str]) -> Self {
        self.attributes = Some(attributes.iter().map(|a| a.to_string()).collect());
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order.push(order);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn cached(mut self) -> Self {
        self.cache = true;
        self
    }

    pub fn expire(mut self, seconds: u64) -> Self {
        self.expire = Some(seconds);
        self
    }

    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }

    pub fn ttl(&self) -> Option<Duration> {
        ttl(self.expire)
    }

    /// Includes in list form, without touching `self`.
    pub fn includes(&self) -> Vec<Include> {
        self.include.clone().map(IncludeSpec::into_vec).unwrap_or_default()
    }
}

/// Statement kind for free-form queries. Only `Select` is ever cached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueryKind {
    #[default]
    Select,
    Insert,
    Update,
    Delete,
    Raw,
}

/// Options for free-form parameterized queries.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawQueryOptions {
    pub kind: QueryKind,
    /// Model that scopes the key and rehydrates rows.
    pub model: Option<String>,
    /// Named parameters, hashed into the key.
    pub replacements: Option<BTreeMap<String, Value>>,
    /// Positional parameters, hashed into the key.
    pub bind: Vec<Value>,
    pub cache: bool,
    pub expire: Option<u64>,
    pub raw: bool,
}

impl RawQueryOptions {
    pub fn select() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: QueryKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn replacement(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.replacements
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.bind.push(value.into());
        self
    }

    pub fn cached(mut self) -> Self {
        self.cache = true;
        self
    }

    pub fn expire(mut self, seconds: u64) -> Self {
        self.expire = Some(seconds);
        self
    }

    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }

    pub fn ttl(&self) -> Option<Duration> {
        ttl(self.expire)
    }
}

fn ttl(expire: Option<u64>) -> Option<Duration> {
    expire.filter(|s| *s > 0).map(Duration::from_secs)
}

//! Entity models, rehydrated records and query result shapes.
//!
//! A [`ModelDef`] is the typed mapping between a table and application
//! records: its attributes (with defaults) and the associations used to
//! expand includes into joins. Models live in a [`ModelRegistry`] owned by
//! the data source.

use crate::error::{Error, Result};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Name of the primary key column every model carries.
pub const PRIMARY_KEY: &str = "id";

/// How an association joins its target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssociationKind {
    /// Source row holds the foreign key (`users.projectId -> projects.id`).
    BelongsTo,
    /// Target row holds the foreign key, at most one target.
    HasOne,
    /// Target rows hold the foreign key.
    HasMany,
}

/// A relationship from one model to another.
#[derive(Clone, Debug, PartialEq)]
pub struct Association {
    /// Alias used in includes and as the nested field name.
    pub alias: String,
    /// Name of the target model.
    pub target: String,
    pub kind: AssociationKind,
    /// Foreign key column. Lives on the source for `BelongsTo`, on the target otherwise.
    pub foreign_key: String,
}

/// A declared column with its default value.
#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub default: Value,
}

/// Model descriptor.
///
/// # Example
///
/// ```
/// use query_cache::model::ModelDef;
///
/// let users = ModelDef::new("users")
///     .attribute("name")
///     .belongs_to("project", "projects", "projectId");
///
/// assert_eq!(users.table_name(), "users");
/// assert!(users.association("project").is_some());
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct ModelDef {
    name: String,
    table_name: String,
    attributes: Vec<Attribute>,
    associations: Vec<Association>,
}

impl ModelDef {
    /// New model whose table shares its name. The primary key is implicit.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        ModelDef {
            table_name: name.clone(),
            name,
            attributes: vec![Attribute {
                name: PRIMARY_KEY.to_string(),
                default: Value::Null,
            }],
            associations: Vec::new(),
        }
    }

    pub fn with_table(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    /// Declare an attribute defaulting to `null`.
    pub fn attribute(self, name: impl Into<String>) -> Self {
        self.attribute_with_default(name, Value::Null)
    }

    pub fn attribute_with_default(mut self, name: impl Into<String>, default: Value) -> Self {
        let name = name.into();
        self.attributes.retain(|a| a.name != name);
        self.attributes.push(Attribute { name, default });
        self
    }

    pub fn belongs_to(
        self,
        alias: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        let foreign_key = foreign_key.into();
        self.associate(alias, target, AssociationKind::BelongsTo, foreign_key.clone())
            .attribute(foreign_key)
    }

    pub fn has_one(
        self,
        alias: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.associate(alias, target, AssociationKind::HasOne, foreign_key)
    }

    pub fn has_many(
        self,
        alias: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.associate(alias, target, AssociationKind::HasMany, foreign_key)
    }

    fn associate(
        mut self,
        alias: impl Into<String>,
        target: impl Into<String>,
        kind: AssociationKind,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.associations.push(Association {
            alias: alias.into(),
            target: target.into(),
            kind,
            foreign_key: foreign_key.into(),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(|a| a.name.as_str())
    }

    pub fn associations(&self) -> &[Association] {
        &self.associations
    }

    pub fn association(&self, alias: &str) -> Option<&Association> {
        self.associations.iter().find(|a| a.alias == alias)
    }

    /// Record freshly loaded from the database.
    pub fn load(&self, values: Map<String, Value>) -> Record {
        Record {
            model: Some(self.name.clone()),
            values,
            included: BTreeMap::new(),
            is_new_record: false,
        }
    }

    /// Rebuild a record from its plain structural form.
    ///
    /// Declared attributes missing from `values` receive their defaults and
    /// association aliases are rebuilt as nested records of the target model.
    /// The result is flagged as a new record, and values keep their stored JSON
    /// types (a datetime comes back as a string).
    ///
    /// # Errors
    ///
    /// `Error::Deserialization` when a nested association has the wrong shape
    /// or names a model missing from `registry`.
    pub fn build(&self, registry: &ModelRegistry, values: Map<String, Value>) -> Result<Record> {
        self.build_projected(registry, values, None)
    }

    /// Like [`build`](Self::build), but only attributes in `projection` receive
    /// defaults. Nested records are always rebuilt in full.
    pub fn build_projected(
        &self,
        registry: &ModelRegistry,
        values: Map<String, Value>,
        projection: Option<&[String]>,
    ) -> Result<Record> {
        let mut record = Record {
            model: Some(self.name.clone()),
            values: Map::new(),
            included: BTreeMap::new(),
            is_new_record: true,
        };

        for (field, value) in values {
            match self.association(&field) {
                Some(association) => {
                    let target = registry.get(&association.target).ok_or_else(|| {
                        Error::Deserialization(format!(
                            "association {}.{} targets unknown model {}",
                            self.name, field, association.target
                        ))
                    })?;
                    let nested = Included::build(target, registry, association.kind, value)?;
                    record.included.insert(field, nested);
                }
                None => {
                    record.values.insert(field, value);
                }
            }
        }

        let projected = |name: &str| projection.map_or(true, |p| p.iter().any(|f| f == name));
        for attribute in &self.attributes {
            if projected(&attribute.name) && !record.values.contains_key(&attribute.name) {
                record
                    .values
                    .insert(attribute.name.clone(), attribute.default.clone());
            }
        }

        Ok(record)
    }
}

/// Registered models, keyed by model name.
#[derive(Clone, Debug, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, Arc<ModelDef>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, model: ModelDef) -> Arc<ModelDef> {
        let model = Arc::new(model);
        self.models
            .insert(model.name().to_string(), Arc::clone(&model));
        model
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ModelDef>> {
        self.models.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Records attached to a parent through an include.
#[derive(Clone, Debug, PartialEq)]
pub enum Included {
    One(Option<Record>),
    Many(Vec<Record>),
}

impl Included {
    fn build(
        target: &ModelDef,
        registry: &ModelRegistry,
        kind: AssociationKind,
        value: Value,
    ) -> Result<Self> {
        match (kind, value) {
            (AssociationKind::HasMany, Value::Array(items)) => items
                .into_iter()
                .map(|item| build_object(target, registry, item))
                .collect::<Result<Vec<_>>>()
                .map(Included::Many),
            (AssociationKind::HasMany, other) => Err(Error::Deserialization(format!(
                "expected a list for {}, found {}",
                target.name(),
                other
            ))),
            (_, Value::Null) => Ok(Included::One(None)),
            (_, item) => build_object(target, registry, item).map(|r| Included::One(Some(r))),
        }
    }
}

fn build_object(target: &ModelDef, registry: &ModelRegistry, value: Value) -> Result<Record> {
    match value {
        Value::Object(values) => target.build(registry, values),
        other => Err(Error::Deserialization(format!(
            "expected an object for {}, found {}",
            target.name(),
            other
        ))),
    }
}

/// A row returned by a data source.
///
/// Plain rows (raw mode, free-form queries) have no model. Equality compares
/// model, values and included records; the new-record flag is not part of it.
#[derive(Clone, Debug)]
pub struct Record {
    model: Option<String>,
    values: Map<String, Value>,
    included: BTreeMap<String, Included>,
    is_new_record: bool,
}

impl Record {
    /// Plain row without a model.
    pub fn plain(values: Map<String, Value>) -> Self {
        Record {
            model: None,
            values,
            included: BTreeMap::new(),
            is_new_record: false,
        }
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn is_plain(&self) -> bool {
        self.model.is_none()
    }

    pub fn is_new_record(&self) -> bool {
        self.is_new_record
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn included(&self, alias: &str) -> Option<&Included> {
        self.included.get(alias)
    }

    pub fn include(&mut self, alias: impl Into<String>, nested: Included) {
        self.included.insert(alias.into(), nested);
    }

    /// Keep only the listed fields.
    pub fn retain_fields(&mut self, fields: &[String]) {
        self.values.retain(|k, _| fields.iter().any(|f| f == k));
    }

    /// Plain structural form: own values plus nested includes.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Drop the model, keeping the structural form.
    pub fn into_plain(self) -> Record {
        match self.to_json() {
            Value::Object(values) => Record::plain(values),
            _ => Record::plain(Map::new()),
        }
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.model == other.model && self.values == other.values && self.included == other.included
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len() + self.included.len()))?;
        for (k, v) in &self.values {
            map.serialize_entry(k, v)?;
        }
        for (alias, nested) in &self.included {
            match nested {
                Included::One(one) => map.serialize_entry(alias, one)?,
                Included::Many(many) => map.serialize_entry(alias, many)?,
            }
        }
        map.end()
    }
}

/// Outcome of a data-access call.
///
/// Serializes structurally: a scalar as itself, a single row as an object
/// or `null`, a row collection as an array.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryResult {
    Scalar(Value),
    Row(Option<Record>),
    Rows(Vec<Record>),
}

impl QueryResult {
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            QueryResult::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_row(self) -> Result<Option<Record>> {
        match self {
            QueryResult::Row(row) => Ok(row),
            other => Err(shape_error("a single row", &other)),
        }
    }

    pub fn into_rows(self) -> Result<Vec<Record>> {
        match self {
            QueryResult::Rows(rows) => Ok(rows),
            other => Err(shape_error("a row collection", &other)),
        }
    }

    pub fn into_scalar(self) -> Result<Value> {
        match self {
            QueryResult::Scalar(v) => Ok(v),
            other => Err(shape_error("a scalar", &other)),
        }
    }

    pub fn into_count(self) -> Result<u64> {
        let value = self.into_scalar()?;
        value
            .as_u64()
            .ok_or_else(|| Error::Deserialization(format!("expected a count, found {}", value)))
    }
}

fn shape_error(expected: &str, found: &QueryResult) -> Error {
    let found = match found {
        QueryResult::Scalar(_) => "a scalar",
        QueryResult::Row(_) => "a single row",
        QueryResult::Rows(_) => "a row collection",
    };
    Error::Deserialization(format!("expected {}, found {}", expected, found))
}

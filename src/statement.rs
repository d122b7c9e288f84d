//! Statement compilation for cache keys.
//!
//! The compiled statement is only hashed, never executed. It has to be
//! canonical: the same model call always renders the same text, and any
//! difference in filter, projection, joins or paging shows up in it.

use crate::descriptor::{Method, QueryDescriptor};
use crate::error::{Error, Result};
use crate::model::{AssociationKind, ModelDef, ModelRegistry, PRIMARY_KEY};
use crate::options::{Condition, Filter, Include, IncludeSpec, Order};
use serde_json::Value;

/// Renders a canonical statement for a model call.
pub trait StatementCompiler: Send + Sync {
    /// Render the select statement `descriptor` would run against `model`.
    ///
    /// # Errors
    ///
    /// `Error::KeyGeneration` when the options cannot be expanded, e.g. an
    /// include naming an association `model` does not declare.
    fn select_query(
        &self,
        registry: &ModelRegistry,
        model: &ModelDef,
        descriptor: &QueryDescriptor<'_>,
    ) -> Result<String>;
}

/// ANSI-quoted SQL renderer.
///
/// ```
/// use query_cache::descriptor::QueryDescriptor;
/// use query_cache::model::{ModelDef, ModelRegistry};
/// use query_cache::options::{Condition, FindOptions};
/// use query_cache::statement::{SqlCompiler, StatementCompiler};
///
/// let mut registry = ModelRegistry::new();
/// let projects = registry.register(ModelDef::new("projects").attribute("title"));
/// let options = FindOptions::default().filter("title", Condition::Eq("bar".into()));
///
/// let sql = SqlCompiler
///     .select_query(&registry, &projects, &QueryDescriptor::FindAll { model: "projects", options: &options })
///     .unwrap();
/// assert_eq!(
///     sql,
///     r#"SELECT "projects"."id", "projects"."title" FROM "projects" AS "projects" WHERE "projects"."title" = 'bar';"#
/// );
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct SqlCompiler;

#[derive(Default)]
struct Expansion {
    columns: Vec<String>,
    joins: Vec<String>,
}

impl StatementCompiler for SqlCompiler {
    fn select_query(
        &self,
        registry: &ModelRegistry,
        model: &ModelDef,
        descriptor: &QueryDescriptor<'_>,
    ) -> Result<String> {
        let options = descriptor.find_options().ok_or_else(|| {
            Error::KeyGeneration("free-form queries are hashed as written".to_string())
        })?;

        // Work on a copy so normalisation never leaks back to the caller.
        let mut options = options.clone();
        let includes = options
            .include
            .take()
            .map(IncludeSpec::into_vec)
            .unwrap_or_default();
        if descriptor.method() == Method::FindOne {
            options.limit = Some(1);
        }

        let root = model.table_name();
        let mut expansion = Expansion::default();
        for include in &includes {
            expand_include(registry, model, root, None, include, &mut expansion)?;
        }

        let projection = match descriptor {
            QueryDescriptor::Aggregate {
                function, column, ..
            } => {
                if column.is_empty() {
                    return Err(Error::KeyGeneration(format!(
                        "{} on {} needs a column",
                        function,
                        model.name()
                    )));
                }
                format!(
                    "{}({}) AS {}",
                    function,
                    qualified(root, column),
                    quote_ident(function.as_str())
                )
            }
            QueryDescriptor::Count { .. } if includes.is_empty() => {
                format!("count({}) AS \"count\"", qualified(root, PRIMARY_KEY))
            }
            QueryDescriptor::Count { .. } => {
                format!("count(DISTINCT({})) AS \"count\"", qualified(root, PRIMARY_KEY))
            }
            _ => {
                let mut columns: Vec<String> = match &options.attributes {
                    Some(attributes) => attributes.iter().map(|a| qualified(root, a)).collect(),
                    None => model.attribute_names().map(|a| qualified(root, a)).collect(),
                };
                columns.append(&mut expansion.columns);
                columns.join(", ")
            }
        };

        let mut sql = format!(
            "SELECT {} FROM {} AS {}",
            projection,
            quote_ident(model.table_name()),
            quote_ident(root)
        );
        for join in &expansion.joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if !options.filter.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&render_filter(root, &options.filter).join(" AND "));
        }
        if !options.order.is_empty() {
            let order: Vec<String> = options
                .order
                .iter()
                .map(|o| match o {
                    Order::Asc(c) => format!("{} ASC", qualified(root, c)),
                    Order::Desc(c) => format!("{} DESC", qualified(root, c)),
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
        }
        if let Some(limit) = options.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = options.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
        sql.push(';');

        Ok(sql)
    }
}

fn expand_include(
    registry: &ModelRegistry,
    parent: &ModelDef,
    parent_alias: &str,
    parent_path: Option<&str>,
    include: &Include,
    out: &mut Expansion,
) -> Result<()> {
    let association = parent.association(&include.association).ok_or_else(|| {
        Error::KeyGeneration(format!(
            "{} is not associated to {}",
            include.association,
            parent.name()
        ))
    })?;
    let target = registry.get(&association.target).ok_or_else(|| {
        Error::KeyGeneration(format!(
            "association {}.{} targets unknown model {}",
            parent.name(),
            association.alias,
            association.target
        ))
    })?;

    let alias = match parent_path {
        Some(path) => format!("{}->{}", path, association.alias),
        None => association.alias.clone(),
    };

    for attribute in target.attribute_names() {
        out.columns.push(format!(
            "{} AS {}",
            qualified(&alias, attribute),
            quote_ident(&format!("{}.{}", alias, attribute))
        ));
    }

    let mut on = match association.kind {
        AssociationKind::BelongsTo => format!(
            "{} = {}",
            qualified(parent_alias, &association.foreign_key),
            qualified(&alias, PRIMARY_KEY)
        ),
        AssociationKind::HasOne | AssociationKind::HasMany => format!(
            "{} = {}",
            qualified(parent_alias, PRIMARY_KEY),
            qualified(&alias, &association.foreign_key)
        ),
    };
    for condition in render_filter(&alias, &include.filter) {
        on.push_str(" AND ");
        on.push_str(&condition);
    }

    out.joins.push(format!(
        "{} {} AS {} ON {}",
        if include.required {
            "INNER JOIN"
        } else {
            "LEFT OUTER JOIN"
        },
        quote_ident(target.table_name()),
        quote_ident(&alias),
        on
    ));

    for nested in &include.include {
        expand_include(registry, target, &alias, Some(&alias), nested, out)?;
    }

    Ok(())
}

fn render_filter(alias: &str, filter: &Filter) -> Vec<String> {
    filter
        .iter()
        .map(|(column, condition)| render_condition(&qualified(alias, column), condition))
        .collect()
}

fn render_condition(column: &str, condition: &Condition) -> String {
    match condition {
        Condition::Eq(Value::Null) | Condition::IsNull => format!("{} IS NULL", column),
        Condition::Ne(Value::Null) | Condition::NotNull => format!("{} IS NOT NULL", column),
        Condition::Eq(v) => format!("{} = {}", column, literal(v)),
        Condition::Ne(v) => format!("{} != {}", column, literal(v)),
        Condition::Gt(v) => format!("{} > {}", column, literal(v)),
        Condition::Gte(v) => format!("{} >= {}", column, literal(v)),
        Condition::Lt(v) => format!("{} < {}", column, literal(v)),
        Condition::Lte(v) => format!("{} <= {}", column, literal(v)),
        Condition::In(values) if values.is_empty() => format!("{} IN (NULL)", column),
        Condition::In(values) => {
            let values: Vec<String> = values.iter().map(literal).collect();
            format!("{} IN ({})", column, values.join(", "))
        }
        Condition::Like(pattern) => format!("{} LIKE {}", column, quote_str(pattern)),
    }
}

/// SQL literal for a JSON value. Composite values are stored as JSON text.
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_str(s),
        other => quote_str(&other.to_string()),
    }
}

fn quote_str(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn quote_ident(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

fn qualified(alias: &str, column: &str) -> String {
    format!("{}.{}", quote_ident(alias), quote_ident(column))
}

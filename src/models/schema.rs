//! Model metadata and abstract query descriptions.
//!
//! The model layer and the QuerySet live outside this crate; these types are
//! the boundary they hand over. A model is described by its logical database,
//! its table and its primary-key column(s). A query is four pre-rendered SQL
//! fragments plus the parameters any placeholders inside them need.

use crate::error::{DbError, DbResult};
use crate::models::query::{NamedParams, Scalar};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Separator between columns of a composite primary-key descriptor.
pub const PRIMARY_KEY_SEPARATOR: char = ',';

/// Primary key of a persisted entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimaryKey {
    Single(String),
    Composite(Vec<String>),
}

impl PrimaryKey {
    /// Parse a descriptor: `"id"` or a comma-joined list such as `"user_id,group_id"`.
    pub fn parse(descriptor: &str) -> DbResult<Self> {
        let columns: Vec<String> = descriptor
            .split(PRIMARY_KEY_SEPARATOR)
            .map(|c| c.trim().to_string())
            .collect();

        if columns.iter().any(|c| c.is_empty()) {
            return Err(DbError::invalid_input(format!(
                "Invalid primary key descriptor '{}'",
                descriptor
            )));
        }
        for column in &columns {
            validate_identifier(column)?;
        }

        let mut columns = columns;
        if columns.len() == 1 {
            Ok(Self::Single(columns.remove(0)))
        } else {
            Ok(Self::Composite(columns))
        }
    }

    pub fn columns(&self) -> Vec<&str> {
        match self {
            Self::Single(c) => vec![c.as_str()],
            Self::Composite(cs) => cs.iter().map(String::as_str).collect(),
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, Self::Composite(_))
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.columns().join(","))
    }
}

/// Metadata descriptor for a persisted entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelMeta {
    /// Logical database the entity lives in
    pub database: String,
    pub table: String,
    pub primary_key: PrimaryKey,
}

impl ModelMeta {
    pub fn new(
        database: impl Into<String>,
        table: impl Into<String>,
        primary_key: &str,
    ) -> DbResult<Self> {
        let table = table.into();
        validate_identifier(&table)?;
        Ok(Self {
            database: database.into(),
            table,
            primary_key: PrimaryKey::parse(primary_key)?,
        })
    }

    /// Column of a single-column primary key.
    pub fn single_key(&self) -> DbResult<&str> {
        match &self.primary_key {
            PrimaryKey::Single(c) => Ok(c),
            PrimaryKey::Composite(_) => Err(DbError::invalid_input(format!(
                "Table '{}' has a composite primary key ({})",
                self.table, self.primary_key
            ))),
        }
    }
}

/// Identity of a persisted record.
///
/// Identities are returned to the caller; this layer never caches by them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Identity {
    Single(Scalar),
    Composite(BTreeMap<String, Scalar>),
}

impl Identity {
    /// Whether the identity refers to an existing record.
    pub fn is_present(&self) -> bool {
        match self {
            Self::Single(v) => v.is_truthy(),
            Self::Composite(m) => !m.is_empty() && m.values().all(|v| !v.is_null()),
        }
    }
}

impl From<Scalar> for Identity {
    fn from(v: Scalar) -> Self {
        Self::Single(v)
    }
}

impl From<i64> for Identity {
    fn from(v: i64) -> Self {
        Self::Single(Scalar::Int(v))
    }
}

impl From<u64> for Identity {
    fn from(v: u64) -> Self {
        Self::Single(v.into())
    }
}

/// The four pre-rendered fragments of an abstract query.
///
/// The fragments are opaque SQL text (e.g. `WHERE status = :status`,
/// `ORDER BY id DESC`, `LIMIT 10`); they may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParts {
    pub table: String,
    pub where_clause: String,
    pub order_clause: String,
    pub limit_clause: String,
}

/// An abstract query handed over by the QuerySet layer.
pub trait QuerySource {
    /// Metadata of the entity type the query selects.
    fn model(&self) -> &ModelMeta;

    fn create_statement(&self) -> QueryParts;

    /// Values for placeholders used inside the fragments.
    fn params(&self) -> NamedParams {
        NamedParams::new()
    }
}

/// A query built directly from fragments.
#[derive(Debug, Clone)]
pub struct RawQuery {
    model: ModelMeta,
    parts: QueryParts,
    params: NamedParams,
}

impl RawQuery {
    pub fn new(model: ModelMeta) -> Self {
        let parts = QueryParts {
            table: model.table.clone(),
            ..QueryParts::default()
        };
        Self {
            model,
            parts,
            params: NamedParams::new(),
        }
    }

    pub fn filter(mut self, where_clause: impl Into<String>) -> Self {
        self.parts.where_clause = where_clause.into();
        self
    }

    pub fn order(mut self, order_clause: impl Into<String>) -> Self {
        self.parts.order_clause = order_clause.into();
        self
    }

    pub fn limit(mut self, limit_clause: impl Into<String>) -> Self {
        self.parts.limit_clause = limit_clause.into();
        self
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.params.insert(name, value);
        self
    }
}

impl QuerySource for RawQuery {
    fn model(&self) -> &ModelMeta {
        &self.model
    }

    fn create_statement(&self) -> QueryParts {
        self.parts.clone()
    }

    fn params(&self) -> NamedParams {
        self.params.clone()
    }
}

/// Check that a table or column name is a plain (optionally qualified) identifier.
pub fn validate_identifier(name: &str) -> DbResult<()> {
    let valid = !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });

    if valid {
        Ok(())
    } else {
        Err(DbError::invalid_input(format!(
            "'{}' is not a valid identifier",
            name
        )))
    }
}

//! Record persistence: load, save, delete and replace by primary key.

use crate::db::assembler::{AssignMode, Statement, render_assignments};
use crate::db::driver::Connector;
use crate::db::mysql::MySqlConnector;
use crate::db::pool::{Database, DatabaseRegistry};
use crate::error::{DbError, DbResult};
use crate::models::{
    FieldMap, FieldValue, Identity, ModelMeta, NamedParams, PrimaryKey, Row, Scalar,
    validate_identifier,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// What [`save_statement`] decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveAction {
    /// UPDATE keyed by the current identity
    Update,
    /// INSERT IGNORE on a single-column key; the id comes from the server
    InsertIgnore,
    /// Plain INSERT on a composite key
    Insert,
}

/// Build the `WHERE` condition selecting one record by identity.
///
/// Integral key values bind as integers, everything else as strings.
pub fn key_condition(model: &ModelMeta, identity: &Identity) -> DbResult<(String, NamedParams)> {
    let mut params = NamedParams::new();
    let mut conditions = Vec::new();

    match (&model.primary_key, identity) {
        (PrimaryKey::Single(column), Identity::Single(value)) => {
            conditions.push(bind_key(&mut params, 0, column, value));
        }
        (PrimaryKey::Composite(columns), Identity::Composite(values)) => {
            for (i, column) in columns.iter().enumerate() {
                let value = values.get(column).ok_or_else(|| {
                    DbError::invalid_input(format!(
                        "Identity for '{}' has no value for key column '{}'",
                        model.table, column
                    ))
                })?;
                conditions.push(bind_key(&mut params, i, column, value));
            }
        }
        (pk, _) => {
            return Err(DbError::invalid_input(format!(
                "Identity shape does not match primary key '{}' of '{}'",
                pk, model.table
            )));
        }
    }

    Ok((conditions.join(" AND "), params))
}

fn bind_key(params: &mut NamedParams, i: usize, column: &str, value: &Scalar) -> String {
    let name = match value {
        Scalar::Int(_) | Scalar::Bool(_) => format!("_k{}", i),
        _ => format!("k{}", i),
    };
    params.insert(name.clone(), value.clone());
    format!("{} = :{}", column, name)
}

/// `SELECT * FROM <table> WHERE <pk> = :_k0`
pub fn load_statement(model: &ModelMeta, identity: &Identity) -> DbResult<Statement> {
    let (condition, params) = key_condition(model, identity)?;
    Ok(Statement::new(
        format!("SELECT * FROM {} WHERE {}", model.table, condition),
        params,
    ))
}

/// `DELETE FROM <table> WHERE <pk> = :_k0`
pub fn delete_statement(model: &ModelMeta, identity: &Identity) -> DbResult<Statement> {
    let (condition, params) = key_condition(model, identity)?;
    Ok(Statement::new(
        format!("DELETE FROM {} WHERE {}", model.table, condition),
        params,
    ))
}

/// `REPLACE INTO <table> SET <fields>`
pub fn replace_statement(model: &ModelMeta, fields: &FieldMap) -> DbResult<Statement> {
    let (assignments, params) = insert_assignments(fields)?;
    Ok(Statement::new(
        format!("REPLACE INTO {} SET {}", model.table, assignments),
        params,
    ))
}

/// Choose between UPDATE, INSERT IGNORE and INSERT and build the statement.
pub fn save_statement(
    model: &ModelMeta,
    fields: &FieldMap,
    current: Option<&Identity>,
    force_insert: bool,
) -> DbResult<(SaveAction, Statement)> {
    if model.primary_key.is_composite() {
        let (assignments, params) = insert_assignments(fields)?;
        let sql = format!("INSERT INTO {} SET {}", model.table, assignments);
        return Ok((SaveAction::Insert, Statement::new(sql, params)));
    }

    match current {
        Some(identity) if !force_insert && identity.is_present() => {
            let (assignments, mut params) = render_assignments(fields, AssignMode::AsGiven)?;
            let (condition, key_params) = key_condition(model, identity)?;
            params.extend(key_params);
            let sql = format!(
                "UPDATE {} SET {} WHERE {}",
                model.table, assignments, condition
            );
            Ok((SaveAction::Update, Statement::new(sql, params)))
        }
        _ => {
            let (assignments, params) = insert_assignments(fields)?;
            let sql = format!("INSERT IGNORE INTO {} SET {}", model.table, assignments);
            Ok((SaveAction::InsertIgnore, Statement::new(sql, params)))
        }
    }
}

/// Assignments for INSERT and REPLACE, where arithmetic on a column has no row to apply to.
fn insert_assignments(fields: &FieldMap) -> DbResult<(String, NamedParams)> {
    if let Some((column, _)) = fields
        .iter()
        .find(|(_, v)| matches!(v, FieldValue::Delta(..)))
    {
        return Err(DbError::invalid_input(format!(
            "Field '{}' uses an arithmetic update, which INSERT and REPLACE cannot apply",
            column
        )));
    }
    render_assignments(fields, AssignMode::AsGiven)
}

/// Identity of a composite-key record, taken from the saved field values.
pub fn composite_identity(model: &ModelMeta, fields: &FieldMap) -> DbResult<Identity> {
    let mut key = BTreeMap::new();
    for column in model.primary_key.columns() {
        match fields.get(column) {
            Some(FieldValue::Set(value)) => {
                key.insert(column.to_string(), value.clone());
            }
            _ => {
                return Err(DbError::invalid_input(format!(
                    "Key column '{}' of '{}' must be set to save the record",
                    column, model.table
                )));
            }
        }
    }
    Ok(Identity::Composite(key))
}

/// Loads and stores records through the model's database.
pub struct RecordStore<C: Connector = MySqlConnector> {
    registry: Arc<DatabaseRegistry<C>>,
}

impl<C: Connector> Clone for RecordStore<C> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<C: Connector> RecordStore<C> {
    pub fn new(registry: Arc<DatabaseRegistry<C>>) -> Self {
        Self { registry }
    }

    async fn database(&self, model: &ModelMeta) -> DbResult<Arc<Database<C>>> {
        validate_identifier(&model.table)?;
        self.registry.get(&model.database).await
    }

    /// Fetch one record by identity, from a slave unless `from_master` is set.
    pub async fn load(
        &self,
        model: &ModelMeta,
        identity: &Identity,
        from_master: bool,
    ) -> DbResult<Option<Row>> {
        let stmt = load_statement(model, identity)?;
        let db = self.database(model).await?;
        db.one(&stmt.sql, &stmt.params, from_master).await
    }

    /// Insert or update a record and return its identity.
    ///
    /// A single-key record with a present `current` identity is updated in
    /// place unless `force_insert` is set. Otherwise it is inserted with
    /// `INSERT IGNORE`; a duplicate key yields [`DbError::InsertIgnored`].
    /// Composite-key records are always inserted, and their identity is the
    /// key columns of `fields`.
    pub async fn save(
        &self,
        model: &ModelMeta,
        fields: &FieldMap,
        current: Option<&Identity>,
        force_insert: bool,
    ) -> DbResult<Identity> {
        let (action, stmt) = save_statement(model, fields, current, force_insert)?;
        let identity = match action {
            SaveAction::Insert => Some(composite_identity(model, fields)?),
            _ => None,
        };

        let db = self.database(model).await?;
        let outcome = db.write_outcome(&stmt.sql, &stmt.params).await?;
        debug!(
            database = %model.database,
            table = %model.table,
            action = ?action,
            rows_affected = outcome.rows_affected,
            "Record saved"
        );

        match action {
            SaveAction::Update => current
                .cloned()
                .ok_or_else(|| DbError::internal("UPDATE chosen without an identity")),
            SaveAction::InsertIgnore => {
                if outcome.rows_affected == 0 {
                    return Err(DbError::insert_ignored(&model.table));
                }
                Ok(Identity::from(outcome.last_insert_id))
            }
            SaveAction::Insert => {
                identity.ok_or_else(|| DbError::internal("Composite identity missing"))
            }
        }
    }

    /// Delete one record by identity and return the affected row count.
    pub async fn delete(&self, model: &ModelMeta, identity: &Identity) -> DbResult<u64> {
        let stmt = delete_statement(model, identity)?;
        let db = self.database(model).await?;
        db.write(&stmt.sql, &stmt.params).await
    }

    /// Insert the record, replacing any existing row with the same key.
    pub async fn replace(&self, model: &ModelMeta, fields: &FieldMap) -> DbResult<()> {
        let stmt = replace_statement(model, fields)?;
        let db = self.database(model).await?;
        db.write(&stmt.sql, &stmt.params).await?;
        Ok(())
    }
}

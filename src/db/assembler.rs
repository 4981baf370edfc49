//! SQL assembly for abstract queries.
//!
//! The `*_statement` functions are pure: they turn a [`QuerySource`] (plus a
//! [`FieldMap`] for updates) into a [`Statement`]. [`QueryAssembler`] runs
//! those statements through the model's database in the registry.
//!
//! Values never appear in the SQL text. Plain assignments bind as strings,
//! arithmetic operands bind as integers when they are integral.

use crate::db::driver::Connector;
use crate::db::mysql::MySqlConnector;
use crate::db::params::{BoundParam, bind_named};
use crate::db::pool::{Database, DatabaseRegistry, Route};
use crate::error::{DbError, DbResult};
use crate::models::{
    DeltaOp, FieldMap, FieldValue, Identity, NamedParams, QuerySource, Row, Scalar,
    validate_identifier,
};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;

/// SQL text with `:name` placeholders and the values bound to them.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: NamedParams,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: NamedParams) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Render the statement with its values substituted, for display only.
    ///
    /// Integer bindings appear bare, string bindings single-quoted with `'`
    /// and `\` escaped.
    pub fn inline(&self) -> DbResult<String> {
        let positional = bind_named(&self.sql, &self.params)?;
        let mut values = positional.params.iter();
        let mut out = String::with_capacity(positional.sql.len());
        let mut chars = positional.sql.chars();
        let mut quote: Option<char> = None;

        while let Some(c) = chars.next() {
            if let Some(q) = quote {
                out.push(c);
                if c == '\\' && q != '`' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if c == q {
                    quote = None;
                }
                continue;
            }
            match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    out.push(c);
                }
                '?' => match values.next() {
                    Some(BoundParam::Null) => out.push_str("NULL"),
                    Some(BoundParam::Int(v)) => out.push_str(&v.to_string()),
                    Some(BoundParam::Str(v)) => out.push_str(&quote_literal(v)),
                    None => out.push(c),
                },
                _ => out.push(c),
            }
        }
        Ok(out)
    }
}

/// Single-quote a string literal, escaping `\` and `'`.
pub fn quote_literal(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\\' || c == '\'' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

/// How field values are turned into assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AssignMode {
    /// `col = value` for plain values, `col = col <op> operand` for deltas
    AsGiven,
    /// Every field becomes `col = col <op> value`
    Force(DeltaOp),
}

/// Render the comma-joined assignments of a SET clause and their parameters.
pub(crate) fn render_assignments(
    fields: &FieldMap,
    mode: AssignMode,
) -> DbResult<(String, NamedParams)> {
    if fields.is_empty() {
        return Err(DbError::invalid_input("No fields to assign"));
    }

    let mut params = NamedParams::new();
    let mut assignments = Vec::with_capacity(fields.len());

    for (i, (column, value)) in fields.iter().enumerate() {
        validate_identifier(column)?;
        let assignment = match (mode, value) {
            (AssignMode::AsGiven, FieldValue::Set(v)) => {
                let name = format!("fld{}", i);
                params.insert(name.clone(), v.clone());
                format!("{} = :{}", column, name)
            }
            (AssignMode::AsGiven, FieldValue::Delta(op, v)) => {
                delta_assignment(&mut params, i, column, *op, v)
            }
            (AssignMode::Force(op), FieldValue::Set(v) | FieldValue::Delta(_, v)) => {
                delta_assignment(&mut params, i, column, op, v)
            }
        };
        assignments.push(assignment);
    }

    Ok((assignments.join(", "), params))
}

fn delta_assignment(
    params: &mut NamedParams,
    i: usize,
    column: &str,
    op: DeltaOp,
    operand: &Scalar,
) -> String {
    let name = if is_integral(operand) {
        format!("_fld{}", i)
    } else {
        format!("fld{}", i)
    };
    params.insert(name.clone(), operand.clone());
    format!("{} = {} {} :{}", column, column, op, name)
}

fn is_integral(value: &Scalar) -> bool {
    match value {
        Scalar::Int(_) | Scalar::Bool(_) => true,
        Scalar::Text(v) => v.trim().parse::<i64>().is_ok(),
        Scalar::Null | Scalar::Float(_) => false,
    }
}

/// Merge assembler parameters into the query's own, rejecting name clashes.
pub(crate) fn merge_params(mut base: NamedParams, extra: NamedParams) -> DbResult<NamedParams> {
    if let Some((name, _)) = extra.iter().find(|(name, _)| base.get(name).is_some()) {
        return Err(DbError::invalid_input(format!(
            "Parameter ':{}' is already used by the query",
            name
        )));
    }
    base.extend(extra);
    Ok(base)
}

/// Join SQL fragments with single spaces, skipping empty ones.
pub(crate) fn compose(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn qualify(table: &str, column: &str) -> String {
    if column.contains('.') {
        column.to_string()
    } else {
        format!("{}.{}", table, column)
    }
}

/// Name a column comes back under in a result row.
fn result_name(column: &str) -> &str {
    column.rsplit('.').next().unwrap_or(column)
}

fn select_statement<Q: QuerySource + ?Sized>(query: &Q, columns: &[&str]) -> DbResult<Statement> {
    if columns.is_empty() {
        return Err(DbError::invalid_input("At least one column must be selected"));
    }
    let parts = query.create_statement();
    validate_identifier(&parts.table)?;
    for column in columns {
        validate_identifier(column)?;
    }

    let list = columns
        .iter()
        .map(|c| qualify(&parts.table, c))
        .collect::<Vec<_>>()
        .join(", ");
    let head = format!("SELECT {} FROM {}", list, parts.table);
    let sql = compose(&[
        head.as_str(),
        parts.where_clause.as_str(),
        parts.order_clause.as_str(),
        parts.limit_clause.as_str(),
    ]);
    Ok(Statement::new(sql, query.params()))
}

/// `SELECT <table>.<pk...> FROM <table> <where> <order> <limit>`
pub fn keys_statement<Q: QuerySource + ?Sized>(query: &Q) -> DbResult<Statement> {
    let pk = query.model().primary_key.columns();
    select_statement(query, &pk)
}

pub fn column_statement<Q: QuerySource + ?Sized>(query: &Q, column: &str) -> DbResult<Statement> {
    select_statement(query, &[column])
}

pub fn columns_statement<Q: QuerySource + ?Sized>(
    query: &Q,
    columns: &[&str],
) -> DbResult<Statement> {
    select_statement(query, columns)
}

/// `SELECT <table>.* FROM <table> <where> <order> <limit>`
pub fn items_statement<Q: QuerySource + ?Sized>(query: &Q) -> DbResult<Statement> {
    let parts = query.create_statement();
    validate_identifier(&parts.table)?;
    let head = format!("SELECT {}.* FROM {}", parts.table, parts.table);
    let sql = compose(&[
        head.as_str(),
        parts.where_clause.as_str(),
        parts.order_clause.as_str(),
        parts.limit_clause.as_str(),
    ]);
    Ok(Statement::new(sql, query.params()))
}

/// `SELECT COUNT(1) AS num FROM <table> <where>`
pub fn count_statement<Q: QuerySource + ?Sized>(query: &Q) -> DbResult<Statement> {
    let parts = query.create_statement();
    validate_identifier(&parts.table)?;
    let head = format!("SELECT COUNT(1) AS num FROM {}", parts.table);
    Ok(Statement::new(
        compose(&[head.as_str(), parts.where_clause.as_str()]),
        query.params(),
    ))
}

fn assign_statement<Q: QuerySource + ?Sized>(
    query: &Q,
    fields: &FieldMap,
    mode: AssignMode,
) -> DbResult<Statement> {
    let parts = query.create_statement();
    validate_identifier(&parts.table)?;
    let (assignments, params) = render_assignments(fields, mode)?;
    let head = format!("UPDATE {} SET {}", parts.table, assignments);
    Ok(Statement::new(
        compose(&[head.as_str(), parts.where_clause.as_str()]),
        merge_params(query.params(), params)?,
    ))
}

/// `UPDATE <table> SET <assignments> <where>`
pub fn update_statement<Q: QuerySource + ?Sized>(
    query: &Q,
    fields: &FieldMap,
) -> DbResult<Statement> {
    assign_statement(query, fields, AssignMode::AsGiven)
}

/// Like [`update_statement`] with every field rendered as `col = col + value`.
pub fn increment_statement<Q: QuerySource + ?Sized>(
    query: &Q,
    fields: &FieldMap,
) -> DbResult<Statement> {
    assign_statement(query, fields, AssignMode::Force(DeltaOp::Add))
}

/// Like [`update_statement`] with every field rendered as `col = col - value`.
pub fn decrement_statement<Q: QuerySource + ?Sized>(
    query: &Q,
    fields: &FieldMap,
) -> DbResult<Statement> {
    assign_statement(query, fields, AssignMode::Force(DeltaOp::Sub))
}

/// `DELETE FROM <table> <where>`
pub fn delete_statement<Q: QuerySource + ?Sized>(query: &Q) -> DbResult<Statement> {
    let parts = query.create_statement();
    validate_identifier(&parts.table)?;
    let head = format!("DELETE FROM {}", parts.table);
    Ok(Statement::new(
        compose(&[head.as_str(), parts.where_clause.as_str()]),
        query.params(),
    ))
}

/// Runs assembled statements against the model's database.
///
/// Reads go to a slave unless the assembler was switched with
/// [`QueryAssembler::on_master`]; writes always go to the master.
pub struct QueryAssembler<C: Connector = MySqlConnector> {
    registry: Arc<DatabaseRegistry<C>>,
    route: Route,
}

impl<C: Connector> Clone for QueryAssembler<C> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            route: self.route,
        }
    }
}

impl<C: Connector> QueryAssembler<C> {
    pub fn new(registry: Arc<DatabaseRegistry<C>>) -> Self {
        Self {
            registry,
            route: Route::Slave,
        }
    }

    /// A copy of this assembler whose reads go to the master.
    pub fn on_master(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            route: Route::Master,
        }
    }

    pub fn read_route(&self) -> Route {
        self.route
    }

    async fn database<Q: QuerySource + ?Sized>(&self, query: &Q) -> DbResult<Arc<Database<C>>> {
        self.registry.get(&query.model().database).await
    }

    async fn fetch<Q: QuerySource + ?Sized>(
        &self,
        query: &Q,
        stmt: &Statement,
    ) -> DbResult<Vec<Row>> {
        let db = self.database(query).await?;
        db.read(&stmt.sql, &stmt.params, self.route == Route::Master)
            .await
    }

    async fn run_write<Q: QuerySource + ?Sized>(
        &self,
        query: &Q,
        stmt: &Statement,
    ) -> DbResult<u64> {
        let db = self.database(query).await?;
        db.write(&stmt.sql, &stmt.params).await
    }

    /// Primary-key identities of every matching record.
    pub async fn keys<Q: QuerySource + ?Sized>(&self, query: &Q) -> DbResult<Vec<Identity>> {
        let stmt = keys_statement(query)?;
        let rows = self.fetch(query, &stmt).await?;
        let pk = &query.model().primary_key;

        rows.iter()
            .map(|row| {
                if pk.is_composite() {
                    let mut key = BTreeMap::new();
                    for column in pk.columns() {
                        key.insert(column.to_string(), row_scalar(row, column)?);
                    }
                    Ok(Identity::Composite(key))
                } else {
                    let column = query.model().single_key()?;
                    Ok(Identity::Single(row_scalar(row, column)?))
                }
            })
            .collect()
    }

    /// Values of one column, in result order.
    pub async fn column<Q: QuerySource + ?Sized>(
        &self,
        query: &Q,
        column: &str,
    ) -> DbResult<Vec<JsonValue>> {
        let stmt = column_statement(query, column)?;
        let rows = self.fetch(query, &stmt).await?;
        let name = result_name(column);
        Ok(rows
            .into_iter()
            .map(|mut row| row.remove(name).unwrap_or(JsonValue::Null))
            .collect())
    }

    pub async fn columns<Q: QuerySource + ?Sized>(
        &self,
        query: &Q,
        columns: &[&str],
    ) -> DbResult<Vec<Row>> {
        let stmt = columns_statement(query, columns)?;
        self.fetch(query, &stmt).await
    }

    /// Every column of every matching record.
    pub async fn items<Q: QuerySource + ?Sized>(&self, query: &Q) -> DbResult<Vec<Row>> {
        let stmt = items_statement(query)?;
        self.fetch(query, &stmt).await
    }

    pub async fn count<Q: QuerySource + ?Sized>(&self, query: &Q) -> DbResult<u64> {
        let stmt = count_statement(query)?;
        let row = self
            .fetch(query, &stmt)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DbError::empty_result("COUNT returned no row"))?;

        match row.get("num") {
            Some(JsonValue::Number(n)) => n
                .as_u64()
                .ok_or_else(|| DbError::internal(format!("Invalid count value: {}", n))),
            Some(JsonValue::String(s)) => s
                .parse()
                .map_err(|_| DbError::internal(format!("Invalid count value: {}", s))),
            _ => Err(DbError::empty_result("COUNT row has no 'num' column")),
        }
    }

    pub async fn update<Q: QuerySource + ?Sized>(
        &self,
        query: &Q,
        fields: &FieldMap,
    ) -> DbResult<u64> {
        let stmt = update_statement(query, fields)?;
        self.run_write(query, &stmt).await
    }

    pub async fn increment<Q: QuerySource + ?Sized>(
        &self,
        query: &Q,
        fields: &FieldMap,
    ) -> DbResult<u64> {
        let stmt = increment_statement(query, fields)?;
        self.run_write(query, &stmt).await
    }

    pub async fn decrement<Q: QuerySource + ?Sized>(
        &self,
        query: &Q,
        fields: &FieldMap,
    ) -> DbResult<u64> {
        let stmt = decrement_statement(query, fields)?;
        self.run_write(query, &stmt).await
    }

    pub async fn delete<Q: QuerySource + ?Sized>(&self, query: &Q) -> DbResult<u64> {
        let stmt = delete_statement(query)?;
        self.run_write(query, &stmt).await
    }
}

fn row_scalar(row: &Row, column: &str) -> DbResult<Scalar> {
    row.get(column).map(Scalar::from_json).ok_or_else(|| {
        DbError::invalid_input(format!("Key column '{}' is not in the result set", column))
    })
}

//! Statement execution.
//!
//! Every statement goes through [`Database`]: named placeholders are bound,
//! the connection is resolved for the route, and the result is materialized.
//! Writes always run on the master. A failed statement rolls back an active
//! transaction before the error is returned; if the master connection itself
//! was lost, the transaction is abandoned instead.

use crate::db::driver::Connector;
use crate::db::params::bind_named;
use crate::db::pool::{Database, Route};
use crate::error::{DbError, DbResult};
use crate::models::{KeyedRows, NamedParams, Row, WriteOutcome};
use serde_json::Value as JsonValue;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{debug, warn};

impl<C: Connector> Database<C> {
    /// Execute a write on the master and return the affected row count.
    pub async fn write(&self, sql: &str, params: &NamedParams) -> DbResult<u64> {
        self.write_outcome(sql, params)
            .await
            .map(|outcome| outcome.rows_affected)
    }

    /// Execute a write on the master and return the full driver outcome.
    pub async fn write_outcome(&self, sql: &str, params: &NamedParams) -> DbResult<WriteOutcome> {
        let stmt = bind_named(sql, params)?;
        let start = Instant::now();

        let result = {
            let mut conn = self.resolve(Route::Master).await?;
            conn.execute(&stmt.sql, &stmt.params).await
        };

        match result {
            Ok(outcome) => {
                self.last_rows_affected
                    .store(outcome.rows_affected, Ordering::SeqCst);
                if outcome.last_insert_id != 0 {
                    self.last_insert_id
                        .store(outcome.last_insert_id, Ordering::SeqCst);
                }
                debug!(
                    database = %self.name,
                    sql = %stmt.sql,
                    rows_affected = outcome.rows_affected,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Write executed"
                );
                Ok(outcome)
            }
            Err(e) => {
                self.last_rows_affected.store(0, Ordering::SeqCst);
                Err(self.fail(e, &stmt.sql, Route::Master).await)
            }
        }
    }

    /// Execute a read and return every row.
    ///
    /// Reads go to a slave unless `from_master` is set.
    pub async fn read(
        &self,
        sql: &str,
        params: &NamedParams,
        from_master: bool,
    ) -> DbResult<Vec<Row>> {
        let stmt = bind_named(sql, params)?;
        let route = Route::for_read(from_master);
        let start = Instant::now();

        let result = {
            let mut conn = self.resolve(route).await?;
            conn.fetch(&stmt.sql, &stmt.params).await
        };

        match result {
            Ok(rows) => {
                debug!(
                    database = %self.name,
                    route = %route,
                    sql = %stmt.sql,
                    rows = rows.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Read executed"
                );
                Ok(rows)
            }
            Err(e) => Err(self.fail(e, &stmt.sql, route).await),
        }
    }

    /// Execute a read and index the rows by the value of `key`.
    ///
    /// Keys follow the result order. When two rows share a key the later row
    /// replaces the earlier one in its original position.
    pub async fn read_keyed(
        &self,
        sql: &str,
        params: &NamedParams,
        from_master: bool,
        key: &str,
    ) -> DbResult<KeyedRows> {
        let rows = self.read(sql, params, from_master).await?;
        index_rows(rows, key)
    }

    /// Execute a read and return its first row, if any.
    pub async fn one(
        &self,
        sql: &str,
        params: &NamedParams,
        from_master: bool,
    ) -> DbResult<Option<Row>> {
        let rows = self.read(sql, params, from_master).await?;
        Ok(rows.into_iter().next())
    }

    /// Rows affected by the most recent write; 0 after a failed one.
    pub fn affected_rows(&self) -> u64 {
        self.last_rows_affected.load(Ordering::SeqCst)
    }

    /// Identity generated by the most recent auto-increment insert on the master.
    pub fn insert_id(&self) -> u64 {
        self.last_insert_id.load(Ordering::SeqCst)
    }

    /// Log a failed statement and end an active transaction.
    async fn fail(&self, error: DbError, sql: &str, route: Route) -> DbError {
        warn!(
            database = %self.name,
            route = %route,
            sql = %sql,
            error = %error,
            "Statement failed"
        );
        if route == Route::Master && error.breaks_connection() {
            self.abandon_transaction();
        } else if error.triggers_rollback() {
            self.rollback_after_failure().await;
        }
        error
    }
}

/// Index rows by the rendered value of one column.
pub fn index_rows(rows: Vec<Row>, key: &str) -> DbResult<KeyedRows> {
    let mut keyed = KeyedRows::new();
    for row in rows {
        let rendered = row.get(key).map(render_key).ok_or_else(|| {
            DbError::invalid_input(format!("Key column '{}' is not in the result set", key))
        })?;
        keyed.insert(rendered, JsonValue::Object(row));
    }
    Ok(keyed)
}

fn render_key(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: JsonValue) -> Row {
        match value {
            JsonValue::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_index_rows_later_row_wins() {
        let rows = vec![
            row(json!({"email": "a@x", "id": 1})),
            row(json!({"email": "b@x", "id": 2})),
            row(json!({"email": "a@x", "id": 3})),
        ];
        let keyed = index_rows(rows, "email").unwrap();
        assert_eq!(keyed.len(), 2);
        assert_eq!(keyed["a@x"]["id"], json!(3));
        assert_eq!(keyed["b@x"]["id"], json!(2));
    }

    #[test]
    fn test_index_rows_keeps_result_order() {
        let rows = vec![
            row(json!({"name": "zed", "id": 10})),
            row(json!({"name": "amy", "id": 2})),
            row(json!({"name": "bob", "id": 7})),
            row(json!({"name": "amy", "id": 11})),
        ];
        let keyed = index_rows(rows.clone(), "name").unwrap();
        assert_eq!(keyed.keys().collect::<Vec<_>>(), vec!["zed", "amy", "bob"]);
        assert_eq!(keyed["amy"]["id"], json!(11));

        let by_id = index_rows(rows, "id").unwrap();
        assert_eq!(by_id.keys().collect::<Vec<_>>(), vec!["10", "2", "7", "11"]);
    }

    #[test]
    fn test_index_rows_numeric_keys() {
        let rows = vec![row(json!({"id": 7})), row(json!({"id": null}))];
        let keyed = index_rows(rows, "id").unwrap();
        assert!(keyed.contains_key("7"));
        assert!(keyed.contains_key(""));
    }

    #[test]
    fn test_index_rows_missing_key_column() {
        let rows = vec![row(json!({"id": 1}))];
        assert!(matches!(
            index_rows(rows, "email"),
            Err(DbError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_index_rows_empty() {
        assert!(index_rows(Vec::new(), "id").unwrap().is_empty());
    }
}

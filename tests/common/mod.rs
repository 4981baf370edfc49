//! Scripted in-memory connector shared by the integration tests.
//!
//! Every connect attempt and statement is recorded with the host it went to,
//! so tests can assert on routing as well as on SQL.

#![allow(dead_code)]

use dbroute::config::RouterOptions;
use dbroute::db::{BoundParam, Connection, Connector, DatabaseRegistry};
use dbroute::error::{DbError, DbResult};
use dbroute::models::{DatabaseCatalog, DatabaseSettings, Endpoint, Row, WriteOutcome};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DB_NAME: &str = "users_db";
pub const MASTER_HOST: &str = "master";

#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub host: String,
    pub sql: String,
    pub params: Vec<BoundParam>,
}

#[derive(Debug)]
struct FakeState {
    connect_attempts: Vec<String>,
    statements: Vec<Recorded>,
    refused_hosts: HashSet<String>,
    failing_sql: Vec<String>,
    timed_out_sql: Vec<String>,
    next_connection: usize,
    open_connections: Vec<(usize, String)>,
    dropped_connections: HashSet<usize>,
    responses: Vec<(String, Vec<Row>)>,
    rows_affected: u64,
    insert_id: u64,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            connect_attempts: Vec::new(),
            statements: Vec::new(),
            refused_hosts: HashSet::new(),
            failing_sql: Vec::new(),
            timed_out_sql: Vec::new(),
            next_connection: 0,
            open_connections: Vec::new(),
            dropped_connections: HashSet::new(),
            responses: Vec::new(),
            rows_affected: 1,
            insert_id: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<FakeState>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn refuse(&self, host: &str) {
        self.with_state(|s| s.refused_hosts.insert(host.to_string()));
    }

    pub fn accept(&self, host: &str) {
        self.with_state(|s| s.refused_hosts.remove(host));
    }

    /// Statements containing `pattern` fail with a SQL error.
    pub fn fail_statements(&self, pattern: &str) {
        self.with_state(|s| s.failing_sql.push(pattern.to_string()));
    }

    /// Statements containing `pattern` time out and leave their connection unusable.
    pub fn time_out_statements(&self, pattern: &str) {
        self.with_state(|s| s.timed_out_sql.push(pattern.to_string()));
    }

    pub fn clear_failures(&self) {
        self.with_state(|s| {
            s.failing_sql.clear();
            s.timed_out_sql.clear();
        });
    }

    /// Sever every connection currently open to `host`, as a server restart would.
    /// Connections opened afterwards work again.
    pub fn drop_connections(&self, host: &str) {
        self.with_state(|s| {
            let ids: Vec<usize> = s
                .open_connections
                .iter()
                .filter(|(_, h)| h == host)
                .map(|(id, _)| *id)
                .collect();
            s.dropped_connections.extend(ids);
        });
    }

    /// Reads containing `pattern` return `rows`; the latest registration wins.
    pub fn respond(&self, pattern: &str, rows: Vec<Row>) {
        self.with_state(|s| s.responses.insert(0, (pattern.to_string(), rows)));
    }

    pub fn set_rows_affected(&self, rows: u64) {
        self.with_state(|s| s.rows_affected = rows);
    }

    pub fn set_insert_id(&self, id: u64) {
        self.with_state(|s| s.insert_id = id);
    }

    pub fn connect_attempts(&self) -> Vec<String> {
        self.with_state(|s| s.connect_attempts.clone())
    }

    pub fn statements(&self) -> Vec<Recorded> {
        self.with_state(|s| s.statements.clone())
    }

    pub fn sql_log(&self) -> Vec<String> {
        self.statements().into_iter().map(|r| r.sql).collect()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.statements().into_iter().map(|r| r.host).collect()
    }

    pub fn count_sql(&self, sql: &str) -> usize {
        self.sql_log().iter().filter(|s| *s == sql).count()
    }
}

impl Connector for FakeConnector {
    type Connection = FakeConnection;

    async fn connect(&self, endpoint: &Endpoint, _timeout: Duration) -> DbResult<FakeConnection> {
        let (refused, id) = self.with_state(|s| {
            s.connect_attempts.push(endpoint.host.clone());
            let id = s.next_connection;
            s.next_connection += 1;
            (s.refused_hosts.contains(&endpoint.host), id)
        });
        if refused {
            return Err(DbError::connection(
                format!("Failed to connect to {}: connection refused", endpoint.address()),
                "Check that the MySQL server is running and accessible",
            ));
        }
        self.with_state(|s| s.open_connections.push((id, endpoint.host.clone())));
        Ok(FakeConnection {
            id,
            host: endpoint.host.clone(),
            state: Arc::clone(&self.state),
        })
    }
}

pub struct FakeConnection {
    id: usize,
    host: String,
    state: Arc<Mutex<FakeState>>,
}

impl FakeConnection {
    fn record(&self, sql: &str, params: &[BoundParam]) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        // Nothing reaches the server on a severed connection
        if state.dropped_connections.contains(&self.id) {
            return Err(DbError::connection(
                "I/O error: broken pipe",
                "Check that the MySQL server is running and accessible",
            ));
        }
        state.statements.push(Recorded {
            host: self.host.clone(),
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        if state.timed_out_sql.iter().any(|p| sql.contains(p.as_str())) {
            state.dropped_connections.insert(self.id);
            return Err(DbError::timeout(format!("statement on {}", self.host), 30));
        }
        if state.failing_sql.iter().any(|p| sql.contains(p.as_str())) {
            return Err(DbError::statement(
                "You have an error in your SQL syntax",
                Some("42000".to_string()),
                "Check the SQL syntax and referenced objects",
            ));
        }
        Ok(())
    }
}

impl Connection for FakeConnection {
    async fn execute(&mut self, sql: &str, params: &[BoundParam]) -> DbResult<WriteOutcome> {
        self.record(sql, params)?;
        let state = self.state.lock().unwrap();
        Ok(WriteOutcome {
            rows_affected: state.rows_affected,
            last_insert_id: state.insert_id,
        })
    }

    async fn fetch(&mut self, sql: &str, params: &[BoundParam]) -> DbResult<Vec<Row>> {
        self.record(sql, params)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .responses
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }
}

pub fn endpoint(host: &str) -> Endpoint {
    Endpoint::new(host, "users", "app", "secret", 3306)
}

/// Catalog with `users_db` on host `master` and slaves `slave0..slaveN`.
pub fn catalog(slaves: usize) -> DatabaseCatalog {
    let slaves = (0..slaves).map(|i| endpoint(&format!("slave{i}"))).collect();
    DatabaseCatalog::new().with_database(DB_NAME, DatabaseSettings::new(endpoint(MASTER_HOST), slaves))
}

pub fn registry(
    connector: &FakeConnector,
    slaves: usize,
    options: RouterOptions,
) -> Arc<DatabaseRegistry<FakeConnector>> {
    Arc::new(DatabaseRegistry::new(catalog(slaves), connector.clone(), options))
}

/// Build a row from a JSON object literal.
pub fn row(value: JsonValue) -> Row {
    match value {
        JsonValue::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

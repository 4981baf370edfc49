//! MySQL implementation of the driver seam over `sqlx::MySqlConnection`.

use crate::db::driver::{Connection, Connector};
use crate::db::params::{BoundParam, bind_mysql_param};
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{Endpoint, Row, WriteOutcome};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{Connection as _, Executor};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Session character set applied on connect (a UTF-8 superset of `utf8`).
pub const SESSION_CHARSET: &str = "utf8mb4";

/// Opens one `MySqlConnection` per endpoint.
///
/// The connect timeout is applied by the router around [`Connector::connect`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlConnector;

impl MySqlConnector {
    fn connect_options(endpoint: &Endpoint) -> MySqlConnectOptions {
        let mut options = MySqlConnectOptions::new()
            .host(&endpoint.host)
            .port(endpoint.port)
            .username(&endpoint.user)
            .charset(SESSION_CHARSET);
        if !endpoint.pass.is_empty() {
            options = options.password(&endpoint.pass);
        }
        if !endpoint.db.is_empty() {
            options = options.database(&endpoint.db);
        }
        options
    }
}

impl Connector for MySqlConnector {
    type Connection = MySqlLink;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        statement_timeout: Duration,
    ) -> DbResult<MySqlLink> {
        let options = Self::connect_options(endpoint);

        debug!(endpoint = %endpoint.address(), "Opening MySQL connection");
        let conn = MySqlConnection::connect_with(&options)
            .await
            .map_err(|e| {
                DbError::connection(
                    format!("Failed to connect to {}: {}", endpoint.address(), e),
                    connection_suggestion(&e),
                )
            })?;

        info!(endpoint = %endpoint.address(), "Connected");
        Ok(MySqlLink {
            conn,
            statement_timeout,
        })
    }
}

/// A live MySQL connection.
#[derive(Debug)]
pub struct MySqlLink {
    conn: MySqlConnection,
    statement_timeout: Duration,
}

impl Connection for MySqlLink {
    async fn execute(&mut self, sql: &str, params: &[BoundParam]) -> DbResult<WriteOutcome> {
        // Without params run the plain text protocol: transaction control and
        // some DDL cannot be prepared
        let result = if params.is_empty() {
            timeout(self.statement_timeout, (&mut self.conn).execute(sql)).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_mysql_param(query, param);
            }
            timeout(self.statement_timeout, query.execute(&mut self.conn)).await
        };

        match result {
            Ok(Ok(r)) => Ok(WriteOutcome {
                rows_affected: r.rows_affected(),
                last_insert_id: r.last_insert_id(),
            }),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("write operation", self.statement_timeout)),
        }
    }

    async fn fetch(&mut self, sql: &str, params: &[BoundParam]) -> DbResult<Vec<Row>> {
        let result = if params.is_empty() {
            timeout(self.statement_timeout, (&mut self.conn).fetch_all(sql)).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_mysql_param(query, param);
            }
            timeout(self.statement_timeout, query.fetch_all(&mut self.conn)).await
        };

        match result {
            Ok(Ok(rows)) => Ok(rows.iter().map(RowToJson::to_row).collect()),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("query execution", self.statement_timeout)),
        }
    }
}

fn timeout_error(operation: &str, timeout: Duration) -> DbError {
    DbError::timeout(operation, timeout.as_secs())
}

/// Generate a helpful suggestion for connection errors.
fn connection_suggestion(error: &sqlx::Error) -> String {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") {
        return "Check that the MySQL server is running and accessible".to_string();
    }

    if error_str.contains("access denied") || error_str.contains("password") {
        return "Verify USER and PASS for this endpoint".to_string();
    }

    if error_str.contains("unknown database") {
        return "Check that the DB named for this endpoint exists".to_string();
    }

    if error_str.contains("tls") || error_str.contains("ssl") {
        return "Check TLS/SSL configuration or try disabling it".to_string();
    }

    "Verify HOST and PORT for this endpoint".to_string()
}

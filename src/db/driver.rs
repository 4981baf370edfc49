//! Driver seam between the router and a physical connection.
//!
//! The router never talks to sqlx directly: it asks a [`Connector`] for a
//! [`Connection`] bound to one endpoint and runs positional statements on it.
//! [`crate::db::mysql::MySqlConnector`] is the production implementation.

use crate::db::params::BoundParam;
use crate::error::DbResult;
use crate::models::{Endpoint, Row, WriteOutcome};
use std::future::Future;
use std::time::Duration;

/// A live connection to one endpoint.
///
/// SQL passed here already uses positional `?` placeholders, one per entry of
/// `params`. An empty `params` slice runs the text through the plain query
/// protocol.
pub trait Connection: Send + 'static {
    /// Execute a statement that returns no rows.
    fn execute(
        &mut self,
        sql: &str,
        params: &[BoundParam],
    ) -> impl Future<Output = DbResult<WriteOutcome>> + Send;

    /// Execute a statement and materialize every row.
    fn fetch(
        &mut self,
        sql: &str,
        params: &[BoundParam],
    ) -> impl Future<Output = DbResult<Vec<Row>>> + Send;
}

/// Factory of connections.
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    /// Open a connection to `endpoint` with the session charset set to UTF-8.
    ///
    /// `statement_timeout` bounds every statement later run on the connection.
    fn connect(
        &self,
        endpoint: &Endpoint,
        statement_timeout: Duration,
    ) -> impl Future<Output = DbResult<Self::Connection>> + Send;
}

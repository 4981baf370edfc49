//! Connection routing.
//!
//! A [`DatabaseRegistry`] owns one [`Database`] handle per logical database
//! name. Each handle keeps at most one live master connection and lazily
//! opened slave connections, and hands them out through [`Database::resolve`].
//!
//! Every slot is guarded by a `tokio::sync::Mutex`, so a handle can be shared
//! between tasks; statements on the same slot run one at a time.
//!
//! A connection that fails with a connection or timeout error is marked
//! broken and replaced on the next resolve of its slot.

use crate::config::{RouterOptions, SlavePolicy};
use crate::db::driver::{Connection, Connector};
use crate::db::mysql::MySqlConnector;
use crate::db::params::BoundParam;
use crate::error::{DbError, DbResult};
use crate::models::{ConfigSource, DatabaseSettings, Endpoint, Row, WriteOutcome};
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Which side of the replication pair an operation is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// Writes, transaction control and explicitly flagged reads
    Master,
    /// Default for reads
    Slave,
}

impl Route {
    /// Route for a read, honoring an explicit request for the master.
    pub fn for_read(from_master: bool) -> Self {
        if from_master { Self::Master } else { Self::Slave }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Slave => write!(f, "slave"),
        }
    }
}

/// A live connection handed out by [`Database::resolve`].
///
/// The slot stays locked while the guard is alive. Statements run through
/// [`ConnectionGuard::execute`] and [`ConnectionGuard::fetch`] mark the
/// connection broken when it is lost or times out mid-statement.
pub struct ConnectionGuard<'a, T> {
    conn: MappedMutexGuard<'a, T>,
    broken: &'a AtomicBool,
}

impl<T: Connection> ConnectionGuard<'_, T> {
    pub async fn execute(&mut self, sql: &str, params: &[BoundParam]) -> DbResult<WriteOutcome> {
        let result = self.conn.execute(sql, params).await;
        self.check(&result);
        result
    }

    pub async fn fetch(&mut self, sql: &str, params: &[BoundParam]) -> DbResult<Vec<Row>> {
        let result = self.conn.fetch(sql, params).await;
        self.check(&result);
        result
    }

    /// Mark the connection for replacement on the next resolve of its slot.
    pub fn discard(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    fn check<R>(&self, result: &DbResult<R>) {
        if matches!(result, Err(e) if e.breaks_connection()) {
            self.discard();
        }
    }
}

impl<T> Deref for ConnectionGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.conn
    }
}

impl<T> DerefMut for ConnectionGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.conn
    }
}

/// One cacheable connection bound to a fixed endpoint.
struct Slot<T> {
    endpoint: Endpoint,
    connection: Mutex<Option<T>>,
    /// Set while the cached connection is known to be unusable
    broken: AtomicBool,
}

impl<T> Slot<T> {
    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            connection: Mutex::new(None),
            broken: AtomicBool::new(false),
        }
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    async fn is_live(&self) -> bool {
        let conn = self.connection.lock().await;
        conn.is_some() && !self.is_broken()
    }

    /// Drop the cached connection if it was marked broken.
    fn evict_broken(&self, conn: &mut Option<T>) -> bool {
        self.broken.swap(false, Ordering::SeqCst) && conn.take().is_some()
    }
}

/// Routing handle for one logical database.
pub struct Database<C: Connector> {
    pub(crate) name: String,
    pub(crate) options: RouterOptions,
    connector: Arc<C>,
    master: Slot<C::Connection>,
    slaves: Vec<Slot<C::Connection>>,
    /// Index of the slave picked under [`SlavePolicy::Sticky`]
    sticky_slave: Mutex<Option<usize>>,
    pub(crate) in_transaction: AtomicBool,
    pub(crate) last_rows_affected: AtomicU64,
    pub(crate) last_insert_id: AtomicU64,
}

impl<C: Connector> fmt::Debug for Database<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("master", &self.master.endpoint.address())
            .field("slaves", &self.slaves.len())
            .field("slave_policy", &self.options.slave_policy)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Database<C> {
    /// Create a handle; no connection is opened until first use.
    pub fn new(
        name: impl Into<String>,
        settings: DatabaseSettings,
        connector: Arc<C>,
        options: RouterOptions,
    ) -> Self {
        Self {
            name: name.into(),
            options,
            connector,
            master: Slot::new(settings.master),
            slaves: settings.slaves.into_iter().map(Slot::new).collect(),
            sticky_slave: Mutex::new(None),
            in_transaction: AtomicBool::new(false),
            last_rows_affected: AtomicU64::new(0),
            last_insert_id: AtomicU64::new(0),
        }
    }

    /// Logical database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &RouterOptions {
        &self.options
    }

    pub fn master_endpoint(&self) -> &Endpoint {
        &self.master.endpoint
    }

    pub fn slave_endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.slaves.iter().map(|s| &s.endpoint)
    }

    /// Endpoint of the sticky slave, once one has been picked.
    pub async fn slave_endpoint(&self) -> Option<&Endpoint> {
        let sticky = *self.sticky_slave.lock().await;
        sticky.map(|idx| &self.slaves[idx].endpoint)
    }

    /// Whether a live connection is cached for the route.
    pub async fn is_connected(&self, route: Route) -> bool {
        match route {
            Route::Master => self.master.is_live().await,
            Route::Slave => {
                for slot in &self.slaves {
                    if slot.is_live().await {
                        return true;
                    }
                }
                false
            }
        }
    }

    /// Return the live connection for `route`, opening it if absent.
    ///
    /// MASTER always yields the single master connection. SLAVE follows the
    /// configured [`SlavePolicy`]. A failed connect is not cached: the next
    /// resolve of the same slot tries again. A connection marked broken is
    /// dropped and reopened.
    pub async fn resolve(&self, route: Route) -> DbResult<ConnectionGuard<'_, C::Connection>> {
        match route {
            Route::Master => self.acquire(&self.master, route).await,
            Route::Slave => self.resolve_slave().await,
        }
    }

    async fn resolve_slave(&self) -> DbResult<ConnectionGuard<'_, C::Connection>> {
        if self.slaves.is_empty() {
            return Err(DbError::configuration_missing(
                &self.name,
                "No SLAVES configured; add at least one slave or read from the master",
            ));
        }

        match self.options.slave_policy {
            SlavePolicy::Sticky => {
                let mut sticky = self.sticky_slave.lock().await;
                if let Some(idx) = *sticky {
                    let slot = &self.slaves[idx];
                    if !slot.is_broken() {
                        return self.acquire(slot, Route::Slave).await;
                    }
                    // Lost sticky slave: forget it and pick again
                    if slot.evict_broken(&mut *slot.connection.lock().await) {
                        info!(
                            database = %self.name,
                            endpoint = %slot.endpoint.address(),
                            "Broken sticky slave connection dropped"
                        );
                    }
                    *sticky = None;
                }

                let idx = pick_index(self.slaves.len());
                let guard = self.acquire(&self.slaves[idx], Route::Slave).await?;
                *sticky = Some(idx);
                debug!(
                    database = %self.name,
                    endpoint = %self.slaves[idx].endpoint.address(),
                    "Sticky slave selected"
                );
                Ok(guard)
            }
            SlavePolicy::PerCall => {
                let idx = pick_index(self.slaves.len());
                self.acquire(&self.slaves[idx], Route::Slave).await
            }
        }
    }

    async fn acquire<'a>(
        &'a self,
        slot: &'a Slot<C::Connection>,
        route: Route,
    ) -> DbResult<ConnectionGuard<'a, C::Connection>> {
        let mut guard = slot.connection.lock().await;

        if slot.evict_broken(&mut guard) {
            info!(
                database = %self.name,
                route = %route,
                endpoint = %slot.endpoint.address(),
                "Broken connection dropped, reconnecting"
            );
        }

        if guard.is_none() {
            let connect = self
                .connector
                .connect(&slot.endpoint, self.options.statement_timeout);
            let result = match timeout(self.options.connect_timeout, connect).await {
                Ok(result) => result,
                Err(_) => Err(DbError::timeout(
                    format!("connect to {}", slot.endpoint.address()),
                    self.options.connect_timeout.as_secs(),
                )),
            };

            match result {
                Ok(conn) => {
                    info!(
                        database = %self.name,
                        route = %route,
                        endpoint = %slot.endpoint.address(),
                        "Connection opened"
                    );
                    *guard = Some(conn);
                }
                Err(e) => {
                    warn!(
                        database = %self.name,
                        route = %route,
                        endpoint = %slot.endpoint.address(),
                        error = %e,
                        "Connection failed"
                    );
                    return Err(e);
                }
            }
        }

        let conn = MutexGuard::try_map(guard, Option::as_mut)
            .map_err(|_| DbError::internal("Connection slot empty after connect"))?;
        Ok(ConnectionGuard {
            conn,
            broken: &slot.broken,
        })
    }

    /// Drop every cached connection and forget the sticky slave.
    pub async fn close(&self) {
        for slot in std::iter::once(&self.master).chain(&self.slaves) {
            slot.connection.lock().await.take();
            slot.broken.store(false, Ordering::SeqCst);
        }
        self.sticky_slave.lock().await.take();
        info!(database = %self.name, "Connections closed");
    }
}

fn pick_index(len: usize) -> usize {
    rand::thread_rng().gen_range(0..len)
}

/// Registry of logical databases, one [`Database`] handle per name.
///
/// Created once at startup and shared by reference (usually in an `Arc`) with
/// every data-access call site.
pub struct DatabaseRegistry<C: Connector = MySqlConnector> {
    source: Arc<dyn ConfigSource>,
    connector: Arc<C>,
    options: RouterOptions,
    databases: RwLock<HashMap<String, Arc<Database<C>>>>,
}

impl<C: Connector> fmt::Debug for DatabaseRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseRegistry")
            .field("options", &self.options)
            .field("configured", &self.source.names())
            .finish_non_exhaustive()
    }
}

impl DatabaseRegistry<MySqlConnector> {
    /// Registry backed by real MySQL connections.
    pub fn mysql(source: impl ConfigSource + 'static, options: RouterOptions) -> Self {
        Self::new(source, MySqlConnector, options)
    }
}

impl<C: Connector> DatabaseRegistry<C> {
    pub fn new(source: impl ConfigSource + 'static, connector: C, options: RouterOptions) -> Self {
        Self {
            source: Arc::new(source),
            connector: Arc::new(connector),
            options,
            databases: RwLock::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &RouterOptions {
        &self.options
    }

    /// All configured logical database names.
    pub fn names(&self) -> Vec<String> {
        self.source.names()
    }

    /// Get the handle for a logical database, creating it on first use.
    ///
    /// Repeated calls return the same instance.
    pub async fn get(&self, name: &str) -> DbResult<Arc<Database<C>>> {
        if name.is_empty() {
            return Err(DbError::invalid_input("Logical database name cannot be empty"));
        }

        {
            let databases = self.databases.read().await;
            if let Some(db) = databases.get(name) {
                return Ok(Arc::clone(db));
            }
        }

        let settings = self.source.settings(name).ok_or_else(|| {
            DbError::configuration_missing(
                name,
                format!(
                    "Configured databases: [{}]",
                    self.source.names().join(", ")
                ),
            )
        })?;

        // Another task may have created it while the read lock was released
        let mut databases = self.databases.write().await;
        let db = databases.entry(name.to_string()).or_insert_with(|| {
            info!(
                database = %name,
                master = %settings.master.address(),
                slaves = settings.slaves.len(),
                "Registered logical database"
            );
            Arc::new(Database::new(
                name,
                settings,
                Arc::clone(&self.connector),
                self.options.clone(),
            ))
        });
        Ok(Arc::clone(db))
    }

    /// Number of databases with a live handle.
    pub async fn database_count(&self) -> usize {
        self.databases.read().await.len()
    }

    /// Close every database and drop the handles.
    pub async fn close_all(&self) {
        let mut databases = self.databases.write().await;
        for (_, db) in databases.drain() {
            db.close().await;
        }
        info!("All databases closed");
    }
}

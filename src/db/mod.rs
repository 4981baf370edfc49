//! Database access layer.
//!
//! This module provides:
//! - Connection routing across one master and its slaves
//! - Statement execution with named parameter binding
//! - Transaction control on the master
//! - SQL assembly for abstract queries
//! - Record persistence by primary key
//! - The MySQL driver and its column decoding

pub mod assembler;
pub mod driver;
pub mod executor;
pub mod mysql;
pub mod params;
pub mod persistence;
pub mod pool;
pub mod transaction;
pub mod types;

pub use assembler::{QueryAssembler, Statement};
pub use driver::{Connection, Connector};
pub use executor::index_rows;
pub use mysql::{MySqlConnector, MySqlLink};
pub use params::{BoundParam, INT_BIND_PREFIX, PositionalStatement, bind_named};
pub use persistence::{RecordStore, SaveAction};
pub use pool::{ConnectionGuard, Database, DatabaseRegistry, Route};

//! dbroute
//!
//! A MySQL data-access layer: master/slave connection routing, parameterized
//! statement execution, transaction control, SQL assembly for abstract
//! queries and record persistence by primary key.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{Config, RouterOptions, SlavePolicy};
pub use db::{Database, DatabaseRegistry, QueryAssembler, RecordStore, Route};
pub use error::{DbError, DbResult};

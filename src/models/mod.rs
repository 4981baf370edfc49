//! Data models for dbroute.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod schema;

// Re-export commonly used types
pub use connection::{
    ConfigError, ConfigSource, DEFAULT_MYSQL_PORT, DatabaseCatalog, DatabaseSettings, Endpoint,
    TransactionState,
};
pub use query::{
    DeltaOp, FieldMap, FieldValue, KeyedRows, NamedParams, Row, Scalar, WriteOutcome,
};
pub use schema::{
    Identity, ModelMeta, PRIMARY_KEY_SEPARATOR, PrimaryKey, QueryParts, QuerySource, RawQuery,
    validate_identifier,
};

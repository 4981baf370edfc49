//! Configuration handling for dbroute.
//!
//! Router options (timeouts, slave selection, transaction strictness) plus the
//! CLI arguments and environment variables of the `dbroute` binary.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_STATEMENT_TIMEOUT_SECS: u64 = 30;

/// How a SLAVE route picks its replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SlavePolicy {
    /// Pick one slave at random on first use and keep it for the lifetime of
    /// the database handle.
    #[default]
    Sticky,
    /// Pick a slave at random on every SLAVE resolve.
    PerCall,
}

impl std::fmt::Display for SlavePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sticky => write!(f, "sticky"),
            Self::PerCall => write!(f, "per-call"),
        }
    }
}

/// Options shared by every logical database of a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterOptions {
    pub connect_timeout: Duration,
    pub statement_timeout: Duration,
    pub slave_policy: SlavePolicy,
    /// Reject `begin` while a transaction is already active (default: true).
    /// When false a nested `begin` only keeps the state ACTIVE.
    pub strict_transactions: bool,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            statement_timeout: Duration::from_secs(DEFAULT_STATEMENT_TIMEOUT_SECS),
            slave_policy: SlavePolicy::Sticky,
            strict_transactions: true,
        }
    }
}

impl RouterOptions {
    pub fn with_slave_policy(mut self, policy: SlavePolicy) -> Self {
        self.slave_policy = policy;
        self
    }

    pub fn with_strict_transactions(mut self, strict: bool) -> Self {
        self.strict_transactions = strict;
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, statement: Duration) -> Self {
        self.connect_timeout = connect;
        self.statement_timeout = statement;
        self
    }

    /// Validate options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.connect_timeout.is_zero() {
            return Err("connect timeout must be greater than 0".to_string());
        }
        if self.statement_timeout.is_zero() {
            return Err("statement timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Command-line interface of the `dbroute` binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "dbroute",
    about = "Route reads and writes across a MySQL master and its slaves",
    version,
    author
)]
pub struct Config {
    /// JSON file mapping logical database names to MASTER/SLAVES endpoints
    #[arg(short, long, value_name = "PATH", env = "DBROUTE_CONFIG")]
    pub config: PathBuf,

    /// Connection timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS,
        env = "DBROUTE_CONNECT_TIMEOUT"
    )]
    pub connect_timeout: u64,

    /// Statement timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_STATEMENT_TIMEOUT_SECS,
        env = "DBROUTE_STATEMENT_TIMEOUT"
    )]
    pub statement_timeout: u64,

    /// Slave selection policy
    #[arg(long, value_enum, default_value = "sticky", env = "DBROUTE_SLAVE_POLICY")]
    pub slave_policy: SlavePolicy,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "DBROUTE_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "DBROUTE_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Resolve MASTER and SLAVE of each database and run `SELECT 1`
    Check {
        /// Logical databases to check (default: all configured)
        names: Vec<String>,
    },
    /// Run a read statement and print the rows as JSON
    Query {
        database: String,
        sql: String,
        /// Read from the master instead of a slave
        #[arg(long)]
        master: bool,
        /// Key the result by this column (later rows overwrite earlier ones)
        #[arg(long, value_name = "COLUMN")]
        key: Option<String>,
        /// Bind parameter as name=value; names starting with '_' bind as integers
        #[arg(short, long = "param", value_name = "NAME=VALUE", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Run a write statement on the master and print the affected row count
    Execute {
        database: String,
        sql: String,
        /// Bind parameter as name=value; names starting with '_' bind as integers
        #[arg(short, long = "param", value_name = "NAME=VALUE", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
}

impl Config {
    /// Router options derived from the command line.
    pub fn router_options(&self) -> RouterOptions {
        RouterOptions::default()
            .with_timeouts(
                Duration::from_secs(self.connect_timeout),
                Duration::from_secs(self.statement_timeout),
            )
            .with_slave_policy(self.slave_policy)
    }
}

/// Parse a `name=value` bind parameter.
fn parse_param(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{s}'"))?;
    let name = name.trim().trim_start_matches(':');
    if name.is_empty() {
        return Err(format!("empty parameter name in '{s}'"));
    }
    Ok((name.to_string(), value.to_string()))
}

//! dbroute - command line entry point.
//!
//! Loads a catalog of logical databases and checks connectivity or runs a
//! single statement through the router.

use clap::Parser;
use dbroute::config::{Command, Config};
use dbroute::db::{DatabaseRegistry, Route};
use dbroute::models::{DatabaseCatalog, NamedParams};
use serde_json::Value as JsonValue;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn to_params(pairs: &[(String, String)]) -> NamedParams {
    pairs
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Check both routes of each database; returns whether all succeeded.
async fn check(registry: &DatabaseRegistry, names: Vec<String>) -> bool {
    let names = if names.is_empty() {
        registry.names()
    } else {
        names
    };

    let mut healthy = true;
    for name in names {
        let db = match registry.get(&name).await {
            Ok(db) => db,
            Err(e) => {
                println!("{name}: {e}");
                healthy = false;
                continue;
            }
        };

        for route in [Route::Master, Route::Slave] {
            if route == Route::Slave && db.slave_endpoints().next().is_none() {
                println!("{name} {route}: skipped (no slaves configured)");
                continue;
            }
            match db
                .read("SELECT 1", &NamedParams::new(), route == Route::Master)
                .await
            {
                Ok(_) => println!("{name} {route}: ok"),
                Err(e) => {
                    println!("{name} {route}: {e}");
                    healthy = false;
                }
            }
        }
    }
    healthy
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(&config);

    let options = config.router_options();
    options.validate()?;

    let catalog = DatabaseCatalog::from_file(&config.config)?;
    info!(
        databases = catalog.len(),
        path = %config.config.display(),
        "Loaded database catalog"
    );

    let registry = DatabaseRegistry::mysql(catalog, options);

    let result: Result<(), Box<dyn std::error::Error>> = match config.command {
        Command::Check { names } => {
            if check(&registry, names).await {
                Ok(())
            } else {
                Err("one or more databases failed the check".into())
            }
        }
        Command::Query {
            database,
            sql,
            master,
            key,
            params,
        } => {
            let db = registry.get(&database).await?;
            let params = to_params(&params);
            let output = match key {
                Some(key) => {
                    JsonValue::Object(db.read_keyed(&sql, &params, master, &key).await?)
                }
                None => JsonValue::Array(
                    db.read(&sql, &params, master)
                        .await?
                        .into_iter()
                        .map(JsonValue::Object)
                        .collect(),
                ),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Command::Execute {
            database,
            sql,
            params,
        } => {
            let db = registry.get(&database).await?;
            let affected = db.write(&sql, &to_params(&params)).await?;
            println!("{affected}");
            Ok(())
        }
    };

    registry.close_all().await;

    if let Err(e) = &result {
        error!(error = %e, "Command failed");
    }
    result
}

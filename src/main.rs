//! rowlink - Main entry point.
//!
//! Runs one ad-hoc query through the mapper and prints the materialized
//! entities as JSON on stdout.

use clap::Parser;
use rowlink::config::Config;
use rowlink::db::SqlxDriver;
use rowlink::mapping::{EntityRegistry, EntityType};
use rowlink::models::{Args, QueryDef};
use rowlink::Mapper;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const OPERATION: &str = "run";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr so stdout carries only the JSON result.
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
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(&config);

    let connection = config.connection_config()?;
    info!(
        target_db = %connection.masked_connection_string(),
        entity_type = %config.entity,
        "Starting rowlink v{}",
        env!("CARGO_PKG_VERSION")
    );

    let registry = EntityRegistry::builder()
        .register(EntityType::new(config.entity.as_str()))
        .build()?;
    let mapper = Mapper::new(
        SqlxDriver::new(),
        registry,
        connection,
        config.mapper_options(),
    );

    let sql = config.sql.clone();
    let mut query = QueryDef::new(OPERATION, move |_: &Args, _| sql.clone());
    if config.one {
        query = query.one_result();
    }
    mapper.define_query(&config.entity, query).await?;

    let result = mapper.call(&config.entity, OPERATION, Args::new()).await;
    if let Err(e) = mapper.disconnect().await {
        error!(error = %e, "Failed to close the connection");
    }

    let result = match result {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Query failed");
            if let Some(suggestion) = e.suggestion() {
                eprintln!("Hint: {}", suggestion);
            }
            return Err(e.into());
        }
    };

    let rendered = if config.pretty {
        serde_json::to_string_pretty(&result)?
    } else {
        serde_json::to_string(&result)?
    };
    println!("{}", rendered);
    Ok(())
}

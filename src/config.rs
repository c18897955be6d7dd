//! Configuration handling for rowlink.
//!
//! [`MapperOptions`] tunes a [`Mapper`](crate::mapping::Mapper); [`Config`]
//! is the command line of the `rowlink` binary, with environment fallbacks.

use crate::models::{ConnectionConfig, ConnectionConfigError};
use clap::Parser;
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_ENTITY_TYPE: &str = "Row";

/// Limits applied by a mapper to every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapperOptions {
    /// Upper bound for one connect attempt; `None` waits indefinitely
    pub connect_timeout: Option<Duration>,
    /// Upper bound for one operation call, connection included
    pub operation_timeout: Option<Duration>,
}

impl MapperOptions {
    /// Options without any time limits.
    pub fn unbounded() -> Self {
        Self {
            connect_timeout: None,
            operation_timeout: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }
}

impl Default for MapperOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)),
            operation_timeout: Some(Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECS)),
        }
    }
}

/// Command line of the `rowlink` binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "rowlink",
    about = "Run a query through the rowlink mapper and print the entities as JSON",
    version,
    author
)]
pub struct Config {
    /// Database connection URL (mysql://... or sqlite:...)
    #[arg(short = 'd', long = "database", value_name = "URL", env = "ROWLINK_DATABASE")]
    pub database: String,

    /// SQL text to run
    #[arg(value_name = "SQL")]
    pub sql: String,

    /// Entity type name the rows are materialized as
    #[arg(long, default_value = DEFAULT_ENTITY_TYPE, env = "ROWLINK_ENTITY")]
    pub entity: String,

    /// Return only the first row; no rows is an error
    #[arg(long)]
    pub one: bool,

    /// Connection timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS,
        env = "ROWLINK_CONNECT_TIMEOUT"
    )]
    pub connect_timeout: u64,

    /// Operation timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_OPERATION_TIMEOUT_SECS,
        env = "ROWLINK_OPERATION_TIMEOUT"
    )]
    pub operation_timeout: u64,

    /// Pretty-print the JSON output
    #[arg(long)]
    pub pretty: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "ROWLINK_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "ROWLINK_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the connection timeout as a Duration.
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Get the operation timeout as a Duration.
    pub fn operation_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.operation_timeout)
    }

    pub fn mapper_options(&self) -> MapperOptions {
        MapperOptions::unbounded()
            .with_connect_timeout(self.connect_timeout_duration())
            .with_operation_timeout(self.operation_timeout_duration())
    }

    pub fn connection_config(&self) -> Result<ConnectionConfig, ConnectionConfigError> {
        Ok(ConnectionConfig::parse(&self.database)?
            .with_connect_timeout(self.connect_timeout_duration()))
    }
}

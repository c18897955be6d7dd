//! Connection configuration and state.
//!
//! Defines the connection configuration handed to a driver and
//! the observable states of the single managed connection.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Database families the sqlx driver can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// MySQL and MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Detect the backend from the URL scheme.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }

    /// Whether `CALL` of stored routines is available.
    pub fn supports_procedures(&self) -> bool {
        matches!(self, Self::MySQL)
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Configuration for the managed database connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// May carry a password; log [`masked_connection_string`](Self::masked_connection_string) instead
    #[serde(skip_serializing)]
    pub connection_string: String,
    /// `None` when the scheme is not one the sqlx driver knows; other drivers
    /// may still accept the URL.
    pub db_type: Option<DatabaseType>,
    /// Upper bound for a single connect attempt
    #[serde(default)]
    pub connect_timeout: Option<Duration>,
}

impl ConnectionConfig {
    /// Parse a connection configuration from a URL.
    pub fn parse(connection_string: impl Into<String>) -> Result<Self, ConnectionConfigError> {
        let connection_string = connection_string.into();
        if connection_string.trim().is_empty() {
            return Err(ConnectionConfigError::Empty);
        }
        Url::parse(&connection_string)
            .map_err(|e| ConnectionConfigError::InvalidUrl(e.to_string()))?;

        Ok(Self {
            db_type: DatabaseType::from_connection_string(&connection_string),
            connection_string,
            connect_timeout: None,
        })
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// The connection URL with any password replaced by `****`.
    pub fn masked_connection_string(&self) -> String {
        match Url::parse(&self.connection_string) {
            Ok(mut url) if url.password().is_some() => {
                let _ = url.set_password(Some("****"));
                url.to_string()
            }
            _ => self.connection_string.clone(),
        }
    }
}

/// Rejected connection URL.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionConfigError {
    #[error("Connection string cannot be empty")]
    Empty,

    #[error("Invalid connection URL: {0}")]
    InvalidUrl(String),
}

/// Observable state of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

//! The database client boundary.
//!
//! The mapping layer never talks to a database directly. Everything that
//! performs I/O goes through a [`Driver`], which owns the wire protocol and
//! hands back raw row sets.

use crate::db::params::BoundRequest;
use crate::models::{ConnectionConfig, ParamSpec, Row, RowSet};
use async_trait::async_trait;
use thiserror::Error;

/// Broad classification of a driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Establishing the connection failed
    Connect,
    /// The server rejected statement text while preparing it
    Prepare,
    /// A bound value did not fit its declared parameter
    Bind,
    /// The backend cannot perform the requested call
    Unsupported,
    /// Anything else the server reported
    Database,
}

/// Error reported by a [`Driver`], passed through to the caller verbatim.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
    /// e.g. a SQLSTATE such as "42000"
    pub code: Option<String>,
    /// Parameter the failure is attributed to, for bind errors
    pub parameter: Option<String>,
}

impl DriverError {
    fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            parameter: None,
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Connect, message)
    }

    pub fn prepare(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Prepare, message)
    }

    pub fn bind(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            parameter: Some(parameter.into()),
            ..Self::new(DriverErrorKind::Bind, message)
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Unsupported, message)
    }

    pub fn database(message: impl Into<String>, code: Option<String>) -> Self {
        Self {
            code,
            ..Self::new(DriverErrorKind::Database, message)
        }
    }
}

/// Convert sqlx errors to DriverError.
impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DriverError::connect(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DriverError::database(db_err.message(), code)
            }
            sqlx::Error::Io(io_err) => DriverError::connect(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => DriverError::connect(format!("TLS error: {}", tls_err)),
            sqlx::Error::Protocol(msg) => DriverError::database(format!("Protocol error: {}", msg), None),
            sqlx::Error::PoolClosed => DriverError::connect("Connection is closed"),
            sqlx::Error::Encode(source) => {
                DriverError::bind("", format!("Encode error: {}", source))
            }
            sqlx::Error::ColumnDecode { index, source } => DriverError::database(
                format!("Failed to decode column {}: {}", index, source),
                None,
            ),
            _ => DriverError::database(format!("Unknown database error: {}", err), None),
        }
    }
}

/// Everything one execute-family call returns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverResult {
    /// Row sets in the order the server produced them
    pub row_sets: Vec<RowSet>,
    /// Scalar return code of a routine, if the backend reports one
    pub return_value: Option<i64>,
    /// Output parameter values by name
    pub output: Row,
}

impl DriverResult {
    /// A result made of row sets only.
    pub fn from_row_sets(row_sets: Vec<RowSet>) -> Self {
        Self {
            row_sets,
            ..Self::default()
        }
    }
}

/// An opaque database client.
///
/// Connections must be cheap to clone; every clone refers to the same
/// physical connection. Drivers are free to serialize calls on a connection.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    type Connection: Clone + Send + Sync + 'static;
    type Statement: Send + Sync + 'static;

    /// Open a physical connection.
    async fn connect(&self, config: &ConnectionConfig) -> Result<Self::Connection, DriverError>;

    /// Run SQL text (possibly several statements) with bound parameters.
    async fn execute(
        &self,
        conn: &Self::Connection,
        sql: &str,
        request: &BoundRequest,
    ) -> Result<DriverResult, DriverError>;

    /// Prepare SQL text against type-only parameter declarations.
    async fn prepare(
        &self,
        conn: &Self::Connection,
        sql: &str,
        declarations: &[ParamSpec],
    ) -> Result<Self::Statement, DriverError>;

    /// Execute a prepared statement with bound values.
    async fn execute_prepared(
        &self,
        statement: &Self::Statement,
        request: &BoundRequest,
    ) -> Result<DriverResult, DriverError>;

    /// Release a prepared statement.
    async fn unprepare(&self, statement: &Self::Statement) -> Result<(), DriverError>;

    /// Invoke a stored routine by name.
    async fn call_procedure(
        &self,
        conn: &Self::Connection,
        routine: &str,
        request: &BoundRequest,
    ) -> Result<DriverResult, DriverError>;

    /// Read a routine's parameter list from the catalog, in declaration order.
    async fn describe_procedure(
        &self,
        conn: &Self::Connection,
        routine: &str,
    ) -> Result<Vec<ParamSpec>, DriverError>;

    /// Close the connection.
    async fn close(&self, conn: Self::Connection) -> Result<(), DriverError>;
}

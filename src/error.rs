//! Error types for rowlink.
//!
//! Every failure a mapped operation can hit is a distinct [`DbError`] variant so
//! callers can tell an empty one-result lookup from a bad row or a driver fault.

use crate::db::driver::{DriverError, DriverErrorKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Empty result: operation '{operation}' returned no rows")]
    EmptyResult { operation: String },

    #[error("Validation failed for {entity}{}: {message}", field_suffix(.field))]
    Validation {
        entity: String,
        field: Option<String>,
        message: String,
    },

    #[error("Prepare failed for statement '{statement}': {message}")]
    Prepare {
        statement: String,
        message: String,
        /// Driver error code (e.g. SQLSTATE), when the driver reports one
        code: Option<String>,
    },

    #[error("Statement '{statement}' is not prepared: {reason}")]
    NotPrepared { statement: String, reason: String },

    #[error("Parameter '{parameter}' could not be bound: {message}")]
    ParameterBind { parameter: String, message: String },

    #[error(
        "Result shape mismatch for '{operation}': expected {expected} row sets, got {actual}"
    )]
    ResultShape {
        operation: String,
        expected: usize,
        actual: usize,
    },

    #[error("Database error: {message}")]
    Driver {
        message: String,
        code: Option<String>,
    },

    #[error("Unknown {kind}: {name}")]
    Lookup { kind: &'static str, name: String },

    #[error("Connection failed: {message}")]
    Connect { message: String, suggestion: String },

    #[error("Invalid definition for '{operation}': {message}")]
    InvalidDefinition { operation: String, message: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Operation '{operation}' was cancelled")]
    Cancelled { operation: String },
}

fn field_suffix(field: &Option<String>) -> String {
    field
        .as_deref()
        .map(|f| format!(".{}", f))
        .unwrap_or_default()
}

impl DbError {
    /// Create an empty-result error for a one-result operation.
    pub fn empty_result(operation: impl Into<String>) -> Self {
        Self::EmptyResult {
            operation: operation.into(),
        }
    }

    /// Create a validation error for a whole row.
    pub fn validation(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            entity: entity.into(),
            field: None,
            message: message.into(),
        }
    }

    /// Create a validation error pinned to a single field.
    pub fn field_validation(
        entity: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Validation {
            entity: entity.into(),
            field: Some(field.into()),
            message: message.into(),
        }
    }

    /// Create a prepare error.
    pub fn prepare(
        statement: impl Into<String>,
        message: impl Into<String>,
        code: Option<String>,
    ) -> Self {
        Self::Prepare {
            statement: statement.into(),
            message: message.into(),
            code,
        }
    }

    /// Create a not-prepared error.
    pub fn not_prepared(statement: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotPrepared {
            statement: statement.into(),
            reason: reason.into(),
        }
    }

    /// Create a parameter binding error.
    pub fn parameter_bind(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ParameterBind {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a result shape error.
    pub fn result_shape(operation: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::ResultShape {
            operation: operation.into(),
            expected,
            actual,
        }
    }

    /// Create an opaque driver error.
    pub fn driver(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Driver {
            message: message.into(),
            code,
        }
    }

    /// Create a lookup error for an unknown entity type.
    pub fn unknown_entity_type(name: impl Into<String>) -> Self {
        Self::Lookup {
            kind: "entity type",
            name: name.into(),
        }
    }

    /// Create a lookup error for an unknown statement.
    pub fn unknown_statement(name: impl Into<String>) -> Self {
        Self::Lookup {
            kind: "statement",
            name: name.into(),
        }
    }

    /// Create a lookup error for an unknown operation.
    pub fn unknown_operation(name: impl Into<String>) -> Self {
        Self::Lookup {
            kind: "operation",
            name: name.into(),
        }
    }

    /// Create a connect error with a helpful suggestion.
    pub fn connect(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a definition error.
    pub fn invalid_definition(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connect { suggestion, .. } => Some(suggestion),
            Self::NotPrepared { .. } => Some("Prepare the statement again before executing it"),
            Self::EmptyResult { .. } => Some("Verify the query conditions match existing data"),
            _ => None,
        }
    }

    /// Check if this error is retryable by the caller.
    ///
    /// Nothing is retried automatically; this only tells the caller whether a
    /// fresh attempt can succeed without changing the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Timeout { .. })
    }

    /// Check if this is the one-result empty error.
    pub fn is_empty_result(&self) -> bool {
        matches!(self, Self::EmptyResult { .. })
    }
}

/// Convert driver errors that reach the mapping layer without more specific context.
impl From<DriverError> for DbError {
    fn from(err: DriverError) -> Self {
        match err.kind {
            DriverErrorKind::Connect => {
                DbError::connect(err.message, "Check network connectivity and credentials")
            }
            DriverErrorKind::Bind => {
                DbError::parameter_bind(err.parameter.unwrap_or_default(), err.message)
            }
            DriverErrorKind::Prepare => DbError::prepare("", err.message, err.code),
            DriverErrorKind::Unsupported | DriverErrorKind::Database => {
                DbError::driver(err.message, err.code)
            }
        }
    }
}

/// Result type alias for mapping operations.
pub type DbResult<T> = Result<T, DbError>;

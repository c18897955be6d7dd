//! Data models for rowlink.
//!
//! This module re-exports the row, entity, parameter and operation types used
//! throughout the crate.

pub mod connection;
pub mod entity;
pub mod operation;
pub mod params;

// Re-export commonly used types
pub use connection::{ConnectionConfig, ConnectionConfigError, ConnectionState, DatabaseType};
pub use entity::{Entity, Materialized, OperationResult, Related, Row, RowSet};
pub use operation::{
    ArgPreprocessor, Args, OperationDef, OperationKind, ProcedureDef, QueryBuilder, QueryDef,
    StatementDef,
};
pub use params::{ColumnSpec, ParamDirection, ParamSpec, ParamType, SqlType};

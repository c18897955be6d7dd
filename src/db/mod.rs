//! Database layer.
//!
//! This module provides everything below the mapping layer:
//! - The `Driver` boundary and its sqlx implementation
//! - Single-connection lifecycle management
//! - The prepared statement registry
//! - Request parameter building
//! - Type mappings between sqlx values and JSON

pub mod connection;
pub mod driver;
pub mod params;
pub mod sqlx_driver;
pub mod statements;
pub mod types;

pub use connection::ConnectionManager;
pub use driver::{Driver, DriverError, DriverErrorKind, DriverResult};
pub use params::{BoundParam, BoundRequest, BoundValue, StructuredParam};
pub use sqlx_driver::{SqlxConnection, SqlxDriver, SqlxStatement};
pub use statements::{StatementRegistry, StatementState};

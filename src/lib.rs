//! rowlink library
//!
//! Maps parameterized database operations (ad-hoc queries, prepared
//! statements and stored procedures) onto typed entities, rebuilding object
//! graphs from the row sets a call returns.

pub mod config;
pub mod db;
pub mod error;
pub mod mapping;
pub mod models;

pub use config::{Config, MapperOptions};
pub use error::{DbError, DbResult};
pub use mapping::Mapper;

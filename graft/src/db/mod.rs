//! Database module for graft
//!
//! This module handles database connections, dialect rendering and the
//! per-dialect adapters.

pub mod adapter;
pub mod connection;
pub mod dialect;
pub mod executor;
pub mod mysql;
pub mod postgres;
pub mod sqlite;

// Re-export key types
pub use adapter::DatabaseAdapter;
pub use connection::connect;
pub use dialect::Dialect;
pub use executor::SqlExecutor;

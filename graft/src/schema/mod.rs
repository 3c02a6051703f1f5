//! Schema module for graft
//!
//! Parsing schema files, introspecting live databases, diffing the two and
//! rendering the difference as a migration.

pub mod diff;
pub mod generator;
pub mod introspect;
pub mod normalize;
pub mod parser;
pub mod scanner;
pub mod types;

// Re-export key types
pub use diff::{ColumnChange, ColumnDiff, SchemaDiff, TableDiff};
pub use generator::MigrationGenerator;
pub use introspect::SchemaIntrospector;
pub use parser::SchemaParser;
pub use types::{ForeignKeyRef, SchemaColumn, SchemaEnum, SchemaIndex, SchemaSnapshot, SchemaTable};

//! Error types for graft

use thiserror::Error;

use crate::migrations::conflict::MigrationConflict;

/// Result type for graft operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for graft
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Schema analysis error: {0}")]
    SchemaAnalysisError(String),

    #[error("Schema validation error: {0}")]
    SchemaValidation(String),

    /// Malformed DDL, positioned at the offending byte of the source file
    #[error("Syntax error in {file} at line {line}, column {column}: {message}")]
    SyntaxError {
        file: String,
        line: usize,
        column: usize,
        message: String,
    },

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Migration {id} failed: {message}")]
    MigrationFailed { id: String, message: String },

    #[error("No schema changes detected")]
    NoChanges,

    #[error("{} migration conflict(s) detected", .0.len())]
    Conflicts(Vec<MigrationConflict>),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Branch error: {0}")]
    BranchError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SQLx error: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Pattern error: {0}")]
    PatternError(#[from] regex::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl Error {
    /// Build a failure for a single migration
    pub fn migration_failed(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MigrationFailed {
            id: id.into(),
            message: message.into(),
        }
    }

    /// Build a branch error
    pub fn branch(message: impl Into<String>) -> Self {
        Self::BranchError(message.into())
    }

    /// Whether this error is the "nothing to do" outcome of generate
    pub fn is_no_changes(&self) -> bool {
        matches!(self, Self::NoChanges)
    }
}

/// Convert Serde JSON errors to graft errors
impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::SerializationError(error.to_string())
    }
}

/// Convert TOML deserialization errors to graft errors
impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::ConfigError(error.to_string())
    }
}

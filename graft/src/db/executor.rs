//! SQL executor
//!
//! Runs a migration's statements through the adapter in one transaction and
//! turns driver failures into [`Error::MigrationFailed`] with a remediation
//! hint when the failure is a known pattern.

use std::sync::Arc;

use crate::db::adapter::DatabaseAdapter;
use crate::error::{Error, Result};
use crate::schema::scanner;

/// SQL executor for running migrations
pub struct SqlExecutor {
    adapter: Arc<dyn DatabaseAdapter>,
}

impl SqlExecutor {
    /// Create a new SQL executor
    pub fn new(adapter: Arc<dyn DatabaseAdapter>) -> Self {
        Self { adapter }
    }

    /// Execute a single SQL statement
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        self.adapter.execute_query(sql).await
    }

    /// Execute one migration's statements in a transaction
    pub async fn execute_migration(&self, id: &str, statements: &[String]) -> Result<()> {
        tracing::debug!(migration = id, statements = statements.len(), "Executing migration");

        self.adapter
            .execute_migration(statements)
            .await
            .map_err(|e| {
                let message = describe(&e);
                match failure_hint(&message) {
                    Some(hint) => Error::migration_failed(id, format!("{}\n\nHint: {}", message, hint)),
                    None => Error::migration_failed(id, message),
                }
            })
    }
}

/// Driver message, prefixed with the SQLSTATE code when there is one
fn describe(error: &Error) -> String {
    match error {
        Error::SqlxError(sqlx::Error::Database(db)) => match db.code() {
            Some(code) => format!("{} ({})", db.message(), code),
            None => db.message().to_string(),
        },
        other => other.to_string(),
    }
}

/// Remediation advice for failures with a recognisable cause
pub fn failure_hint(message: &str) -> Option<&'static str> {
    let lower = message.to_lowercase();

    if lower.contains("23502")
        || lower.contains("null values")
        || lower.contains("not null constraint")
        || lower.contains("cannot be null")
        || lower.contains("not null column")
    {
        Some(
            "A NOT NULL column was added or constrained while rows still hold NULL. \
             Add a DEFAULT to the column, or add it as nullable, backfill the rows \
             and apply the NOT NULL constraint in a follow-up migration.",
        )
    } else if lower.contains("23505")
        || lower.contains("unique constraint")
        || lower.contains("duplicate entry")
    {
        Some("Existing rows violate the new unique constraint. Remove the duplicates first.")
    } else if lower.contains("already exists") {
        Some(
            "The object already exists. Guard the statement with IF NOT EXISTS or \
             reset the database if the migration history is out of sync.",
        )
    } else {
        None
    }
}

/// Split a migration body into executable statements
pub fn migration_statements(file: &str, body: &str) -> Result<Vec<String>> {
    let cleaned = scanner::strip_comments(body, file)?;
    Ok(scanner::split_statements(&cleaned, file)?
        .into_iter()
        .map(|statement| statement.text.to_string())
        .collect())
}

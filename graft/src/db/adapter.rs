//! Database adapter trait
//!
//! One implementation per dialect. The engine only ever talks to the
//! database through this trait, so every catalog query, tracking-table write
//! and namespace operation lives behind it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::dialect::Dialect;
use crate::error::Result;
use crate::migrations::history::{AppliedMigration, MigrationRecord};
use crate::schema::types::{SchemaColumn, SchemaEnum, SchemaTable};

#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Check the connection is alive
    async fn ping(&self) -> Result<()>;

    /// Close the pool
    async fn close(&self);

    /// Run one statement outside a transaction, returning rows affected
    async fn execute_query(&self, sql: &str) -> Result<u64>;

    /// Run every statement inside one transaction. Either all of them commit or
    /// none do. Dropping the future before it resolves rolls back.
    async fn execute_migration(&self, statements: &[String]) -> Result<()>;

    // Tracking table

    async fn create_migrations_table(&self) -> Result<()>;

    /// Widen a narrow `id` column and add columns older tables lack
    async fn ensure_migration_table_compatibility(&self) -> Result<()>;

    /// Delete unfinished rows started before `older_than`
    async fn cleanup_broken_migration_records(&self, older_than: DateTime<Utc>) -> Result<u64>;

    async fn get_applied_migrations(&self) -> Result<Vec<AppliedMigration>>;

    async fn record_migration(&self, record: &MigrationRecord) -> Result<()>;

    // Introspection

    /// Base tables in the active namespace, in name order
    async fn get_all_table_names(&self) -> Result<Vec<String>>;

    /// Columns in ordinal order
    async fn get_table_columns(&self, table: &str) -> Result<Vec<SchemaColumn>>;

    async fn get_current_enums(&self) -> Result<Vec<SchemaEnum>>;

    async fn table_exists(&self, table: &str) -> Result<bool>;

    async fn column_exists(&self, table: &str, column: &str) -> Result<bool>;

    async fn get_table_row_count(&self, table: &str) -> Result<i64>;

    /// Number of value groups over `columns` that occur more than once
    async fn count_duplicate_groups(&self, table: &str, columns: &[String]) -> Result<i64>;

    /// Every row of a table as a JSON object
    async fn get_table_data(&self, table: &str) -> Result<Vec<serde_json::Value>>;

    // Destructive operations

    /// Drop tables regardless of foreign keys between them
    async fn drop_tables(&self, tables: &[String]) -> Result<()>;

    async fn drop_enum(&self, name: &str) -> Result<()>;

    // Branch namespaces

    /// Namespace the connection points at when no branch is active
    fn default_namespace(&self) -> String;

    /// Namespace currently in use
    async fn active_namespace(&self) -> String;

    /// Re-point the pool at `namespace`
    async fn set_active_schema(&self, namespace: &str) -> Result<()>;

    /// Copy structure and data of `source` into a new namespace `target`
    async fn create_branch_namespace(&self, source: &str, target: &str) -> Result<()>;

    async fn drop_branch_namespace(&self, namespace: &str) -> Result<()>;

    // Rendering, shared by every dialect

    fn generate_create_table_sql(&self, table: &SchemaTable) -> String {
        self.dialect().create_table(table)
    }

    fn generate_add_column_sql(&self, table: &str, column: &SchemaColumn) -> String {
        self.dialect().add_column(table, column)
    }

    fn generate_drop_column_sql(&self, table: &str, column: &str) -> String {
        self.dialect().drop_column(table, column)
    }
}

/// Parse the JSON text column every dialect's row export produces
pub(crate) fn decode_row_json(rows: Vec<String>) -> Result<Vec<serde_json::Value>> {
    rows.iter()
        .map(|row| serde_json::from_str(row).map_err(Into::into))
        .collect()
}

/// `GROUP BY` query counting duplicate value groups
pub(crate) fn duplicate_groups_sql(dialect: Dialect, table: &str, columns: &[String]) -> String {
    let cols = columns
        .iter()
        .map(|c| dialect.quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let not_null = columns
        .iter()
        .map(|c| format!("{} IS NOT NULL", dialect.quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ");

    format!(
        "SELECT COUNT(*) FROM (SELECT {cols} FROM {table} WHERE {not_null} GROUP BY {cols} HAVING COUNT(*) > 1) dup",
        cols = cols,
        table = dialect.quote_ident(table),
        not_null = not_null,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn duplicate_groups_ignore_nulls() {
        assert_eq!(
            duplicate_groups_sql(Dialect::Postgres, "users", &["email".to_string()]),
            "SELECT COUNT(*) FROM (SELECT \"email\" FROM \"users\" WHERE \"email\" IS NOT NULL GROUP BY \"email\" HAVING COUNT(*) > 1) dup"
        );
    }

    #[test]
    fn row_json_decodes_objects() {
        let rows = decode_row_json(vec![r#"{"id":1,"name":"a"}"#.to_string()]).unwrap();
        assert_eq!(rows[0]["name"], "a");
    }
}

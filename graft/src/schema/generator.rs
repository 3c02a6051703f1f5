//! Migration generator
//!
//! This module turns the difference between the schema files and the live
//! database into SQL, and writes it out as a new migration file.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::db::adapter::DatabaseAdapter;
use crate::db::dialect::Dialect;
use crate::error::{Error, Result};
use crate::migrations::file::Migration;
use crate::schema::diff::SchemaDiff;
use crate::schema::introspect::SchemaIntrospector;
use crate::schema::parser::SchemaParser;

/// Migration SQL generator
pub struct MigrationGenerator {
    adapter: Arc<dyn DatabaseAdapter>,
    parser: SchemaParser,
    migrations_dir: PathBuf,
}

impl MigrationGenerator {
    /// Create a new migration generator
    pub fn new(adapter: Arc<dyn DatabaseAdapter>, parser: SchemaParser, migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            adapter,
            parser,
            migrations_dir: migrations_dir.into(),
        }
    }

    /// Diff the live database against the schema at `schema_path`
    pub async fn diff(&self, schema_path: &Path) -> Result<SchemaDiff> {
        let dialect = self.adapter.dialect();
        let target = dialect.adapt_snapshot(&self.parser.parse_path(schema_path).await?);
        let current = SchemaIntrospector::new(self.adapter.clone()).introspect().await?;

        let diff = SchemaDiff::generate(&current, &target, dialect);
        for line in diff.summary() {
            tracing::debug!(change = %line, "Schema change");
        }
        Ok(diff)
    }

    /// Dry run: the diff and the SQL a migration would contain
    pub async fn preview(&self, schema_path: &Path) -> Result<(SchemaDiff, String)> {
        let diff = self.diff(schema_path).await?;
        let sql = render_sql(&diff, self.adapter.dialect());
        Ok((diff, sql))
    }

    /// Write a migration moving the database to the schema at `schema_path`.
    /// Fails with [`Error::NoChanges`] without touching the filesystem when
    /// there is nothing to do.
    pub async fn generate(&self, name: &str, schema_path: &Path) -> Result<Migration> {
        let diff = self.diff(schema_path).await?;
        if !diff.has_changes() {
            tracing::info!("Database schema already matches the schema files");
            return Err(Error::NoChanges);
        }

        let sql = render_sql(&diff, self.adapter.dialect());
        if sql.trim().is_empty() {
            // Only changes this dialect cannot express
            return Err(Error::NoChanges);
        }

        let migration = Migration::create(&self.migrations_dir, name, &sql, Utc::now())?;
        tracing::info!(
            migration = %migration.id,
            changes = diff.summary().len(),
            "Generated migration"
        );
        Ok(migration)
    }
}

/// Statements for a diff, in execution order: enums, new tables with their
/// indexes, column additions, column drops, column alters, table drops,
/// enum drops
pub fn render_statements(diff: &SchemaDiff, dialect: Dialect) -> Vec<String> {
    let mut statements = Vec::new();

    statements.extend(diff.new_enums.iter().filter_map(|e| dialect.create_enum(e)));

    for table in &diff.new_tables {
        statements.push(dialect.create_table(table));
        statements.extend(table.indexes.iter().map(|index| dialect.create_index(index)));
    }

    for table in &diff.modified_tables {
        statements.extend(
            table
                .new_columns
                .iter()
                .map(|column| dialect.add_column(&table.table, column)),
        );
        statements.extend(
            table
                .dropped_columns
                .iter()
                .map(|column| dialect.drop_column(&table.table, column)),
        );
        statements.extend(
            table
                .column_changes
                .iter()
                .flat_map(|change| change.changes.iter().cloned()),
        );
    }

    statements.extend(diff.dropped_tables.iter().map(|table| dialect.drop_table(table)));
    statements.extend(diff.dropped_enums.iter().filter_map(|e| dialect.drop_enum(e)));

    statements
}

/// Migration body for a diff; statements separated by a blank line
pub fn render_sql(diff: &SchemaDiff, dialect: Dialect) -> String {
    render_statements(diff, dialect).join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::diff::{ColumnChange, ColumnDiff, TableDiff};
    use crate::schema::types::{SchemaColumn, SchemaEnum, SchemaIndex, SchemaTable};
    use pretty_assertions::assert_eq;

    fn users() -> SchemaTable {
        let mut table = SchemaTable::new("users")
            .with_column(SchemaColumn::new("id", "SERIAL").primary())
            .with_column(SchemaColumn::new("name", "VARCHAR(255)").not_null());
        table.indexes.push(SchemaIndex {
            name: "users_name_idx".to_string(),
            table: "users".to_string(),
            columns: vec!["name".to_string()],
            unique: false,
        });
        table
    }

    #[test]
    fn renders_in_dependency_order() {
        let diff = SchemaDiff {
            new_enums: vec![SchemaEnum {
                name: "mood".to_string(),
                values: vec!["happy".to_string()],
            }],
            new_tables: vec![users()],
            modified_tables: vec![TableDiff {
                table: "posts".to_string(),
                new_columns: vec![SchemaColumn::new("title", "TEXT")],
                dropped_columns: vec!["legacy".to_string()],
                column_changes: vec![ColumnDiff {
                    column: "body".to_string(),
                    old_type: "TEXT".to_string(),
                    new_type: "TEXT".to_string(),
                    kinds: vec![ColumnChange::Nullability { nullable: false }],
                    changes: vec!["ALTER TABLE \"posts\" ALTER COLUMN \"body\" SET NOT NULL;".to_string()],
                }],
            }],
            dropped_tables: vec!["sessions".to_string()],
            dropped_enums: vec!["old_mood".to_string()],
        };

        let statements = render_statements(&diff, Dialect::Postgres);
        let heads: Vec<&str> = statements
            .iter()
            .map(|s| s.split_whitespace().take(2).collect::<Vec<_>>())
            .map(|words| match words.as_slice() {
                ["DO", _] => "enum",
                ["CREATE", "TABLE"] => "table",
                ["CREATE", "INDEX"] => "index",
                ["DROP", "TABLE"] => "drop table",
                ["DROP", "TYPE"] => "drop enum",
                _ => "alter",
            })
            .collect();

        assert_eq!(
            heads,
            vec!["enum", "table", "index", "alter", "alter", "alter", "drop table", "drop enum"]
        );
        assert!(statements[3].contains("ADD COLUMN IF NOT EXISTS \"title\""));
        assert!(statements[4].contains("DROP COLUMN IF EXISTS \"legacy\""));
    }

    #[test]
    fn reference_table_body() {
        let mut table = users();
        table.indexes.clear();
        let diff = SchemaDiff {
            new_tables: vec![table],
            ..Default::default()
        };

        assert_eq!(
            render_sql(&diff, Dialect::Postgres),
            "CREATE TABLE \"users\" (\n    \"id\" SERIAL PRIMARY KEY,\n    \"name\" VARCHAR(255) NOT NULL\n);"
        );
    }

    #[test]
    fn enums_are_skipped_where_inlined() {
        let diff = SchemaDiff {
            new_enums: vec![SchemaEnum {
                name: "mood".to_string(),
                values: vec!["happy".to_string()],
            }],
            dropped_enums: vec!["old".to_string()],
            ..Default::default()
        };

        assert!(render_statements(&diff, Dialect::Sqlite).is_empty());
    }
}

//! Database backups
//!
//! A backup is a single JSON snapshot of every table's rows, written before
//! destructive operations or on request. Restoring replaces the rows of every
//! live table the backup knows about, inside one transaction; the tracking
//! table is left as it is.

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::db::adapter::DatabaseAdapter;
use crate::db::dialect::Dialect;
use crate::error::{Error, Result};
use crate::migrations::history::TRACKING_TABLE;
use crate::schema::types::{sort_by_dependencies, SchemaTable};

/// Produces a backup of the database an adapter points at
#[async_trait]
pub trait BackupProvider: Send + Sync {
    /// Write a backup and return where it went
    async fn create_backup(&self, adapter: &dyn DatabaseAdapter, comment: &str) -> Result<PathBuf>;

    /// Replace table contents with the rows stored in a backup
    async fn restore(&self, adapter: &dyn DatabaseAdapter, path: &Path) -> Result<RestoreReport>;
}

/// What a restore wrote
#[derive(Debug, Default, Clone, Serialize)]
pub struct RestoreReport {
    /// Rows written per table, in insert order
    pub tables: IndexMap<String, usize>,
    /// Tables in the backup that no longer exist
    pub skipped: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BackupFile {
    pub created_at: String,
    pub comment: String,
    pub dialect: String,
    pub namespace: String,
    /// Number of applied migrations when the backup was taken
    pub applied_migrations: usize,
    pub tables: IndexMap<String, TableBackup>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TableBackup {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Value>,
}

/// Writes `backup_<timestamp>.json` files into a directory
#[derive(Debug, Clone)]
pub struct JsonBackup {
    directory: PathBuf,
}

impl JsonBackup {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

#[async_trait]
impl BackupProvider for JsonBackup {
    async fn create_backup(&self, adapter: &dyn DatabaseAdapter, comment: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.directory)?;

        let applied = if adapter.table_exists(TRACKING_TABLE).await? {
            adapter.get_applied_migrations().await?.len()
        } else {
            0
        };

        let mut tables = IndexMap::new();
        for table in adapter.get_all_table_names().await? {
            let columns = adapter
                .get_table_columns(&table)
                .await?
                .into_iter()
                .map(|c| c.name)
                .collect();

            match adapter.get_table_data(&table).await {
                Ok(rows) => {
                    tracing::debug!(table = %table, rows = rows.len(), "Backed up table");
                    tables.insert(table, TableBackup { columns, rows });
                }
                Err(e) => tracing::warn!(table = %table, error = %e, "Failed to back up table"),
            }
        }

        let now = Utc::now();
        let backup = BackupFile {
            created_at: now.to_rfc3339(),
            comment: comment.to_string(),
            dialect: adapter.dialect().to_string(),
            namespace: adapter.active_namespace().await,
            applied_migrations: applied,
            tables,
        };

        let mut path = self
            .directory
            .join(format!("backup_{}.json", now.format("%Y-%m-%d_%H-%M-%S")));
        let mut suffix = 1;
        while path.exists() {
            path = self.directory.join(format!(
                "backup_{}_{}.json",
                now.format("%Y-%m-%d_%H-%M-%S"),
                suffix
            ));
            suffix += 1;
        }

        fs::write(&path, serde_json::to_string_pretty(&backup)?)?;
        tracing::info!(path = %path.display(), tables = backup.tables.len(), "Database backup created");

        Ok(path)
    }

    async fn restore(&self, adapter: &dyn DatabaseAdapter, path: &Path) -> Result<RestoreReport> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::MigrationError(format!("Cannot read backup {}: {}", path.display(), e)))?;
        let backup: BackupFile = serde_json::from_str(&content)?;
        let dialect = adapter.dialect();

        let mut report = RestoreReport::default();
        let mut live = Vec::new();
        for (name, _) in backup.tables.iter().filter(|(name, _)| !name.eq_ignore_ascii_case(TRACKING_TABLE)) {
            if !adapter.table_exists(name).await? {
                tracing::warn!(table = %name, "Table from backup no longer exists, skipping");
                report.skipped.push(name.clone());
                continue;
            }
            let mut table = SchemaTable::new(name.clone());
            table.columns = adapter.get_table_columns(name).await?;
            live.push(table);
        }
        let ordered = sort_by_dependencies(live);

        // Children are cleared before their parents and filled after them
        let mut statements: Vec<String> = ordered
            .iter()
            .rev()
            .map(|table| format!("DELETE FROM {}", dialect.quote_ident(&table.name)))
            .collect();

        for table in &ordered {
            let Some(saved) = backup.tables.get(&table.name) else {
                continue;
            };
            let columns: Vec<&String> = saved.columns.iter().filter(|c| table.has_column(c)).collect();
            if columns.is_empty() {
                report.tables.insert(table.name.clone(), 0);
                continue;
            }

            let column_list = columns
                .iter()
                .map(|c| dialect.quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            for row in &saved.rows {
                let values = columns
                    .iter()
                    .map(|c| json_literal(dialect, row.get(c.as_str()).unwrap_or(&serde_json::Value::Null)))
                    .collect::<Vec<_>>()
                    .join(", ");
                statements.push(format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    dialect.quote_ident(&table.name),
                    column_list,
                    values
                ));
            }

            if dialect == Dialect::Postgres {
                statements.extend(
                    table
                        .columns
                        .iter()
                        .filter(|c| c.auto_increment)
                        .map(|c| resync_sequence_sql(&table.name, &c.name)),
                );
            }
            report.tables.insert(table.name.clone(), saved.rows.len());
        }

        adapter.execute_migration(&statements).await?;

        tracing::info!(
            path = %path.display(),
            tables = report.tables.len(),
            rows = report.tables.values().sum::<usize>(),
            "Database restored from backup"
        );
        Ok(report)
    }
}

/// SQL literal for a value read back from a backup
fn json_literal(dialect: Dialect, value: &serde_json::Value) -> String {
    let text = match value {
        serde_json::Value::Null => return "NULL".to_string(),
        serde_json::Value::Bool(true) => return "TRUE".to_string(),
        serde_json::Value::Bool(false) => return "FALSE".to_string(),
        serde_json::Value::Number(n) => return n.to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match dialect {
        // backslash is an escape character in MySQL string literals
        Dialect::MySql => Dialect::quote_literal(&text.replace('\\', "\\\\")),
        _ => Dialect::quote_literal(&text),
    }
}

/// Move a serial column's sequence past the restored ids
fn resync_sequence_sql(table: &str, column: &str) -> String {
    let quoted_table = Dialect::Postgres.quote_ident(table);
    let quoted_column = Dialect::Postgres.quote_ident(column);
    format!(
        "SELECT setval(pg_get_serial_sequence({}, {}), COALESCE(MAX({}), 0) + 1, false) FROM {}",
        Dialect::quote_literal(&quoted_table),
        Dialect::quote_literal(column),
        quoted_column,
        quoted_table
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn backup_values_render_as_literals() {
        let pg = Dialect::Postgres;
        assert_eq!(json_literal(pg, &json!(null)), "NULL");
        assert_eq!(json_literal(pg, &json!(true)), "TRUE");
        assert_eq!(json_literal(pg, &json!(42)), "42");
        assert_eq!(json_literal(pg, &json!(1.5)), "1.5");
        assert_eq!(json_literal(pg, &json!("O'Brien")), "'O''Brien'");
        assert_eq!(json_literal(pg, &json!({"a": [1]})), "'{\"a\":[1]}'");
    }

    #[test]
    fn mysql_literals_escape_backslashes() {
        assert_eq!(json_literal(Dialect::MySql, &json!("C:\\tmp")), "'C:\\\\tmp'");
        assert_eq!(json_literal(Dialect::Sqlite, &json!("C:\\tmp")), "'C:\\tmp'");
    }

    #[test]
    fn sequences_restart_after_the_highest_id() {
        assert_eq!(
            resync_sequence_sql("users", "id"),
            "SELECT setval(pg_get_serial_sequence('\"users\"', 'id'), COALESCE(MAX(\"id\"), 0) + 1, false) FROM \"users\""
        );
    }
}

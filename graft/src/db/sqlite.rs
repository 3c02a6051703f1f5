//! SQLite adapter
//!
//! Branches are sibling database files (`<stem>_branch_<name><ext>`) copied
//! with `VACUUM INTO`. SQLite has no enum types and cannot alter columns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{ConnectOptions, Executor, FromRow};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::DatabaseConfig;
use crate::db::adapter::{decode_row_json, duplicate_groups_sql, DatabaseAdapter};
use crate::db::dialect::Dialect;
use crate::error::{Error, Result};
use crate::migrations::history::{self, AppliedMigration, MigrationRecord, TRACKING_TABLE};
use crate::schema::types::{ForeignKeyRef, SchemaColumn, SchemaEnum};

const DEFAULT_NAMESPACE: &str = "main";

#[derive(FromRow)]
struct ColumnRow {
    name: String,
    data_type: String,
    not_null: i64,
    dflt_value: Option<String>,
    pk: i64,
}

#[derive(FromRow)]
struct ForeignKeyRow {
    column_name: String,
    ref_table: String,
    ref_column: Option<String>,
    on_delete: Option<String>,
}

/// SQLite database adapter
pub struct SqliteAdapter {
    config: DatabaseConfig,
    /// `None` for in-memory databases, which cannot be branched
    base_path: Option<PathBuf>,
    pool: RwLock<SqlitePool>,
    active: RwLock<String>,
}

impl SqliteAdapter {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let base_path = database_path(&config.url);
        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
        let pool = pool_options(config, base_path.is_none())
            .connect_with(options)
            .await?;

        tracing::debug!(url = %config.url, "Connected to SQLite");

        Ok(Self {
            config: config.clone(),
            base_path,
            pool: RwLock::new(pool),
            active: RwLock::new(DEFAULT_NAMESPACE.to_string()),
        })
    }

    async fn pool(&self) -> SqlitePool {
        self.pool.read().await.clone()
    }

    fn require_file(&self) -> Result<&Path> {
        self.base_path
            .as_deref()
            .ok_or_else(|| Error::branch("In-memory SQLite databases cannot be branched"))
    }

    fn namespace_path(&self, namespace: &str) -> Result<PathBuf> {
        let base = self.require_file()?;
        if namespace == DEFAULT_NAMESPACE {
            Ok(base.to_path_buf())
        } else {
            Ok(branch_file(base, namespace))
        }
    }

    async fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKeyRow>> {
        let sql = r#"
            SELECT "from" AS column_name, "table" AS ref_table, "to" AS ref_column, on_delete
            FROM pragma_foreign_key_list(?)
        "#;

        Ok(sqlx::query_as::<_, ForeignKeyRow>(sql)
            .bind(table)
            .fetch_all(&self.pool().await)
            .await?)
    }

    async fn declares_autoincrement(&self, table: &str) -> Result<bool> {
        let sql = sqlx::query_scalar::<_, Option<String>>(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND lower(name) = lower(?)",
        )
        .bind(table)
        .fetch_optional(&self.pool().await)
        .await?
        .flatten();

        Ok(sql.map_or(false, |sql| sql.to_uppercase().contains("AUTOINCREMENT")))
    }
}

fn pool_options(config: &DatabaseConfig, in_memory: bool) -> SqlitePoolOptions {
    // every connection to `:memory:` would see its own empty database
    let max_connections = if in_memory {
        1
    } else {
        config.pool_size.unwrap_or(5)
    };

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(config.timeout_seconds.unwrap_or(30)))
}

/// Filesystem path of a `sqlite:` url, `None` when in-memory
pub fn database_path(url: &str) -> Option<PathBuf> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, query),
        None => (rest, ""),
    };

    if path.is_empty() || path == ":memory:" || query.contains("mode=memory") {
        None
    } else {
        Some(PathBuf::from(path))
    }
}

/// `dir/app.db` and `feature` into `dir/app_branch_feature.db`
pub fn branch_file(base: &Path, branch: &str) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "database".to_string());
    let file_name = match base.extension() {
        Some(ext) => format!("{}_branch_{}.{}", stem, branch, ext.to_string_lossy()),
        None => format!("{}_branch_{}", stem, branch),
    };
    base.with_file_name(file_name)
}

#[async_trait]
impl DatabaseAdapter for SqliteAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool().await).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.read().await.close().await;
    }

    async fn execute_query(&self, sql: &str) -> Result<u64> {
        let result = self.pool().await.execute(sql).await?;
        Ok(result.rows_affected())
    }

    async fn execute_migration(&self, statements: &[String]) -> Result<()> {
        let pool = self.pool().await;
        let mut tx = pool.begin().await?;
        for statement in statements {
            (&mut *tx).execute(statement.as_str()).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn create_migrations_table(&self) -> Result<()> {
        self.execute_query(&history::create_tracking_table_sql(Dialect::Sqlite))
            .await?;
        Ok(())
    }

    async fn ensure_migration_table_compatibility(&self) -> Result<()> {
        // column widths are not enforced, only missing columns matter
        if !self.column_exists(TRACKING_TABLE, "logs").await? {
            tracing::info!("Adding logs column to the migrations table");
            self.execute_query(&format!(
                "ALTER TABLE {} ADD COLUMN logs TEXT",
                Dialect::Sqlite.quote_ident(TRACKING_TABLE)
            ))
            .await?;
        }
        Ok(())
    }

    async fn cleanup_broken_migration_records(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(&history::cleanup_broken_records_sql(Dialect::Sqlite))
            .bind(older_than)
            .execute(&self.pool().await)
            .await?;
        Ok(result.rows_affected())
    }

    async fn get_applied_migrations(&self) -> Result<Vec<AppliedMigration>> {
        Ok(
            sqlx::query_as::<_, AppliedMigration>(&history::applied_migrations_sql(Dialect::Sqlite))
                .fetch_all(&self.pool().await)
                .await?,
        )
    }

    async fn record_migration(&self, record: &MigrationRecord) -> Result<()> {
        sqlx::query(&history::record_migration_sql(Dialect::Sqlite))
            .bind(&record.id)
            .bind(&record.checksum)
            .bind(record.finished_at)
            .bind(&record.migration_name)
            .bind(&record.logs)
            .bind(record.started_at)
            .bind(record.applied_steps_count)
            .execute(&self.pool().await)
            .await?;
        Ok(())
    }

    async fn get_all_table_names(&self) -> Result<Vec<String>> {
        let sql = r#"
            SELECT name FROM sqlite_master
            WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
            ORDER BY name
        "#;
        Ok(sqlx::query_scalar(sql).fetch_all(&self.pool().await).await?)
    }

    async fn get_table_columns(&self, table: &str) -> Result<Vec<SchemaColumn>> {
        let sql = r#"
            SELECT name, type AS data_type, "notnull" AS not_null, dflt_value, pk
            FROM pragma_table_info(?)
            ORDER BY cid
        "#;
        let rows = sqlx::query_as::<_, ColumnRow>(sql)
            .bind(table)
            .fetch_all(&self.pool().await)
            .await?;

        let pk_count = rows.iter().filter(|r| r.pk > 0).count();
        let autoincrement = self.declares_autoincrement(table).await?;
        let foreign_keys = self.foreign_keys(table).await?;

        let columns = rows
            .into_iter()
            .map(|row| {
                let primary_key = row.pk > 0;
                // a lone INTEGER PRIMARY KEY aliases the rowid
                let rowid_alias = primary_key
                    && pk_count == 1
                    && row.data_type.eq_ignore_ascii_case("INTEGER");

                let references = foreign_keys
                    .iter()
                    .find(|fk| fk.column_name.eq_ignore_ascii_case(&row.name))
                    .map(|fk| ForeignKeyRef {
                        table: fk.ref_table.clone(),
                        column: fk.ref_column.clone(),
                        on_delete: fk
                            .on_delete
                            .clone()
                            .filter(|action| action != "NO ACTION"),
                    });

                SchemaColumn {
                    name: row.name,
                    data_type: row.data_type,
                    nullable: row.not_null == 0 && !primary_key,
                    default: row.dflt_value,
                    primary_key,
                    unique: false,
                    auto_increment: rowid_alias || (primary_key && autoincrement),
                    references,
                }
            })
            .collect();

        Ok(columns)
    }

    async fn get_current_enums(&self) -> Result<Vec<SchemaEnum>> {
        Ok(Vec::new())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND lower(name) = lower(?)",
        )
        .bind(table)
        .fetch_one(&self.pool().await)
        .await?;
        Ok(count > 0)
    }

    async fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pragma_table_info(?) WHERE lower(name) = lower(?)",
        )
        .bind(table)
        .bind(column)
        .fetch_one(&self.pool().await)
        .await?;
        Ok(count > 0)
    }

    async fn get_table_row_count(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", Dialect::Sqlite.quote_ident(table));
        Ok(sqlx::query_scalar(&sql).fetch_one(&self.pool().await).await?)
    }

    async fn count_duplicate_groups(&self, table: &str, columns: &[String]) -> Result<i64> {
        let sql = duplicate_groups_sql(Dialect::Sqlite, table, columns);
        Ok(sqlx::query_scalar(&sql).fetch_one(&self.pool().await).await?)
    }

    async fn get_table_data(&self, table: &str) -> Result<Vec<serde_json::Value>> {
        let columns = self.get_table_columns(table).await?;
        if columns.is_empty() {
            return Ok(Vec::new());
        }

        let pairs = columns
            .iter()
            .map(|c| {
                format!(
                    "{}, {}",
                    Dialect::quote_literal(&c.name),
                    Dialect::Sqlite.quote_ident(&c.name)
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT json_object({}) AS row_json FROM {}",
            pairs,
            Dialect::Sqlite.quote_ident(table)
        );

        let rows: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&self.pool().await).await?;
        decode_row_json(rows)
    }

    async fn drop_tables(&self, tables: &[String]) -> Result<()> {
        let pool = self.pool().await;
        let mut conn = pool.acquire().await?;

        // the pragma is per connection and a no-op inside a transaction
        (&mut *conn).execute("PRAGMA foreign_keys = OFF").await?;
        let mut outcome = Ok(());
        for table in tables {
            let sql = Dialect::Sqlite.drop_table(table);
            if let Err(e) = (&mut *conn).execute(sql.as_str()).await {
                outcome = Err(e.into());
                break;
            }
        }
        (&mut *conn).execute("PRAGMA foreign_keys = ON").await?;

        outcome
    }

    async fn drop_enum(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn default_namespace(&self) -> String {
        DEFAULT_NAMESPACE.to_string()
    }

    async fn active_namespace(&self) -> String {
        self.active.read().await.clone()
    }

    async fn set_active_schema(&self, namespace: &str) -> Result<()> {
        if *self.active.read().await == namespace {
            return Ok(());
        }

        let path = self.namespace_path(namespace)?;
        if !path.exists() {
            return Err(Error::branch(format!(
                "Branch database {} does not exist",
                path.display()
            )));
        }

        let options = SqliteConnectOptions::new().filename(&path);
        let pool = pool_options(&self.config, false).connect_with(options).await?;
        let previous = std::mem::replace(&mut *self.pool.write().await, pool);
        previous.close().await;
        *self.active.write().await = namespace.to_string();

        tracing::info!(namespace, path = %path.display(), "Switched SQLite database");
        Ok(())
    }

    async fn create_branch_namespace(&self, source: &str, target: &str) -> Result<()> {
        let source_path = self.namespace_path(source)?;
        let target_path = self.namespace_path(target)?;
        if target_path.exists() {
            return Err(Error::branch(format!(
                "Branch database {} already exists",
                target_path.display()
            )));
        }

        let mut conn = SqliteConnectOptions::new()
            .filename(&source_path)
            .connect()
            .await?;
        let sql = format!(
            "VACUUM INTO {}",
            Dialect::quote_literal(&target_path.to_string_lossy())
        );
        conn.execute(sql.as_str()).await?;

        tracing::info!(
            source = %source_path.display(),
            target = %target_path.display(),
            "Copied SQLite database for branch"
        );
        Ok(())
    }

    async fn drop_branch_namespace(&self, namespace: &str) -> Result<()> {
        if namespace == DEFAULT_NAMESPACE {
            return Err(Error::branch("The default database cannot be dropped"));
        }
        if *self.active.read().await == namespace {
            return Err(Error::branch(format!("Branch database '{}' is in use", namespace)));
        }

        let path = self.namespace_path(namespace)?;
        for suffix in ["", "-wal", "-shm"] {
            let file = PathBuf::from(format!("{}{}", path.display(), suffix));
            if file.exists() {
                std::fs::remove_file(&file)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("sqlite://data/app.db", Some("data/app.db"))]
    #[case("sqlite:app.db?mode=rwc", Some("app.db"))]
    #[case("sqlite::memory:", None)]
    #[case("sqlite://file.db?mode=memory", None)]
    fn parses_database_path(#[case] url: &str, #[case] expected: Option<&str>) {
        assert_eq!(database_path(url), expected.map(PathBuf::from));
    }

    #[test]
    fn branch_files_sit_beside_the_database() {
        assert_eq!(
            branch_file(Path::new("/tmp/db/app.db"), "feature"),
            PathBuf::from("/tmp/db/app_branch_feature.db")
        );
        assert_eq!(
            branch_file(Path::new("/tmp/db/app"), "x"),
            PathBuf::from("/tmp/db/app_branch_x")
        );
    }

    #[tokio::test]
    async fn introspects_columns_and_rowid_alias() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            driver: "sqlite".to_string(),
            url: format!("sqlite://{}", dir.path().join("t.db").display()),
            pool_size: Some(2),
            timeout_seconds: Some(5),
        };
        let adapter = SqliteAdapter::connect(&config).await.unwrap();
        adapter
            .execute_query(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL, status TEXT DEFAULT 'active')",
            )
            .await
            .unwrap();

        let columns = adapter.get_table_columns("users").await.unwrap();
        assert_eq!(columns.len(), 3);
        assert!(columns[0].primary_key && columns[0].auto_increment);
        assert!(!columns[1].nullable);
        assert_eq!(columns[2].default.as_deref(), Some("'active'"));
        assert!(adapter.table_exists("USERS").await.unwrap());
        assert!(adapter.column_exists("users", "Email").await.unwrap());
    }
}

//! MySQL adapter
//!
//! Branches are separate databases. MySQL commits DDL implicitly, so
//! `execute_migration` only gives all-or-nothing behaviour for DML.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::{Executor, FromRow};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::DatabaseConfig;
use crate::db::adapter::{decode_row_json, duplicate_groups_sql, DatabaseAdapter};
use crate::db::dialect::Dialect;
use crate::error::{Error, Result};
use crate::migrations::history::{self, AppliedMigration, MigrationRecord, TRACKING_TABLE};
use crate::schema::types::{ForeignKeyRef, SchemaColumn, SchemaEnum};

#[derive(FromRow)]
struct ColumnRow {
    column_name: String,
    data_type: String,
    is_nullable: String,
    column_default: Option<String>,
    column_key: String,
    extra: String,
}

#[derive(FromRow)]
struct ForeignKeyRow {
    column_name: String,
    ref_table: String,
    ref_column: String,
    delete_rule: String,
}

/// MySQL database adapter
pub struct MySqlAdapter {
    config: DatabaseConfig,
    default_database: String,
    pool: RwLock<MySqlPool>,
    active: RwLock<String>,
}

impl MySqlAdapter {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = pool_options(config).connect(&config.url).await?;
        let database: Option<String> = sqlx::query_scalar("SELECT CAST(DATABASE() AS CHAR)")
            .fetch_one(&pool)
            .await?;
        let default_database = database.ok_or_else(|| {
            Error::ConfigError("The MySQL url must name a database".to_string())
        })?;

        tracing::debug!(database = %default_database, "Connected to MySQL");

        Ok(Self {
            config: config.clone(),
            active: RwLock::new(default_database.clone()),
            default_database,
            pool: RwLock::new(pool),
        })
    }

    async fn pool(&self) -> MySqlPool {
        self.pool.read().await.clone()
    }

    async fn tables_in_database(&self, database: &str) -> Result<Vec<String>> {
        let sql = r#"
            SELECT CAST(TABLE_NAME AS CHAR)
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
        "#;
        Ok(sqlx::query_scalar(sql)
            .bind(database)
            .fetch_all(&self.pool().await)
            .await?)
    }

    async fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKeyRow>> {
        let sql = r#"
            SELECT
                CAST(kcu.COLUMN_NAME AS CHAR) AS column_name,
                CAST(kcu.REFERENCED_TABLE_NAME AS CHAR) AS ref_table,
                CAST(kcu.REFERENCED_COLUMN_NAME AS CHAR) AS ref_column,
                CAST(rc.DELETE_RULE AS CHAR) AS delete_rule
            FROM information_schema.REFERENTIAL_CONSTRAINTS rc
            JOIN information_schema.KEY_COLUMN_USAGE kcu
                ON rc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME
                AND rc.CONSTRAINT_SCHEMA = kcu.CONSTRAINT_SCHEMA
            WHERE rc.CONSTRAINT_SCHEMA = DATABASE() AND kcu.TABLE_NAME = ?
        "#;
        Ok(sqlx::query_as::<_, ForeignKeyRow>(sql)
            .bind(table)
            .fetch_all(&self.pool().await)
            .await?)
    }
}

fn pool_options(config: &DatabaseConfig) -> MySqlPoolOptions {
    MySqlPoolOptions::new()
        .max_connections(config.pool_size.unwrap_or(10))
        .acquire_timeout(Duration::from_secs(config.timeout_seconds.unwrap_or(30)))
}

/// MySQL 8 reports literal defaults unquoted; quote them so they compare
/// like the declared `DEFAULT 'x'`
fn catalog_default(raw: Option<String>, extra: &str) -> Option<String> {
    let raw = raw?;
    let upper = raw.to_uppercase();
    let is_expression = extra.to_uppercase().contains("DEFAULT_GENERATED")
        || upper.starts_with("CURRENT_TIMESTAMP")
        || upper == "NULL"
        || raw.starts_with('\'')
        || raw.parse::<f64>().is_ok();

    if is_expression {
        Some(raw)
    } else {
        Some(Dialect::quote_literal(&raw))
    }
}

#[async_trait]
impl DatabaseAdapter for MySqlAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
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
        self.execute_query(&history::create_tracking_table_sql(Dialect::MySql))
            .await?;
        Ok(())
    }

    async fn ensure_migration_table_compatibility(&self) -> Result<()> {
        let sql = r#"
            SELECT CAST(CHARACTER_MAXIMUM_LENGTH AS SIGNED)
            FROM information_schema.COLUMNS
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND COLUMN_NAME = 'id'
        "#;
        let id_length: Option<Option<i64>> = sqlx::query_scalar(sql)
            .bind(TRACKING_TABLE)
            .fetch_optional(&self.pool().await)
            .await?;

        let table = Dialect::MySql.quote_ident(TRACKING_TABLE);
        if let Some(Some(length)) = id_length {
            if length < 255 {
                tracing::info!(length, "Widening migrations table id column");
                self.execute_query(&format!(
                    "ALTER TABLE {} MODIFY COLUMN id VARCHAR(255) NOT NULL",
                    table
                ))
                .await?;
            }
        }

        if !self.column_exists(TRACKING_TABLE, "logs").await? {
            tracing::info!("Adding logs column to the migrations table");
            self.execute_query(&format!("ALTER TABLE {} ADD COLUMN logs TEXT", table))
                .await?;
        }
        Ok(())
    }

    async fn cleanup_broken_migration_records(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(&history::cleanup_broken_records_sql(Dialect::MySql))
            .bind(older_than)
            .execute(&self.pool().await)
            .await?;
        Ok(result.rows_affected())
    }

    async fn get_applied_migrations(&self) -> Result<Vec<AppliedMigration>> {
        Ok(
            sqlx::query_as::<_, AppliedMigration>(&history::applied_migrations_sql(Dialect::MySql))
                .fetch_all(&self.pool().await)
                .await?,
        )
    }

    async fn record_migration(&self, record: &MigrationRecord) -> Result<()> {
        sqlx::query(&history::record_migration_sql(Dialect::MySql))
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
        let database = self.active_namespace().await;
        self.tables_in_database(&database).await
    }

    async fn get_table_columns(&self, table: &str) -> Result<Vec<SchemaColumn>> {
        let sql = r#"
            SELECT
                CAST(COLUMN_NAME AS CHAR) AS column_name,
                CAST(COLUMN_TYPE AS CHAR) AS data_type,
                CAST(IS_NULLABLE AS CHAR) AS is_nullable,
                CAST(COLUMN_DEFAULT AS CHAR) AS column_default,
                CAST(COLUMN_KEY AS CHAR) AS column_key,
                CAST(EXTRA AS CHAR) AS extra
            FROM information_schema.COLUMNS
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
        "#;
        let rows = sqlx::query_as::<_, ColumnRow>(sql)
            .bind(table)
            .fetch_all(&self.pool().await)
            .await?;
        let foreign_keys = self.foreign_keys(table).await?;

        let columns = rows
            .into_iter()
            .map(|row| {
                let references = foreign_keys
                    .iter()
                    .find(|fk| fk.column_name == row.column_name)
                    .map(|fk| ForeignKeyRef {
                        table: fk.ref_table.clone(),
                        column: Some(fk.ref_column.clone()),
                        on_delete: Some(fk.delete_rule.clone())
                            .filter(|r| r != "NO ACTION" && r != "RESTRICT"),
                    });

                SchemaColumn {
                    name: row.column_name,
                    data_type: row.data_type,
                    nullable: row.is_nullable == "YES",
                    default: catalog_default(row.column_default, &row.extra),
                    primary_key: row.column_key == "PRI",
                    unique: row.column_key == "UNI",
                    auto_increment: row.extra.to_lowercase().contains("auto_increment"),
                    references,
                }
            })
            .collect();

        Ok(columns)
    }

    async fn get_current_enums(&self) -> Result<Vec<SchemaEnum>> {
        // enum types are inlined into column types
        Ok(Vec::new())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let sql = r#"
            SELECT COUNT(*) FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = DATABASE() AND LOWER(TABLE_NAME) = LOWER(?)
        "#;
        let count: i64 = sqlx::query_scalar(sql)
            .bind(table)
            .fetch_one(&self.pool().await)
            .await?;
        Ok(count > 0)
    }

    async fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        let sql = r#"
            SELECT COUNT(*) FROM information_schema.COLUMNS
            WHERE TABLE_SCHEMA = DATABASE()
                AND LOWER(TABLE_NAME) = LOWER(?)
                AND LOWER(COLUMN_NAME) = LOWER(?)
        "#;
        let count: i64 = sqlx::query_scalar(sql)
            .bind(table)
            .bind(column)
            .fetch_one(&self.pool().await)
            .await?;
        Ok(count > 0)
    }

    async fn get_table_row_count(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", Dialect::MySql.quote_ident(table));
        Ok(sqlx::query_scalar(&sql).fetch_one(&self.pool().await).await?)
    }

    async fn count_duplicate_groups(&self, table: &str, columns: &[String]) -> Result<i64> {
        let sql = duplicate_groups_sql(Dialect::MySql, table, columns);
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
                    Dialect::MySql.quote_ident(&c.name)
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT CAST(JSON_OBJECT({}) AS CHAR) AS row_json FROM {}",
            pairs,
            Dialect::MySql.quote_ident(table)
        );

        let rows: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&self.pool().await).await?;
        decode_row_json(rows)
    }

    async fn drop_tables(&self, tables: &[String]) -> Result<()> {
        let pool = self.pool().await;
        let mut conn = pool.acquire().await?;

        (&mut *conn).execute("SET FOREIGN_KEY_CHECKS = 0").await?;
        let mut outcome = Ok(());
        for table in tables {
            let sql = Dialect::MySql.drop_table(table);
            if let Err(e) = (&mut *conn).execute(sql.as_str()).await {
                outcome = Err(e.into());
                break;
            }
        }
        (&mut *conn).execute("SET FOREIGN_KEY_CHECKS = 1").await?;

        outcome
    }

    async fn drop_enum(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn default_namespace(&self) -> String {
        self.default_database.clone()
    }

    async fn active_namespace(&self) -> String {
        self.active.read().await.clone()
    }

    async fn set_active_schema(&self, namespace: &str) -> Result<()> {
        if *self.active.read().await == namespace {
            return Ok(());
        }

        let options = MySqlConnectOptions::from_str(&self.config.url)?.database(namespace);
        let pool = pool_options(&self.config).connect_with(options).await?;
        let previous = std::mem::replace(&mut *self.pool.write().await, pool);
        previous.close().await;
        *self.active.write().await = namespace.to_string();

        tracing::info!(database = namespace, "Switched MySQL database");
        Ok(())
    }

    async fn create_branch_namespace(&self, source: &str, target: &str) -> Result<()> {
        let tables = self.tables_in_database(source).await?;
        let my = Dialect::MySql;

        self.execute_query(&format!("CREATE DATABASE {}", my.quote_ident(target)))
            .await?;

        let copy = async {
            for table in &tables {
                let from = format!("{}.{}", my.quote_ident(source), my.quote_ident(table));
                let to = format!("{}.{}", my.quote_ident(target), my.quote_ident(table));
                self.execute_query(&format!("CREATE TABLE {} LIKE {}", to, from)).await?;
                self.execute_query(&format!("INSERT INTO {} SELECT * FROM {}", to, from)).await?;
            }
            Ok::<_, Error>(())
        };

        // DDL is not transactional here, so undo by hand
        if let Err(e) = copy.await {
            if let Err(cleanup) = self
                .execute_query(&format!("DROP DATABASE IF EXISTS {}", my.quote_ident(target)))
                .await
            {
                tracing::warn!(target, error = %cleanup, "Failed to remove partial branch database");
            }
            return Err(Error::branch(format!(
                "Failed to copy database '{}' to '{}': {}",
                source, target, e
            )));
        }

        tracing::info!(source, target, tables = tables.len(), "Cloned database for branch");
        Ok(())
    }

    async fn drop_branch_namespace(&self, namespace: &str) -> Result<()> {
        if namespace == self.default_database {
            return Err(Error::branch("The default database cannot be dropped"));
        }
        if *self.active.read().await == namespace {
            return Err(Error::branch(format!("Database '{}' is in use", namespace)));
        }

        self.execute_query(&format!(
            "DROP DATABASE IF EXISTS {}",
            Dialect::MySql.quote_ident(namespace)
        ))
        .await?;
        Ok(())
    }
}

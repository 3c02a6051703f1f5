//! PostgreSQL adapter
//!
//! Catalog queries run against `current_schema()`, so switching branches is
//! just a new pool whose connections set `search_path` to the branch schema.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, FromRow};
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
    is_primary: bool,
    is_unique: bool,
}

#[derive(FromRow)]
struct ForeignKeyRow {
    column_name: String,
    ref_table: String,
    ref_column: String,
    delete_rule: String,
}

#[derive(FromRow)]
struct EnumRow {
    name: String,
    value: String,
}

/// PostgreSQL database adapter
pub struct PostgresAdapter {
    config: DatabaseConfig,
    default_schema: String,
    pool: RwLock<PgPool>,
    active: RwLock<String>,
}

impl PostgresAdapter {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = pool_options(config).connect(&config.url).await?;
        let default_schema: Option<String> = sqlx::query_scalar("SELECT current_schema()::text")
            .fetch_one(&pool)
            .await?;
        let default_schema = default_schema.unwrap_or_else(|| "public".to_string());

        tracing::debug!(schema = %default_schema, "Connected to PostgreSQL");

        Ok(Self {
            config: config.clone(),
            active: RwLock::new(default_schema.clone()),
            default_schema,
            pool: RwLock::new(pool),
        })
    }

    async fn pool(&self) -> PgPool {
        self.pool.read().await.clone()
    }

    async fn connect_to_schema(&self, schema: &str) -> Result<PgPool> {
        if schema == self.default_schema {
            return Ok(pool_options(&self.config).connect(&self.config.url).await?);
        }

        let search_path = format!("SET search_path TO {}, public", Dialect::Postgres.quote_ident(schema));
        let pool = pool_options(&self.config)
            .after_connect(move |conn, _meta| {
                let sql = search_path.clone();
                Box::pin(async move {
                    conn.execute(sql.as_str()).await?;
                    Ok(())
                })
            })
            .connect(&self.config.url)
            .await?;
        Ok(pool)
    }

    async fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKeyRow>> {
        let sql = r#"
            SELECT
                kcu.column_name::text AS column_name,
                ccu.table_name::text AS ref_table,
                ccu.column_name::text AS ref_column,
                rc.delete_rule::text AS delete_rule
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
                ON ccu.constraint_name = tc.constraint_name
                AND ccu.table_schema = tc.table_schema
            JOIN information_schema.referential_constraints rc
                ON tc.constraint_name = rc.constraint_name
                AND tc.table_schema = rc.constraint_schema
            WHERE tc.constraint_type = 'FOREIGN KEY'
                AND tc.table_schema = current_schema()
                AND tc.table_name = $1
            ORDER BY tc.constraint_name, kcu.ordinal_position
        "#;

        Ok(sqlx::query_as::<_, ForeignKeyRow>(sql)
            .bind(table)
            .fetch_all(&self.pool().await)
            .await?)
    }

    async fn tables_in_schema(&self, schema: &str) -> Result<Vec<String>> {
        let sql = r#"
            SELECT table_name::text
            FROM information_schema.tables
            WHERE table_schema = $1 AND table_type = 'BASE TABLE'
            ORDER BY table_name
        "#;
        Ok(sqlx::query_scalar(sql)
            .bind(schema)
            .fetch_all(&self.pool().await)
            .await?)
    }
}

fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.pool_size.unwrap_or(10))
        .acquire_timeout(Duration::from_secs(config.timeout_seconds.unwrap_or(30)))
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
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
        self.execute_query(&history::create_tracking_table_sql(Dialect::Postgres))
            .await?;
        Ok(())
    }

    async fn ensure_migration_table_compatibility(&self) -> Result<()> {
        let sql = r#"
            SELECT character_maximum_length::int4
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1 AND column_name = 'id'
        "#;
        let id_length: Option<Option<i32>> = sqlx::query_scalar(sql)
            .bind(TRACKING_TABLE)
            .fetch_optional(&self.pool().await)
            .await?;

        let table = Dialect::Postgres.quote_ident(TRACKING_TABLE);
        if let Some(Some(length)) = id_length {
            if length < 255 {
                tracing::info!(length, "Widening migrations table id column");
                self.execute_query(&format!(
                    "ALTER TABLE {} ALTER COLUMN id TYPE VARCHAR(255)",
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
        let result = sqlx::query(&history::cleanup_broken_records_sql(Dialect::Postgres))
            .bind(older_than)
            .execute(&self.pool().await)
            .await?;
        Ok(result.rows_affected())
    }

    async fn get_applied_migrations(&self) -> Result<Vec<AppliedMigration>> {
        Ok(
            sqlx::query_as::<_, AppliedMigration>(&history::applied_migrations_sql(Dialect::Postgres))
                .fetch_all(&self.pool().await)
                .await?,
        )
    }

    async fn record_migration(&self, record: &MigrationRecord) -> Result<()> {
        sqlx::query(&history::record_migration_sql(Dialect::Postgres))
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
        let schema = self.active_namespace().await;
        self.tables_in_schema(&schema).await
    }

    async fn get_table_columns(&self, table: &str) -> Result<Vec<SchemaColumn>> {
        let sql = r#"
            SELECT
                c.column_name::text AS column_name,
                CASE
                    WHEN c.data_type = 'USER-DEFINED' THEN c.udt_name::text
                    WHEN c.data_type = 'ARRAY' THEN substring(c.udt_name::text from 2) || '[]'
                    WHEN c.character_maximum_length IS NOT NULL
                        THEN c.data_type::text || '(' || c.character_maximum_length::text || ')'
                    WHEN c.data_type = 'numeric' AND c.numeric_precision IS NOT NULL
                        THEN 'numeric(' || c.numeric_precision::text || ','
                            || COALESCE(c.numeric_scale, 0)::text || ')'
                    ELSE c.data_type::text
                END AS data_type,
                c.is_nullable::text AS is_nullable,
                c.column_default::text AS column_default,
                EXISTS (
                    SELECT 1
                    FROM information_schema.table_constraints tc
                    JOIN information_schema.key_column_usage kcu
                        ON tc.constraint_name = kcu.constraint_name
                        AND tc.table_schema = kcu.table_schema
                        AND tc.table_name = kcu.table_name
                    WHERE tc.constraint_type = 'PRIMARY KEY'
                        AND tc.table_schema = c.table_schema
                        AND tc.table_name = c.table_name
                        AND kcu.column_name = c.column_name
                ) AS is_primary,
                EXISTS (
                    SELECT 1
                    FROM information_schema.table_constraints tc
                    JOIN information_schema.key_column_usage kcu
                        ON tc.constraint_name = kcu.constraint_name
                        AND tc.table_schema = kcu.table_schema
                        AND tc.table_name = kcu.table_name
                    WHERE tc.constraint_type = 'UNIQUE'
                        AND tc.table_schema = c.table_schema
                        AND tc.table_name = c.table_name
                        AND kcu.column_name = c.column_name
                ) AS is_unique
            FROM information_schema.columns c
            WHERE c.table_schema = current_schema() AND c.table_name = $1
            ORDER BY c.ordinal_position
        "#;

        let rows = sqlx::query_as::<_, ColumnRow>(sql)
            .bind(table)
            .fetch_all(&self.pool().await)
            .await?;
        let foreign_keys = self.foreign_keys(table).await?;

        let columns = rows
            .into_iter()
            .map(|row| {
                let sequence_backed = row
                    .column_default
                    .as_deref()
                    .map_or(false, |d| d.starts_with("nextval("));
                let references = foreign_keys
                    .iter()
                    .find(|fk| fk.column_name == row.column_name)
                    .map(|fk| ForeignKeyRef {
                        table: fk.ref_table.clone(),
                        column: Some(fk.ref_column.clone()),
                        on_delete: Some(fk.delete_rule.clone()).filter(|r| r != "NO ACTION"),
                    });

                SchemaColumn {
                    name: row.column_name,
                    data_type: row.data_type,
                    nullable: row.is_nullable == "YES",
                    // a sequence default is serial sugar, not a declared default
                    default: if sequence_backed { None } else { row.column_default },
                    primary_key: row.is_primary,
                    unique: row.is_unique,
                    auto_increment: sequence_backed,
                    references,
                }
            })
            .collect();

        Ok(columns)
    }

    async fn get_current_enums(&self) -> Result<Vec<SchemaEnum>> {
        let sql = r#"
            SELECT t.typname::text AS name, e.enumlabel::text AS value
            FROM pg_type t
            JOIN pg_enum e ON e.enumtypid = t.oid
            JOIN pg_namespace n ON n.oid = t.typnamespace
            WHERE n.nspname = current_schema()
            ORDER BY t.typname, e.enumsortorder
        "#;
        let rows = sqlx::query_as::<_, EnumRow>(sql)
            .fetch_all(&self.pool().await)
            .await?;

        let mut enums: IndexMap<String, Vec<String>> = IndexMap::new();
        for row in rows {
            enums.entry(row.name).or_default().push(row.value);
        }

        Ok(enums
            .into_iter()
            .map(|(name, values)| SchemaEnum { name, values })
            .collect())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let sql = r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = current_schema() AND lower(table_name) = lower($1)
            )
        "#;
        Ok(sqlx::query_scalar(sql)
            .bind(table)
            .fetch_one(&self.pool().await)
            .await?)
    }

    async fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        let sql = r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.columns
                WHERE table_schema = current_schema()
                    AND lower(table_name) = lower($1)
                    AND lower(column_name) = lower($2)
            )
        "#;
        Ok(sqlx::query_scalar(sql)
            .bind(table)
            .bind(column)
            .fetch_one(&self.pool().await)
            .await?)
    }

    async fn get_table_row_count(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", Dialect::Postgres.quote_ident(table));
        Ok(sqlx::query_scalar(&sql).fetch_one(&self.pool().await).await?)
    }

    async fn count_duplicate_groups(&self, table: &str, columns: &[String]) -> Result<i64> {
        let sql = duplicate_groups_sql(Dialect::Postgres, table, columns);
        Ok(sqlx::query_scalar(&sql).fetch_one(&self.pool().await).await?)
    }

    async fn get_table_data(&self, table: &str) -> Result<Vec<serde_json::Value>> {
        let sql = format!(
            "SELECT to_jsonb(t)::text AS row_json FROM {} t",
            Dialect::Postgres.quote_ident(table)
        );
        let rows: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&self.pool().await).await?;
        decode_row_json(rows)
    }

    async fn drop_tables(&self, tables: &[String]) -> Result<()> {
        let pool = self.pool().await;
        for table in tables {
            pool.execute(Dialect::Postgres.drop_table(table).as_str()).await?;
        }
        Ok(())
    }

    async fn drop_enum(&self, name: &str) -> Result<()> {
        if let Some(sql) = Dialect::Postgres.drop_enum(name) {
            self.execute_query(&sql).await?;
        }
        Ok(())
    }

    fn default_namespace(&self) -> String {
        self.default_schema.clone()
    }

    async fn active_namespace(&self) -> String {
        self.active.read().await.clone()
    }

    async fn set_active_schema(&self, namespace: &str) -> Result<()> {
        if *self.active.read().await == namespace {
            return Ok(());
        }

        let pool = self.connect_to_schema(namespace).await?;
        let previous = std::mem::replace(&mut *self.pool.write().await, pool);
        previous.close().await;
        *self.active.write().await = namespace.to_string();

        tracing::info!(schema = namespace, "Switched search_path");
        Ok(())
    }

    async fn create_branch_namespace(&self, source: &str, target: &str) -> Result<()> {
        let tables = self.tables_in_schema(source).await?;
        let pg = Dialect::Postgres;

        let mut statements = vec![format!("CREATE SCHEMA {}", pg.quote_ident(target))];
        for table in &tables {
            let from = format!("{}.{}", pg.quote_ident(source), pg.quote_ident(table));
            let to = format!("{}.{}", pg.quote_ident(target), pg.quote_ident(table));
            statements.push(format!("CREATE TABLE {} (LIKE {} INCLUDING ALL)", to, from));
            statements.push(format!("INSERT INTO {} SELECT * FROM {}", to, from));
        }

        self.execute_migration(&statements).await.map_err(|e| {
            Error::branch(format!("Failed to copy schema '{}' to '{}': {}", source, target, e))
        })?;

        tracing::info!(source, target, tables = tables.len(), "Cloned schema for branch");
        Ok(())
    }

    async fn drop_branch_namespace(&self, namespace: &str) -> Result<()> {
        if namespace == self.default_schema {
            return Err(Error::branch("The default schema cannot be dropped"));
        }
        if *self.active.read().await == namespace {
            return Err(Error::branch(format!("Schema '{}' is in use", namespace)));
        }

        self.execute_query(&format!(
            "DROP SCHEMA IF EXISTS {} CASCADE",
            Dialect::Postgres.quote_ident(namespace)
        ))
        .await?;
        Ok(())
    }
}

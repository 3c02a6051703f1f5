//! Tracking-table rows
//!
//! A migration is applied iff its row has `finished_at` set and no
//! `rolled_back_at`. Rows are only written after the migration's transaction
//! has committed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::db::dialect::Dialect;

/// Table the engine records applied migrations in
pub const TRACKING_TABLE: &str = "_graft_migrations";

/// Rows with no `finished_at` older than this are crashed runs and get purged
pub const STALE_RECORD_HOURS: i64 = 1;

/// An applied migration as read back from the tracking table
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct AppliedMigration {
    pub id: String,
    pub checksum: String,
    pub migration_name: String,
    pub finished_at: DateTime<Utc>,
}

/// A row to write once a migration has committed
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    pub id: String,
    pub checksum: String,
    pub migration_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub applied_steps_count: i32,
    pub logs: Option<String>,
}

/// `CREATE TABLE IF NOT EXISTS` for the tracking table in a dialect
pub fn create_tracking_table_sql(dialect: Dialect) -> String {
    let (timestamp, now) = match dialect {
        Dialect::Postgres => ("TIMESTAMPTZ", "NOW()"),
        Dialect::MySql => ("DATETIME(6)", "CURRENT_TIMESTAMP(6)"),
        Dialect::Sqlite => ("TIMESTAMP", "CURRENT_TIMESTAMP"),
    };

    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
    id VARCHAR(255) PRIMARY KEY,
    checksum VARCHAR(64) NOT NULL,
    finished_at {ts},
    migration_name VARCHAR(255) NOT NULL,
    logs TEXT,
    rolled_back_at {ts},
    started_at {ts} NOT NULL DEFAULT {now},
    applied_steps_count INTEGER NOT NULL DEFAULT 0
)",
        table = dialect.quote_ident(TRACKING_TABLE),
        ts = timestamp,
        now = now,
    )
}

/// Upsert of one tracking row, with placeholders in column order:
/// id, checksum, finished_at, migration_name, logs, started_at, applied_steps_count
pub fn record_migration_sql(dialect: Dialect) -> String {
    let columns = "id, checksum, finished_at, migration_name, logs, started_at, applied_steps_count";
    let values = (1..=7)
        .map(|n| dialect.placeholder(n))
        .collect::<Vec<_>>()
        .join(", ");
    let table = dialect.quote_ident(TRACKING_TABLE);

    match dialect {
        Dialect::MySql => format!(
            "INSERT INTO {} ({}) VALUES ({}) ON DUPLICATE KEY UPDATE \
             checksum = VALUES(checksum), finished_at = VALUES(finished_at), \
             migration_name = VALUES(migration_name), logs = VALUES(logs), \
             rolled_back_at = NULL, started_at = VALUES(started_at), \
             applied_steps_count = VALUES(applied_steps_count)",
            table, columns, values
        ),
        Dialect::Postgres | Dialect::Sqlite => format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT (id) DO UPDATE SET \
             checksum = excluded.checksum, finished_at = excluded.finished_at, \
             migration_name = excluded.migration_name, logs = excluded.logs, \
             rolled_back_at = NULL, started_at = excluded.started_at, \
             applied_steps_count = excluded.applied_steps_count",
            table, columns, values
        ),
    }
}

/// Applied rows in id order
pub fn applied_migrations_sql(dialect: Dialect) -> String {
    format!(
        "SELECT id, checksum, migration_name, finished_at FROM {} \
         WHERE finished_at IS NOT NULL AND rolled_back_at IS NULL ORDER BY id",
        dialect.quote_ident(TRACKING_TABLE)
    )
}

/// Purge of unfinished rows started before the bound placeholder
pub fn cleanup_broken_records_sql(dialect: Dialect) -> String {
    format!(
        "DELETE FROM {} WHERE finished_at IS NULL AND started_at < {}",
        dialect.quote_ident(TRACKING_TABLE),
        dialect.placeholder(1)
    )
}

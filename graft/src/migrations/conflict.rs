//! Pre-apply conflict detection
//!
//! Pending migration SQL is read statement by statement and checked against
//! the live database for operations that would fail or lose data. Tables
//! created or dropped earlier in the same batch are remembered, so a batch
//! that creates `users` and then references it is not flagged.

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::db::adapter::DatabaseAdapter;
use crate::db::executor;
use crate::error::Result;
use crate::migrations::file::Migration;
use crate::migrations::history::TRACKING_TABLE;
use crate::schema::scanner;
use crate::utils::naming::unquote_identifier;
use crate::utils::patterns::SqlPatterns;

/// Words that start a table constraint rather than a column in `ADD ...`
const ADD_CONSTRAINT_WORDS: &[&str] = &[
    "CONSTRAINT", "FOREIGN", "PRIMARY", "UNIQUE", "CHECK", "INDEX", "KEY",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    TableExists,
    NotNullConstraint,
    ForeignKey,
    UniqueConstraint,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::TableExists => "table_exists",
            ConflictKind::NotNullConstraint => "not_null_constraint",
            ConflictKind::ForeignKey => "foreign_key",
            ConflictKind::UniqueConstraint => "unique_constraint",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// A hazard found in pending migration SQL
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationConflict {
    pub kind: ConflictKind,
    /// Migration the offending statement belongs to
    pub migration_id: Option<String>,
    pub table: String,
    pub column: Option<String>,
    pub description: String,
    pub remedies: Vec<String>,
    pub severity: Severity,
}

impl MigrationConflict {
    /// Blocking conflicts cannot be forced through
    pub fn is_blocking(&self) -> bool {
        self.kind == ConflictKind::TableExists
    }

    fn table_exists(table: &str) -> Self {
        Self {
            kind: ConflictKind::TableExists,
            migration_id: None,
            table: table.to_string(),
            column: None,
            description: format!("Table '{}' already exists in the database", table),
            remedies: vec![
                "Drop the existing table manually if it is safe to do so".to_string(),
                "Rename the table in your schema to avoid the clash".to_string(),
                "Reset the database if its history is out of sync with the migrations".to_string(),
            ],
            severity: Severity::Error,
        }
    }

    fn not_null(table: &str, column: &str, rows: i64) -> Self {
        Self {
            kind: ConflictKind::NotNullConstraint,
            migration_id: None,
            table: table.to_string(),
            column: Some(column.to_string()),
            description: format!(
                "Cannot add NOT NULL column '{}' to table '{}' which contains {} existing rows",
                column, table, rows
            ),
            remedies: vec![
                format!(
                    "Add a DEFAULT value: ALTER TABLE \"{}\" ADD COLUMN \"{}\" <type> NOT NULL DEFAULT <value>;",
                    table, column
                ),
                format!(
                    "Add the column as nullable first: ALTER TABLE \"{}\" ADD COLUMN \"{}\" <type>;",
                    table, column
                ),
                "Update existing rows, then add the NOT NULL constraint in a follow-up migration"
                    .to_string(),
            ],
            severity: Severity::Error,
        }
    }

    fn foreign_key(table: &str, referenced: &str) -> Self {
        Self {
            kind: ConflictKind::ForeignKey,
            migration_id: None,
            table: table.to_string(),
            column: None,
            description: format!(
                "Foreign key on '{}' references table '{}' which does not exist",
                table, referenced
            ),
            remedies: vec![
                format!("Create table '{}' first in an earlier migration", referenced),
                "Remove the foreign key constraint and add it in a later migration".to_string(),
                "Check that the referenced table name is spelled correctly".to_string(),
            ],
            severity: Severity::Error,
        }
    }

    fn unique(table: &str, columns: &[String], groups: i64) -> Self {
        let columns = columns.join(", ");
        Self {
            kind: ConflictKind::UniqueConstraint,
            migration_id: None,
            table: table.to_string(),
            column: Some(columns.clone()),
            description: format!(
                "Cannot add UNIQUE constraint on ({}) in table '{}': {} duplicate value group(s) exist",
                columns, table, groups
            ),
            remedies: vec![
                format!("Remove or update the duplicate rows in '{}' first", table),
                "Use a partial unique index if only some rows must be unique".to_string(),
            ],
            severity: Severity::Error,
        }
    }

    /// One line for menus and logs
    pub fn summary(&self) -> String {
        match &self.migration_id {
            Some(id) => format!("[{}] {} ({})", self.kind, self.description, id),
            None => format!("[{}] {}", self.kind, self.description),
        }
    }
}

/// Tables created and dropped by statements already seen in the batch
#[derive(Debug, Default)]
struct BatchContext {
    created: HashSet<String>,
    dropped: HashSet<String>,
}

impl BatchContext {
    fn mark_created(&mut self, table: &str) {
        let key = table.to_lowercase();
        self.dropped.remove(&key);
        self.created.insert(key);
    }

    fn mark_dropped(&mut self, table: &str) {
        let key = table.to_lowercase();
        self.created.remove(&key);
        self.dropped.insert(key);
    }

    fn is_created(&self, table: &str) -> bool {
        self.created.contains(&table.to_lowercase())
    }

    fn is_dropped(&self, table: &str) -> bool {
        self.dropped.contains(&table.to_lowercase())
    }
}

/// Finds unsafe operations in migration SQL
pub struct ConflictDetector {
    adapter: Arc<dyn DatabaseAdapter>,
    patterns: Arc<SqlPatterns>,
}

impl ConflictDetector {
    pub fn new(adapter: Arc<dyn DatabaseAdapter>, patterns: Arc<SqlPatterns>) -> Self {
        Self { adapter, patterns }
    }

    /// Check a single SQL text on its own
    pub async fn detect(&self, sql: &str) -> Result<Vec<MigrationConflict>> {
        let mut batch = BatchContext::default();
        self.detect_in("<inline>", sql, &mut batch).await
    }

    /// Check pending migrations in order as one batch
    pub async fn detect_all(&self, migrations: &[Migration]) -> Result<Vec<MigrationConflict>> {
        let mut batch = BatchContext::default();
        let mut conflicts = Vec::new();

        for migration in migrations {
            let file = migration.path.display().to_string();
            let found = self.detect_in(&file, &migration.body, &mut batch).await?;
            conflicts.extend(found.into_iter().map(|mut c| {
                c.migration_id = Some(migration.id.clone());
                c
            }));
        }

        if !conflicts.is_empty() {
            tracing::warn!(count = conflicts.len(), "Migration conflicts detected");
        }
        Ok(conflicts)
    }

    async fn detect_in(
        &self,
        file: &str,
        sql: &str,
        batch: &mut BatchContext,
    ) -> Result<Vec<MigrationConflict>> {
        let mut conflicts = Vec::new();
        for statement in executor::migration_statements(file, sql)? {
            self.check_statement(&statement, batch, &mut conflicts).await?;
        }
        Ok(conflicts)
    }

    async fn check_statement(
        &self,
        statement: &str,
        batch: &mut BatchContext,
        conflicts: &mut Vec<MigrationConflict>,
    ) -> Result<()> {
        let patterns = &self.patterns;

        if let Some(caps) = patterns.create_table.captures(statement) {
            let table = unquote_identifier(caps.get(1).map_or("", |m| m.as_str()));
            if !table.eq_ignore_ascii_case(TRACKING_TABLE)
                && !batch.is_created(&table)
                && self.table_is_live(&table, batch).await?
            {
                conflicts.push(MigrationConflict::table_exists(&table));
            }
            batch.mark_created(&table);
            self.check_references(statement, &table, batch, conflicts).await?;
        } else if let Some(caps) = patterns.alter_table.captures(statement) {
            let table = unquote_identifier(caps.get(1).map_or("", |m| m.as_str()));
            let actions = caps.get(2).map_or("", |m| m.as_str());

            for (_, action) in scanner::split_top_level(actions, b',') {
                if let Some(unique) = patterns.add_unique.captures(action) {
                    let columns = split_columns(unique.get(1).map_or("", |m| m.as_str()));
                    self.check_unique(&table, &columns, batch, conflicts).await?;
                } else if let Some(add) = patterns.add_column.captures(action) {
                    let column = unquote_identifier(add.get(1).map_or("", |m| m.as_str()));
                    let definition = add.get(2).map_or("", |m| m.as_str());
                    if !ADD_CONSTRAINT_WORDS.contains(&column.to_uppercase().as_str()) {
                        self.check_not_null(&table, &column, definition, batch, conflicts)
                            .await?;
                    }
                }
                self.check_references(action, &table, batch, conflicts).await?;
            }
        } else if let Some(caps) = patterns.create_index.captures(statement) {
            if caps.get(1).is_some() {
                let table = unquote_identifier(caps.get(3).map_or("", |m| m.as_str()));
                let open = caps.get(0).map_or(0, |m| m.end() - 1);
                if let Some(close) = scanner::matching_paren(statement, open) {
                    let columns = split_columns(&statement[open + 1..close]);
                    self.check_unique(&table, &columns, batch, conflicts).await?;
                }
            }
        } else if let Some(caps) = patterns.drop_table.captures(statement) {
            for (_, name) in scanner::split_top_level(caps.get(1).map_or("", |m| m.as_str()), b',') {
                batch.mark_dropped(&unquote_identifier(name));
            }
        }

        Ok(())
    }

    /// Exists in the database and was not dropped earlier in the batch
    async fn table_is_live(&self, table: &str, batch: &BatchContext) -> Result<bool> {
        if batch.is_dropped(table) {
            return Ok(false);
        }
        self.adapter.table_exists(table).await
    }

    async fn check_not_null(
        &self,
        table: &str,
        column: &str,
        definition: &str,
        batch: &BatchContext,
        conflicts: &mut Vec<MigrationConflict>,
    ) -> Result<()> {
        let needs_value =
            self.patterns.not_null.is_match(definition) && !self.patterns.has_column_default(definition);
        if !needs_value || batch.is_created(table) || !self.table_is_live(table, batch).await? {
            return Ok(());
        }

        let rows = self.adapter.get_table_row_count(table).await?;
        if rows > 0 {
            conflicts.push(MigrationConflict::not_null(table, column, rows));
        }
        Ok(())
    }

    async fn check_references(
        &self,
        text: &str,
        owner: &str,
        batch: &BatchContext,
        conflicts: &mut Vec<MigrationConflict>,
    ) -> Result<()> {
        for caps in self.patterns.references.captures_iter(text) {
            let referenced = unquote_identifier(caps.get(1).map_or("", |m| m.as_str()));
            if referenced.eq_ignore_ascii_case(owner) || batch.is_created(&referenced) {
                continue;
            }
            if !self.table_is_live(&referenced, batch).await? {
                conflicts.push(MigrationConflict::foreign_key(owner, &referenced));
            }
        }
        Ok(())
    }

    async fn check_unique(
        &self,
        table: &str,
        columns: &[String],
        batch: &BatchContext,
        conflicts: &mut Vec<MigrationConflict>,
    ) -> Result<()> {
        if columns.is_empty() || batch.is_created(table) || !self.table_is_live(table, batch).await? {
            return Ok(());
        }
        for column in columns {
            if !self.adapter.column_exists(table, column).await? {
                return Ok(());
            }
        }

        let groups = self.adapter.count_duplicate_groups(table, columns).await?;
        if groups > 0 {
            conflicts.push(MigrationConflict::unique(table, columns, groups));
        }
        Ok(())
    }
}

/// Column names of a `(a, "b" DESC)` list
fn split_columns(list: &str) -> Vec<String> {
    scanner::split_top_level(list, b',')
        .into_iter()
        .filter(|(_, c)| !c.is_empty())
        .map(|(_, c)| {
            let name = c.split_whitespace().next().unwrap_or(c);
            unquote_identifier(name)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::dialect::Dialect;
    use crate::error::Error;
    use crate::migrations::history::{AppliedMigration, MigrationRecord};
    use crate::schema::types::{SchemaColumn, SchemaEnum};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use pretty_assertions::assert_eq;

    /// Every table and column exists; counting duplicates always fails
    struct BrokenDuplicateCount;

    #[async_trait]
    impl DatabaseAdapter for BrokenDuplicateCount {
        fn dialect(&self) -> Dialect {
            Dialect::Postgres
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        async fn close(&self) {}
        async fn execute_query(&self, _sql: &str) -> Result<u64> {
            unreachable!()
        }
        async fn execute_migration(&self, _statements: &[String]) -> Result<()> {
            unreachable!()
        }
        async fn create_migrations_table(&self) -> Result<()> {
            unreachable!()
        }
        async fn ensure_migration_table_compatibility(&self) -> Result<()> {
            unreachable!()
        }
        async fn cleanup_broken_migration_records(&self, _older_than: DateTime<Utc>) -> Result<u64> {
            unreachable!()
        }
        async fn get_applied_migrations(&self) -> Result<Vec<AppliedMigration>> {
            unreachable!()
        }
        async fn record_migration(&self, _record: &MigrationRecord) -> Result<()> {
            unreachable!()
        }
        async fn get_all_table_names(&self) -> Result<Vec<String>> {
            unreachable!()
        }
        async fn get_table_columns(&self, _table: &str) -> Result<Vec<SchemaColumn>> {
            unreachable!()
        }
        async fn get_current_enums(&self) -> Result<Vec<SchemaEnum>> {
            unreachable!()
        }
        async fn table_exists(&self, _table: &str) -> Result<bool> {
            Ok(true)
        }
        async fn column_exists(&self, _table: &str, _column: &str) -> Result<bool> {
            Ok(true)
        }
        async fn get_table_row_count(&self, _table: &str) -> Result<i64> {
            Ok(0)
        }
        async fn count_duplicate_groups(&self, _table: &str, _columns: &[String]) -> Result<i64> {
            Err(Error::DatabaseError("permission denied for table users".to_string()))
        }
        async fn get_table_data(&self, _table: &str) -> Result<Vec<serde_json::Value>> {
            unreachable!()
        }
        async fn drop_tables(&self, _tables: &[String]) -> Result<()> {
            unreachable!()
        }
        async fn drop_enum(&self, _name: &str) -> Result<()> {
            unreachable!()
        }
        fn default_namespace(&self) -> String {
            "public".to_string()
        }
        async fn active_namespace(&self) -> String {
            "public".to_string()
        }
        async fn set_active_schema(&self, _namespace: &str) -> Result<()> {
            unreachable!()
        }
        async fn create_branch_namespace(&self, _source: &str, _target: &str) -> Result<()> {
            unreachable!()
        }
        async fn drop_branch_namespace(&self, _namespace: &str) -> Result<()> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn duplicate_check_failures_propagate() {
        let detector = ConflictDetector::new(Arc::new(BrokenDuplicateCount), Arc::new(SqlPatterns::new().unwrap()));

        let result = detector
            .detect("ALTER TABLE users ADD CONSTRAINT users_email_key UNIQUE (email);")
            .await;

        assert!(matches!(result, Err(Error::DatabaseError(_))), "got {:?}", result);
    }

    #[test]
    fn only_table_exists_blocks() {
        assert!(MigrationConflict::table_exists("users").is_blocking());
        assert!(!MigrationConflict::not_null("users", "age", 3).is_blocking());
        assert!(!MigrationConflict::foreign_key("posts", "users").is_blocking());
        assert!(!MigrationConflict::unique("users", &["email".to_string()], 1).is_blocking());
    }

    #[test]
    fn kinds_use_wire_names() {
        assert_eq!(ConflictKind::NotNullConstraint.to_string(), "not_null_constraint");
        assert_eq!(
            serde_json::to_value(ConflictKind::UniqueConstraint).unwrap(),
            serde_json::json!("unique_constraint")
        );
    }

    #[test]
    fn batch_context_tracks_create_then_drop() {
        let mut batch = BatchContext::default();
        batch.mark_created("Users");
        assert!(batch.is_created("users"));
        batch.mark_dropped("USERS");
        assert!(!batch.is_created("users"));
        assert!(batch.is_dropped("users"));
    }

    #[test]
    fn splits_index_columns() {
        assert_eq!(
            split_columns("\"email\", tenant_id DESC"),
            vec!["email".to_string(), "tenant_id".to_string()]
        );
    }
}

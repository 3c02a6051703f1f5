//! Schema difference calculator
//!
//! This module compares two schema snapshots and calculates the differences.

use serde::{Deserialize, Serialize};

use crate::db::dialect::Dialect;
use crate::schema::normalize;
use crate::schema::types::{sort_by_dependencies, SchemaColumn, SchemaEnum, SchemaSnapshot, SchemaTable};

/// A single semantic change to an existing column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnChange {
    Type { from: String, to: String },
    Nullability { nullable: bool },
    Default { from: Option<String>, to: Option<String> },
}

/// Changes to one column present on both sides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDiff {
    pub column: String,
    pub old_type: String,
    pub new_type: String,
    pub kinds: Vec<ColumnChange>,
    /// Rendered ALTER statements; empty when the dialect cannot express the change
    pub changes: Vec<String>,
}

/// Changes to one table present on both sides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDiff {
    pub table: String,
    pub new_columns: Vec<SchemaColumn>,
    pub dropped_columns: Vec<String>,
    pub column_changes: Vec<ColumnDiff>,
}

impl TableDiff {
    pub fn is_empty(&self) -> bool {
        self.new_columns.is_empty()
            && self.dropped_columns.is_empty()
            && self.column_changes.iter().all(|c| c.changes.is_empty())
    }
}

/// Represents changes needed to move `current` to `target`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub new_tables: Vec<SchemaTable>,
    pub dropped_tables: Vec<String>,
    pub modified_tables: Vec<TableDiff>,
    pub new_enums: Vec<SchemaEnum>,
    pub dropped_enums: Vec<String>,
}

impl SchemaDiff {
    /// Generate a schema diff between two snapshots. `target` should already
    /// be adapted to the dialect (see [`Dialect::adapt_snapshot`]).
    pub fn generate(current: &SchemaSnapshot, target: &SchemaSnapshot, dialect: Dialect) -> Self {
        let mut diff = SchemaDiff::default();

        let created = target
            .tables
            .iter()
            .filter(|(key, _)| !current.tables.contains_key(*key))
            .map(|(_, table)| table.clone())
            .collect();
        diff.new_tables = sort_by_dependencies(created);

        // Referencing tables are dropped before the tables they reference
        let removed = current
            .tables
            .iter()
            .filter(|(key, _)| !target.tables.contains_key(*key))
            .map(|(_, table)| table.clone())
            .collect();
        diff.dropped_tables = sort_by_dependencies(removed)
            .into_iter()
            .rev()
            .map(|table| table.name)
            .collect();

        for (key, table) in &current.tables {
            if let Some(target_table) = target.tables.get(key) {
                let table_diff = diff_table(table, target_table, dialect);
                if !table_diff.is_empty() {
                    diff.modified_tables.push(table_diff);
                }
            }
        }

        // Dialects without named enum types never report them from the catalog
        if dialect.supports_enum_types() {
            for (key, schema_enum) in &target.enums {
                if !current.enums.contains_key(key) {
                    diff.new_enums.push(schema_enum.clone());
                }
            }
            for (key, schema_enum) in &current.enums {
                if !target.enums.contains_key(key) {
                    diff.dropped_enums.push(schema_enum.name.clone());
                }
            }
        }

        diff
    }

    /// False when applying this diff would not change anything
    pub fn has_changes(&self) -> bool {
        !self.new_tables.is_empty()
            || !self.dropped_tables.is_empty()
            || !self.new_enums.is_empty()
            || !self.dropped_enums.is_empty()
            || self.modified_tables.iter().any(|t| !t.is_empty())
    }

    /// One line per change, for logs and previews
    pub fn summary(&self) -> Vec<String> {
        let mut lines = Vec::new();

        lines.extend(self.new_enums.iter().map(|e| format!("+ enum {}", e.name)));
        lines.extend(self.new_tables.iter().map(|t| format!("+ table {}", t.name)));
        for table in &self.modified_tables {
            lines.extend(
                table
                    .new_columns
                    .iter()
                    .map(|c| format!("+ column {}.{}", table.table, c.name)),
            );
            lines.extend(
                table
                    .dropped_columns
                    .iter()
                    .map(|c| format!("- column {}.{}", table.table, c)),
            );
            lines.extend(
                table
                    .column_changes
                    .iter()
                    .filter(|c| !c.changes.is_empty())
                    .map(|c| format!("~ column {}.{}", table.table, c.column)),
            );
        }
        lines.extend(self.dropped_tables.iter().map(|t| format!("- table {}", t)));
        lines.extend(self.dropped_enums.iter().map(|e| format!("- enum {}", e)));

        lines
    }
}

fn diff_table(current: &SchemaTable, target: &SchemaTable, dialect: Dialect) -> TableDiff {
    let new_columns = target
        .columns
        .iter()
        .filter(|c| !current.has_column(&c.name))
        .cloned()
        .collect();

    let dropped_columns = current
        .columns
        .iter()
        .filter(|c| !target.has_column(&c.name))
        .map(|c| c.name.clone())
        .collect();

    let mut column_changes = Vec::new();
    for target_column in &target.columns {
        let Some(current_column) = current.column(&target_column.name) else {
            continue;
        };

        let kinds = column_change_kinds(current, current_column, target, target_column);
        if kinds.is_empty() {
            continue;
        }

        let changes = dialect.alter_column(&target.name, target_column, &kinds);
        if changes.is_empty() {
            tracing::warn!(
                table = %target.name,
                column = %target_column.name,
                dialect = %dialect,
                "Column change cannot be expressed as ALTER on this dialect, skipping"
            );
        }

        column_changes.push(ColumnDiff {
            column: target_column.name.clone(),
            old_type: current_column.data_type.clone(),
            new_type: target_column.data_type.clone(),
            kinds,
            changes,
        });
    }

    TableDiff {
        table: target.name.clone(),
        new_columns,
        dropped_columns,
        column_changes,
    }
}

/// Type, nullability and default changes, each only when semantically different
fn column_change_kinds(
    current_table: &SchemaTable,
    current: &SchemaColumn,
    target_table: &SchemaTable,
    target: &SchemaColumn,
) -> Vec<ColumnChange> {
    let mut kinds = Vec::new();
    let serial = target.is_serial();

    if !serial && !normalize::types_equivalent(&current.data_type, &target.data_type) {
        kinds.push(ColumnChange::Type {
            from: current.data_type.clone(),
            to: target.data_type.clone(),
        });
    }

    let primary_key = serial
        || current.is_serial()
        || target_table.is_primary_key(target)
        || current_table.is_primary_key(current);
    if !primary_key && current.nullable != target.nullable {
        kinds.push(ColumnChange::Nullability {
            nullable: target.nullable,
        });
    }

    // Sequence-backed defaults only exist on one side of a serial column
    let sequence_default = serial || current.is_serial();
    if !sequence_default
        && !normalize::defaults_equivalent(current.default.as_deref(), target.default.as_deref())
    {
        kinds.push(ColumnChange::Default {
            from: current.default.clone(),
            to: target.default.clone(),
        });
    }

    kinds
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn snapshot(tables: Vec<SchemaTable>) -> SchemaSnapshot {
        let mut snapshot = SchemaSnapshot::new();
        for table in tables {
            snapshot.insert_table(table);
        }
        snapshot
    }

    fn users_target() -> SchemaTable {
        SchemaTable::new("users")
            .with_column(SchemaColumn::new("id", "SERIAL").primary())
            .with_column(SchemaColumn::new("name", "VARCHAR(255)").not_null())
    }

    #[test]
    fn identical_schemas_have_no_changes() {
        let schema = snapshot(vec![users_target()]);
        let diff = SchemaDiff::generate(&schema, &schema, Dialect::Postgres);
        assert!(!diff.has_changes());
        assert_eq!(diff, SchemaDiff::default());
    }

    #[test]
    fn new_table_against_empty_database() {
        let diff = SchemaDiff::generate(&SchemaSnapshot::new(), &snapshot(vec![users_target()]), Dialect::Postgres);
        assert_eq!(diff.new_tables.len(), 1);
        assert_eq!(diff.new_tables[0].name, "users");
        assert!(diff.dropped_tables.is_empty());
        assert!(diff.modified_tables.is_empty());
    }

    #[test]
    fn catalog_spelling_is_not_a_change() {
        let live = SchemaTable::new("users")
            .with_column({
                let mut id = SchemaColumn::new("id", "integer").primary();
                id.default = Some("nextval('users_id_seq'::regclass)".to_string());
                id.auto_increment = true;
                id
            })
            .with_column(SchemaColumn::new("name", "character varying(255)").not_null());

        let diff = SchemaDiff::generate(&snapshot(vec![live]), &snapshot(vec![users_target()]), Dialect::Postgres);
        assert!(!diff.has_changes(), "unexpected diff: {:?}", diff.summary());
    }

    #[test]
    fn table_names_match_case_insensitively() {
        let mut live = users_target();
        live.name = "USERS".to_string();
        let diff = SchemaDiff::generate(&snapshot(vec![live]), &snapshot(vec![users_target()]), Dialect::Postgres);
        assert!(!diff.has_changes());
    }

    #[test]
    fn detects_column_level_changes() {
        let live = SchemaTable::new("users")
            .with_column(SchemaColumn::new("id", "integer").primary())
            .with_column(SchemaColumn::new("name", "text"))
            .with_column(SchemaColumn::new("legacy", "text"));
        let target = SchemaTable::new("users")
            .with_column(SchemaColumn::new("id", "INTEGER").primary())
            .with_column(SchemaColumn::new("name", "TEXT").not_null().default_value("'anon'"))
            .with_column(SchemaColumn::new("email", "TEXT"));

        let diff = SchemaDiff::generate(&snapshot(vec![live]), &snapshot(vec![target]), Dialect::Postgres);
        assert!(diff.has_changes());

        let users = &diff.modified_tables[0];
        assert_eq!(users.new_columns[0].name, "email");
        assert_eq!(users.dropped_columns, vec!["legacy".to_string()]);
        assert_eq!(users.column_changes.len(), 1);
        assert_eq!(
            users.column_changes[0].kinds,
            vec![
                ColumnChange::Nullability { nullable: false },
                ColumnChange::Default {
                    from: None,
                    to: Some("'anon'".to_string())
                },
            ]
        );
        assert_eq!(
            users.column_changes[0].changes,
            vec![
                "ALTER TABLE \"users\" ALTER COLUMN \"name\" SET NOT NULL;".to_string(),
                "ALTER TABLE \"users\" ALTER COLUMN \"name\" SET DEFAULT 'anon';".to_string(),
            ]
        );
    }

    #[test]
    fn primary_key_nullability_is_never_diffed() {
        let mut live_id = SchemaColumn::new("id", "uuid");
        live_id.nullable = true;
        let mut live = SchemaTable::new("tokens").with_column(live_id);
        live.primary_key = vec!["id".to_string()];

        let mut target = SchemaTable::new("tokens").with_column(SchemaColumn::new("id", "UUID").not_null());
        target.primary_key = vec!["id".to_string()];

        let diff = SchemaDiff::generate(&snapshot(vec![live]), &snapshot(vec![target]), Dialect::Postgres);
        assert!(!diff.has_changes());
    }

    #[test]
    fn sqlite_column_alters_are_dropped() {
        let live = SchemaTable::new("t").with_column(SchemaColumn::new("n", "INTEGER"));
        let target = SchemaTable::new("t").with_column(SchemaColumn::new("n", "TEXT"));

        let diff = SchemaDiff::generate(&snapshot(vec![live]), &snapshot(vec![target]), Dialect::Sqlite);
        assert!(!diff.has_changes());
    }

    #[test]
    fn enums_partition_on_postgres() {
        let mut current = SchemaSnapshot::new();
        current.insert_enum(SchemaEnum {
            name: "old_status".to_string(),
            values: vec!["a".to_string()],
        });
        let mut target = SchemaSnapshot::new();
        target.insert_enum(SchemaEnum {
            name: "status".to_string(),
            values: vec!["on".to_string(), "off".to_string()],
        });

        let diff = SchemaDiff::generate(&current, &target, Dialect::Postgres);
        assert_eq!(diff.new_enums[0].name, "status");
        assert_eq!(diff.dropped_enums, vec!["old_status".to_string()]);

        let diff = SchemaDiff::generate(&current, &target, Dialect::MySql);
        assert!(!diff.has_changes());
    }

    #[test]
    fn new_tables_follow_foreign_keys() {
        let mut posts = SchemaTable::new("posts").with_column(SchemaColumn::new("id", "SERIAL").primary());
        posts.references = vec!["users".to_string()];
        let target = snapshot(vec![posts.clone(), users_target()]);

        let diff = SchemaDiff::generate(&SchemaSnapshot::new(), &target, Dialect::Postgres);
        let created: Vec<&str> = diff.new_tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(created, vec!["users", "posts"]);

        let diff = SchemaDiff::generate(&target, &SchemaSnapshot::new(), Dialect::Postgres);
        assert_eq!(diff.dropped_tables, vec!["posts".to_string(), "users".to_string()]);
    }

    #[test]
    fn serial_defaults_are_not_diffed_in_either_direction() {
        let mut live_id = SchemaColumn::new("id", "integer").primary();
        live_id.auto_increment = true;
        live_id.default = Some("nextval('users_id_seq'::regclass)".to_string());
        let live = SchemaTable::new("users").with_column(live_id);
        let target = SchemaTable::new("users").with_column(SchemaColumn::new("id", "INTEGER").primary());

        let diff = SchemaDiff::generate(&snapshot(vec![live]), &snapshot(vec![target]), Dialect::Postgres);
        assert!(!diff.has_changes(), "unexpected diff: {:?}", diff.summary());
    }

}

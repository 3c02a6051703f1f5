//! Type definitions for database schema objects
//!
//! Both sides of a diff use these types: the parser builds them from DDL files
//! and the introspector builds them from live catalogs.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::schema::normalize;

/// A full schema: tables and enum types, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    /// Keyed by lowercased table name
    pub tables: IndexMap<String, SchemaTable>,
    /// Keyed by lowercased enum name
    pub enums: IndexMap<String, SchemaEnum>,
}

impl SchemaSnapshot {
    /// Create a new empty snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table, returning any table it replaced
    pub fn insert_table(&mut self, table: SchemaTable) -> Option<SchemaTable> {
        self.tables.insert(table.name.to_lowercase(), table)
    }

    /// Add an enum, returning any enum it replaced
    pub fn insert_enum(&mut self, schema_enum: SchemaEnum) -> Option<SchemaEnum> {
        self.enums.insert(schema_enum.name.to_lowercase(), schema_enum)
    }

    /// Case-insensitive table lookup
    pub fn table(&self, name: &str) -> Option<&SchemaTable> {
        self.tables.get(&name.to_lowercase())
    }

    pub fn table_mut(&mut self, name: &str) -> Option<&mut SchemaTable> {
        self.tables.get_mut(&name.to_lowercase())
    }

    /// Case-insensitive enum lookup
    pub fn enum_type(&self, name: &str) -> Option<&SchemaEnum> {
        self.enums.get(&name.to_lowercase())
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.values().map(|t| t.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.enums.is_empty()
    }

    /// Rewrite columns typed with a declared enum into `replacement(enum)`.
    /// Used for dialects without named enum types.
    pub fn inline_enum_types<F>(&self, replacement: F) -> SchemaSnapshot
    where
        F: Fn(&SchemaEnum) -> String,
    {
        let mut snapshot = self.clone();
        for table in snapshot.tables.values_mut() {
            for column in &mut table.columns {
                if let Some(schema_enum) = self.enum_type(&column.data_type) {
                    column.data_type = replacement(schema_enum);
                }
            }
        }
        snapshot
    }
}

/// A foreign-key target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: Option<String>,
    pub on_delete: Option<String>,
}

/// Represents a database table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaTable {
    pub name: String,
    pub columns: Vec<SchemaColumn>,
    pub indexes: Vec<SchemaIndex>,
    /// Table-level constraints, kept verbatim for rendering
    pub constraints: Vec<String>,
    /// Columns named by a table-level `PRIMARY KEY (...)`
    pub primary_key: Vec<String>,
    /// Tables referenced by foreign keys, inline or table-level
    pub references: Vec<String>,
}

impl SchemaTable {
    /// Create a new table with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            constraints: Vec::new(),
            primary_key: Vec::new(),
            references: Vec::new(),
        }
    }

    /// Builder-style column append
    pub fn with_column(mut self, column: SchemaColumn) -> Self {
        self.columns.push(column);
        self
    }

    /// Case-insensitive column lookup
    pub fn column(&self, name: &str) -> Option<&SchemaColumn> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Whether a column is part of the primary key, inline or table-level
    pub fn is_primary_key(&self, column: &SchemaColumn) -> bool {
        column.primary_key
            || self
                .primary_key
                .iter()
                .any(|pk| pk.eq_ignore_ascii_case(&column.name))
    }
}

/// Represents a database column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaColumn {
    pub name: String,
    /// Type as written in DDL or as reported by the catalog
    pub data_type: String,
    pub nullable: bool,
    /// `None` when the column has no default; never a sentinel string
    pub default: Option<String>,
    pub primary_key: bool,
    pub unique: bool,
    pub auto_increment: bool,
    pub references: Option<ForeignKeyRef>,
}

impl SchemaColumn {
    /// A nullable column with no constraints
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            default: None,
            primary_key: false,
            unique: false,
            auto_increment: false,
            references: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn primary(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_value(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// `SERIAL`-family type or an explicit auto-increment marker
    pub fn is_serial(&self) -> bool {
        self.auto_increment || normalize::is_serial_type(&self.data_type)
    }
}

/// A `CREATE [UNIQUE] INDEX`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaIndex {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl SchemaTable {
    /// Lowercased names of the tables this one references, itself excluded
    pub fn dependencies(&self) -> Vec<String> {
        let own = self.name.to_lowercase();
        let mut deps: Vec<String> = Vec::new();
        let column_refs = self.columns.iter().filter_map(|c| c.references.as_ref()).map(|r| &r.table);
        for target in self.references.iter().chain(column_refs) {
            let key = bare_name(target);
            if key != own && !deps.contains(&key) {
                deps.push(key);
            }
        }
        deps
    }
}

/// `public.Users` and `Users` both become `users`
fn bare_name(name: &str) -> String {
    name.rsplit('.').next().unwrap_or(name).to_lowercase()
}

/// Order tables so every referenced table comes before the tables that
/// reference it. References to tables outside `tables` are ignored. When only
/// a cycle is left, the earliest declared table in it goes first.
pub fn sort_by_dependencies(tables: Vec<SchemaTable>) -> Vec<SchemaTable> {
    let names: HashSet<String> = tables.iter().map(|t| t.name.to_lowercase()).collect();
    let mut pending: Vec<(SchemaTable, Vec<String>)> = tables
        .into_iter()
        .map(|t| {
            let deps = t.dependencies().into_iter().filter(|d| names.contains(d)).collect();
            (t, deps)
        })
        .collect();

    let mut placed: HashSet<String> = HashSet::new();
    let mut sorted = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let next = pending
            .iter()
            .position(|(_, deps)| deps.iter().all(|d| placed.contains(d)))
            .unwrap_or(0);
        let (table, _) = pending.remove(next);
        placed.insert(table.name.to_lowercase());
        sorted.push(table);
    }
    sorted
}

/// A `CREATE TYPE ... AS ENUM`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEnum {
    pub name: String,
    pub values: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn lookups_ignore_case() {
        let mut snapshot = SchemaSnapshot::new();
        snapshot.insert_table(
            SchemaTable::new("Users").with_column(SchemaColumn::new("ID", "SERIAL").primary()),
        );

        let table = snapshot.table("users").unwrap();
        assert!(table.has_column("id"));
        assert!(table.is_primary_key(table.column("Id").unwrap()));
        assert!(table.column("id").unwrap().is_serial());
    }

    #[test]
    fn table_level_primary_key_counts() {
        let mut table = SchemaTable::new("memberships")
            .with_column(SchemaColumn::new("user_id", "INTEGER").not_null())
            .with_column(SchemaColumn::new("group_id", "INTEGER").not_null());
        table.primary_key = vec!["user_id".to_string(), "group_id".to_string()];

        assert!(table.is_primary_key(&table.columns[1]));
    }

    #[test]
    fn inline_enum_types_rewrites_only_enum_columns() {
        let mut snapshot = SchemaSnapshot::new();
        snapshot.insert_enum(SchemaEnum {
            name: "mood".to_string(),
            values: vec!["happy".to_string(), "sad".to_string()],
        });
        snapshot.insert_table(
            SchemaTable::new("people")
                .with_column(SchemaColumn::new("name", "TEXT"))
                .with_column(SchemaColumn::new("mood", "mood")),
        );

        let inlined = snapshot.inline_enum_types(|_| "TEXT".to_string());
        let people = inlined.table("people").unwrap();
        assert_eq!(people.column("mood").unwrap().data_type, "TEXT");
        assert_eq!(people.column("name").unwrap().data_type, "TEXT");
    }

    fn table(name: &str, refs: &[&str]) -> SchemaTable {
        let mut table = SchemaTable::new(name).with_column(SchemaColumn::new("id", "INTEGER").primary());
        table.references = refs.iter().map(|r| r.to_string()).collect();
        table
    }

    fn names(tables: &[SchemaTable]) -> Vec<&str> {
        tables.iter().map(|t| t.name.as_str()).collect()
    }

    #[test]
    fn referenced_tables_sort_first() {
        let sorted = sort_by_dependencies(vec![
            table("comments", &["posts", "users"]),
            table("posts", &["public.Users"]),
            table("users", &[]),
            table("tags", &[]),
        ]);
        assert_eq!(names(&sorted), vec!["users", "posts", "comments", "tags"]);
    }

    #[test]
    fn column_references_count_as_dependencies() {
        let mut posts = SchemaTable::new("posts");
        let mut author = SchemaColumn::new("author_id", "INTEGER");
        author.references = Some(ForeignKeyRef {
            table: "users".to_string(),
            column: Some("id".to_string()),
            on_delete: None,
        });
        posts.columns.push(author);

        let sorted = sort_by_dependencies(vec![posts, table("users", &[])]);
        assert_eq!(names(&sorted), vec!["users", "posts"]);
    }

    #[test]
    fn cycles_and_self_references_keep_declaration_order() {
        let sorted = sort_by_dependencies(vec![
            table("tree", &["tree", "missing"]),
            table("a", &["b"]),
            table("b", &["a"]),
        ]);
        assert_eq!(names(&sorted), vec!["tree", "a", "b"]);
    }

}

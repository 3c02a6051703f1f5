//! Dialect-specific SQL rendering
//!
//! Every piece of generated DDL goes through [`Dialect`], so the diff engine and
//! the generator never branch on the database themselves.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::schema::diff::ColumnChange;
use crate::schema::normalize;
use crate::schema::types::{SchemaColumn, SchemaEnum, SchemaIndex, SchemaSnapshot, SchemaTable};
use crate::utils::naming;

const INDENT: &str = "    ";

/// Supported database dialects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Dialect {
    /// Resolve the `database.driver` config value
    pub fn from_driver(driver: &str) -> Result<Self> {
        match driver.to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Dialect::Postgres),
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            "sqlite" | "sqlite3" => Ok(Dialect::Sqlite),
            other => Err(Error::ConfigError(format!(
                "Unsupported database driver: {}",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
            Dialect::Sqlite => "sqlite",
        }
    }

    /// Quote an identifier, doubling any embedded quote character
    pub fn quote_ident(&self, name: &str) -> String {
        match self {
            Dialect::MySql => format!("`{}`", name.replace('`', "``")),
            Dialect::Postgres | Dialect::Sqlite => format!("\"{}\"", name.replace('"', "\"\"")),
        }
    }

    pub fn quote_literal(value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// Whether the dialect has named enum types (`CREATE TYPE ... AS ENUM`)
    pub fn supports_enum_types(&self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    /// SQLite cannot change a column's type, nullability or default in place
    pub fn supports_column_alter(&self) -> bool {
        !matches!(self, Dialect::Sqlite)
    }

    /// Bind placeholder for the `n`th (1-based) parameter
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", n),
            Dialect::MySql | Dialect::Sqlite => "?".to_string(),
        }
    }

    /// Namespace (schema, database or file suffix) backing a branch
    pub fn branch_namespace(&self, branch: &str) -> String {
        match self {
            Dialect::Sqlite => branch.to_string(),
            Dialect::Postgres | Dialect::MySql => naming::truncate_identifier(
                &format!("graft_branch_{}", branch.replace('-', "_")),
                naming::max_identifier_length(*self),
            ),
        }
    }

    /// Map a declared schema onto what this dialect can store. Enum-typed
    /// columns are inlined and `SERIAL` sugar becomes an auto-increment flag
    /// where the dialect has no serial types.
    pub fn adapt_snapshot(&self, snapshot: &SchemaSnapshot) -> SchemaSnapshot {
        if *self == Dialect::Postgres {
            return snapshot.clone();
        }

        let mut adapted = snapshot.inline_enum_types(|e| self.inline_enum(e));
        for table in adapted.tables.values_mut() {
            for column in &mut table.columns {
                self.adapt_column(column);
            }
        }
        adapted
    }

    fn adapt_column(&self, column: &mut SchemaColumn) {
        if normalize::is_serial_type(&column.data_type) {
            column.data_type = match (self, normalize::normalize_type(&column.data_type).as_str()) {
                (Dialect::Sqlite, _) => "INTEGER".to_string(),
                (_, "BIGINT") => "BIGINT".to_string(),
                (_, "SMALLINT") => "SMALLINT".to_string(),
                _ => "INT".to_string(),
            };
            column.auto_increment = true;
            return;
        }

        if *self == Dialect::MySql {
            let mapped = match normalize::normalize_type(&column.data_type).as_str() {
                "TIMESTAMPTZ" => Some("TIMESTAMP"),
                "JSONB" => Some("JSON"),
                "UUID" => Some("CHAR(36)"),
                "BYTEA" => Some("BLOB"),
                _ => None,
            };
            if let Some(mapped) = mapped {
                column.data_type = mapped.to_string();
            }
        }
    }

    /// How an enum type is spelled on dialects without named enum types
    pub fn inline_enum(&self, schema_enum: &SchemaEnum) -> String {
        match self {
            Dialect::MySql => format!(
                "ENUM({})",
                schema_enum
                    .values
                    .iter()
                    .map(|v| Self::quote_literal(v))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Dialect::Postgres | Dialect::Sqlite => "TEXT".to_string(),
        }
    }

    fn render_type(&self, column: &SchemaColumn) -> String {
        if *self == Dialect::Postgres && column.auto_increment && !normalize::is_serial_type(&column.data_type) {
            match normalize::normalize_type(&column.data_type).as_str() {
                "SMALLINT" => return "SMALLSERIAL".to_string(),
                "INTEGER" => return "SERIAL".to_string(),
                "BIGINT" => return "BIGSERIAL".to_string(),
                _ => {}
            }
        }
        column.data_type.clone()
    }

    fn render_default(&self, default: &str) -> String {
        match self {
            Dialect::Sqlite if normalize::normalize_default(Some(default)).as_deref() == Some("CURRENT_TIMESTAMP") => {
                "CURRENT_TIMESTAMP".to_string()
            }
            _ => default.to_string(),
        }
    }

    fn render_reference(&self, column: &SchemaColumn) -> Option<String> {
        let reference = column.references.as_ref()?;
        let mut clause = format!("REFERENCES {}", self.quote_ident(&reference.table));
        if let Some(target) = &reference.column {
            clause.push_str(&format!("({})", self.quote_ident(target)));
        }
        if let Some(action) = &reference.on_delete {
            clause.push_str(&format!(" ON DELETE {}", action));
        }
        Some(clause)
    }

    /// One column definition as it appears inside `CREATE TABLE` or `ADD COLUMN`
    pub fn column_definition(&self, column: &SchemaColumn) -> String {
        let serial = column.is_serial();
        let mut parts = vec![self.quote_ident(&column.name), self.render_type(column)];

        if *self == Dialect::MySql && column.auto_increment {
            parts.push("AUTO_INCREMENT".to_string());
        }
        if column.primary_key {
            parts.push("PRIMARY KEY".to_string());
            if *self == Dialect::Sqlite && column.auto_increment {
                parts.push("AUTOINCREMENT".to_string());
            }
        }
        if column.unique && !column.primary_key {
            parts.push("UNIQUE".to_string());
        }
        if !column.nullable && !column.primary_key && !serial {
            parts.push("NOT NULL".to_string());
        }
        if let Some(default) = column.default.as_deref().filter(|_| !serial) {
            parts.push(format!("DEFAULT {}", self.render_default(default)));
        }
        // MySQL ignores inline REFERENCES, so it gets a table-level FOREIGN KEY instead
        if *self != Dialect::MySql {
            if let Some(reference) = self.render_reference(column) {
                parts.push(reference);
            }
        }

        parts.join(" ")
    }

    fn mysql_foreign_key(&self, column: &SchemaColumn) -> Option<String> {
        let reference = self.render_reference(column)?;
        Some(format!("FOREIGN KEY ({}) {}", self.quote_ident(&column.name), reference))
    }

    pub fn create_table(&self, table: &SchemaTable) -> String {
        let mut lines: Vec<String> = table
            .columns
            .iter()
            .map(|c| format!("{}{}", INDENT, self.column_definition(c)))
            .collect();

        lines.extend(table.constraints.iter().map(|c| format!("{}{}", INDENT, c)));

        if *self == Dialect::MySql {
            lines.extend(
                table
                    .columns
                    .iter()
                    .filter_map(|c| self.mysql_foreign_key(c))
                    .map(|fk| format!("{}{}", INDENT, fk)),
            );
        }

        format!(
            "CREATE TABLE {} (\n{}\n);",
            self.quote_ident(&table.name),
            lines.join(",\n")
        )
    }

    fn index_column(&self, column: &str) -> String {
        let simple = !column.is_empty()
            && column.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
        if simple {
            self.quote_ident(column)
        } else {
            column.to_string()
        }
    }

    pub fn create_index(&self, index: &SchemaIndex) -> String {
        let unique = if index.unique { "UNIQUE " } else { "" };
        let guard = if *self == Dialect::MySql { "" } else { "IF NOT EXISTS " };
        let columns = index
            .columns
            .iter()
            .map(|c| self.index_column(c))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "CREATE {}INDEX {}{} ON {} ({});",
            unique,
            guard,
            self.quote_ident(&index.name),
            self.quote_ident(&index.table),
            columns
        )
    }

    pub fn add_column(&self, table: &str, column: &SchemaColumn) -> String {
        let guard = if *self == Dialect::Postgres { "IF NOT EXISTS " } else { "" };
        let mut sql = format!(
            "ALTER TABLE {} ADD COLUMN {}{}",
            self.quote_ident(table),
            guard,
            self.column_definition(column)
        );
        if *self == Dialect::MySql {
            if let Some(fk) = self.mysql_foreign_key(column) {
                sql.push_str(&format!(", ADD {}", fk));
            }
        }
        sql.push(';');
        sql
    }

    pub fn drop_column(&self, table: &str, column: &str) -> String {
        let guard = if *self == Dialect::Postgres { "IF EXISTS " } else { "" };
        format!(
            "ALTER TABLE {} DROP COLUMN {}{};",
            self.quote_ident(table),
            guard,
            self.quote_ident(column)
        )
    }

    pub fn drop_table(&self, table: &str) -> String {
        let cascade = if *self == Dialect::Postgres { " CASCADE" } else { "" };
        format!("DROP TABLE IF EXISTS {}{};", self.quote_ident(table), cascade)
    }

    /// Existence-guarded enum creation; `None` where enums are inlined
    pub fn create_enum(&self, schema_enum: &SchemaEnum) -> Option<String> {
        if !self.supports_enum_types() {
            return None;
        }

        let values = schema_enum
            .values
            .iter()
            .map(|v| Self::quote_literal(v))
            .collect::<Vec<_>>()
            .join(", ");

        Some(format!(
            "DO $$ BEGIN\n{}CREATE TYPE {} AS ENUM ({});\nEXCEPTION\n{}WHEN duplicate_object THEN null;\nEND $$;",
            INDENT,
            self.quote_ident(&schema_enum.name),
            values,
            INDENT
        ))
    }

    pub fn drop_enum(&self, name: &str) -> Option<String> {
        self.supports_enum_types()
            .then(|| format!("DROP TYPE IF EXISTS {};", self.quote_ident(name)))
    }

    /// ALTER statements for one column. Empty on SQLite.
    pub fn alter_column(&self, table: &str, target: &SchemaColumn, changes: &[ColumnChange]) -> Vec<String> {
        let table_ident = self.quote_ident(table);
        let column_ident = self.quote_ident(&target.name);

        match self {
            Dialect::Sqlite => Vec::new(),
            Dialect::Postgres => changes
                .iter()
                .map(|change| match change {
                    ColumnChange::Type { to, .. } => format!(
                        "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{};",
                        table_ident, column_ident, to, column_ident, to
                    ),
                    ColumnChange::Nullability { nullable: true } => format!(
                        "ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL;",
                        table_ident, column_ident
                    ),
                    ColumnChange::Nullability { nullable: false } => format!(
                        "ALTER TABLE {} ALTER COLUMN {} SET NOT NULL;",
                        table_ident, column_ident
                    ),
                    ColumnChange::Default { to: Some(value), .. } => format!(
                        "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {};",
                        table_ident, column_ident, value
                    ),
                    ColumnChange::Default { to: None, .. } => format!(
                        "ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT;",
                        table_ident, column_ident
                    ),
                })
                .collect(),
            Dialect::MySql => {
                let needs_modify = changes
                    .iter()
                    .any(|c| matches!(c, ColumnChange::Type { .. } | ColumnChange::Nullability { .. }));

                if needs_modify {
                    // MODIFY restates the whole column, default included
                    let mut definition = target.clone();
                    definition.primary_key = false;
                    definition.references = None;
                    return vec![format!(
                        "ALTER TABLE {} MODIFY COLUMN {};",
                        table_ident,
                        self.column_definition(&definition)
                    )];
                }

                changes
                    .iter()
                    .filter_map(|change| match change {
                        ColumnChange::Default { to: Some(value), .. } => Some(format!(
                            "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {};",
                            table_ident, column_ident, value
                        )),
                        ColumnChange::Default { to: None, .. } => Some(format!(
                            "ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT;",
                            table_ident, column_ident
                        )),
                        _ => None,
                    })
                    .collect()
            }
        }
    }
}

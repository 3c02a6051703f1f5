//! Compiled SQL recognition patterns
//!
//! Built once per parser/detector and shared by `Arc`; there is no global cache.

use regex::Regex;

use crate::error::Result;

/// A possibly quoted, possibly schema-qualified identifier
const QUALIFIED: &str = r#"(?:"[^"]+"|`[^`]+`|[\w$]+)(?:\s*\.\s*(?:"[^"]+"|`[^`]+`|[\w$]+))?"#;
const IDENT: &str = r#"(?:"[^"]+"|`[^`]+`|[\w$]+)"#;

/// Regexes for the DDL subset the parser and conflict detector understand
#[derive(Debug, Clone)]
pub struct SqlPatterns {
    /// `CREATE TABLE [IF NOT EXISTS] name`; group 1 is the name
    pub create_table: Regex,
    /// `CREATE TYPE name AS ENUM (`; group 1 is the name
    pub create_enum: Regex,
    /// `CREATE [UNIQUE] INDEX name ON table (`; groups: unique, name, table
    pub create_index: Regex,
    /// `ALTER TABLE name <actions>`; groups: table, actions
    pub alter_table: Regex,
    /// `ADD [COLUMN] [IF NOT EXISTS] col <definition>`; groups: column, definition
    pub add_column: Regex,
    /// `ADD CONSTRAINT name UNIQUE (cols)`; group 1 is the column list
    pub add_unique: Regex,
    /// `REFERENCES table`; group 1 is the table
    pub references: Regex,
    /// `PRIMARY KEY (cols)`; group 1 is the column list
    pub primary_key: Regex,
    /// `DROP TABLE [IF EXISTS] a, b`; group 1 is the name list
    pub drop_table: Regex,
    pub not_null: Regex,
    pub default_clause: Regex,
}

impl SqlPatterns {
    pub fn new() -> Result<Self> {
        Ok(Self {
            create_table: Regex::new(&format!(
                r"(?is)^\s*CREATE\s+(?:OR\s+REPLACE\s+)?(?:(?:GLOBAL|LOCAL)\s+)?(?:(?:TEMP|TEMPORARY|UNLOGGED)\s+)?TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?({})",
                QUALIFIED
            ))?,
            create_enum: Regex::new(&format!(
                r"(?is)^\s*CREATE\s+TYPE\s+({})\s+AS\s+ENUM\s*\(",
                QUALIFIED
            ))?,
            create_index: Regex::new(&format!(
                r"(?is)^\s*CREATE\s+(UNIQUE\s+)?INDEX\s+(?:CONCURRENTLY\s+)?(?:IF\s+NOT\s+EXISTS\s+)?({})\s+ON\s+(?:ONLY\s+)?({})\s*(?:USING\s+\w+\s*)?\(",
                IDENT, QUALIFIED
            ))?,
            alter_table: Regex::new(&format!(
                r"(?is)^\s*ALTER\s+TABLE\s+(?:IF\s+EXISTS\s+)?(?:ONLY\s+)?({})\s+(.*)$",
                QUALIFIED
            ))?,
            add_column: Regex::new(&format!(
                r"(?is)^\s*ADD\s+(?:COLUMN\s+)?(?:IF\s+NOT\s+EXISTS\s+)?({})\s+(.*)$",
                IDENT
            ))?,
            add_unique: Regex::new(&format!(
                r"(?is)^\s*ADD\s+CONSTRAINT\s+{}\s+UNIQUE\s*(?:KEY\s*)?\(([^)]+)\)",
                IDENT
            ))?,
            references: Regex::new(&format!(r"(?is)\bREFERENCES\s+({})", QUALIFIED))?,
            primary_key: Regex::new(r"(?is)\bPRIMARY\s+KEY\s*\(([^)]*)\)")?,
            drop_table: Regex::new(r"(?is)^\s*DROP\s+TABLE\s+(?:IF\s+EXISTS\s+)?(.+?)(?:\s+(?:CASCADE|RESTRICT))?\s*$")?,
            not_null: Regex::new(r"(?is)\bNOT\s+NULL\b")?,
            default_clause: Regex::new(r"(?is)\bDEFAULT\b")?,
        })
    }

    /// Whether a column definition carries its own `DEFAULT`. The `SET DEFAULT`
    /// of a referential action does not count.
    pub fn has_column_default(&self, definition: &str) -> bool {
        self.default_clause.find_iter(definition).any(|m| {
            let previous_word = definition[..m.start()]
                .trim_end()
                .rsplit(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                .next()
                .unwrap_or("");
            !previous_word.eq_ignore_ascii_case("SET")
        })
    }
}

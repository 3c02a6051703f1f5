//! Declarative schema parser
//!
//! Reads `CREATE TABLE`, `CREATE TYPE ... AS ENUM` and `CREATE INDEX` statements
//! from one or many `.sql` files into a [`SchemaSnapshot`]. Table bodies are
//! found by balanced-parenthesis scanning, and malformed DDL fails with a
//! positioned [`Error::SyntaxError`].

use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::schema::scanner::{self, Statement};
use crate::schema::types::{
    ForeignKeyRef, SchemaColumn, SchemaEnum, SchemaIndex, SchemaSnapshot, SchemaTable,
};
use crate::utils::naming::unquote_identifier;
use crate::utils::patterns::SqlPatterns;

/// Leading keywords of table-level constraints inside a `CREATE TABLE` body
const CONSTRAINT_KEYWORDS: &[&str] = &[
    "PRIMARY", "FOREIGN", "UNIQUE", "CHECK", "CONSTRAINT", "INDEX", "KEY", "EXCLUDE", "FULLTEXT",
    "SPATIAL",
];

/// Words that end a column's type and start its constraints
const COLUMN_KEYWORDS: &[&str] = &[
    "NOT", "NULL", "PRIMARY", "UNIQUE", "DEFAULT", "REFERENCES", "CHECK", "CONSTRAINT",
    "AUTO_INCREMENT", "AUTOINCREMENT", "GENERATED", "COLLATE", "ON", "COMMENT", "IDENTITY",
];

/// Everything declared in one file, before merging
#[derive(Debug, Default, Clone)]
pub struct ParsedFile {
    pub file: String,
    pub tables: Vec<SchemaTable>,
    pub enums: Vec<SchemaEnum>,
    pub indexes: Vec<SchemaIndex>,
}

/// Parses declarative schema files
#[derive(Debug, Clone)]
pub struct SchemaParser {
    patterns: Arc<SqlPatterns>,
    max_workers: usize,
}

impl SchemaParser {
    /// Create a parser with freshly compiled patterns
    pub fn new() -> Result<Self> {
        Ok(Self::with_patterns(Arc::new(SqlPatterns::new()?)))
    }

    /// Create a parser sharing already compiled patterns
    pub fn with_patterns(patterns: Arc<SqlPatterns>) -> Self {
        let max_workers = std::thread::available_parallelism().map_or(4, |n| n.get());
        Self {
            patterns,
            max_workers,
        }
    }

    /// Cap the number of files parsed concurrently
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Find schema files: a file, every `*.sql` under a directory, or a glob pattern
    pub fn discover(path: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let path = path.as_ref();

        let mut files = if path.is_file() {
            vec![path.to_path_buf()]
        } else if path.is_dir() {
            let mut files = Vec::new();
            for entry in WalkDir::new(path).follow_links(true) {
                let entry = entry.map_err(|e| Error::IoError(e.into()))?;
                if entry.file_type().is_file() && is_sql(entry.path()) {
                    files.push(entry.into_path());
                }
            }
            files
        } else {
            let pattern = path.to_string_lossy();
            let entries = glob::glob(&pattern)
                .map_err(|e| Error::ConfigError(format!("Invalid schema path pattern: {}", e)))?;
            let mut files = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|e| Error::IoError(e.into()))?;
                if entry.is_file() {
                    files.push(entry);
                }
            }
            files
        };

        if files.is_empty() {
            return Err(Error::SchemaAnalysisError(format!(
                "No schema files found at {}",
                path.display()
            )));
        }

        // merge order must not depend on directory iteration order
        files.sort();
        Ok(files)
    }

    /// Parse every schema file under `path` into one snapshot
    pub async fn parse_path(&self, path: impl AsRef<Path>) -> Result<SchemaSnapshot> {
        let files = Self::discover(path)?;
        self.parse_files(files).await
    }

    /// Parse files on a bounded pool of blocking workers and merge the results
    /// in input order
    pub async fn parse_files(&self, paths: Vec<PathBuf>) -> Result<SchemaSnapshot> {
        let workers = self.max_workers.min(paths.len()).max(1);
        tracing::debug!(files = paths.len(), workers, "Parsing schema files");

        let parsed: Vec<Result<ParsedFile>> = stream::iter(paths)
            .map(|path| {
                let parser = self.clone();
                async move {
                    tokio::task::spawn_blocking(move || parser.parse_file(&path))
                        .await
                        .map_err(|e| Error::Unknown(format!("Schema parser task failed: {}", e)))?
                }
            })
            .buffered(workers)
            .collect()
            .await;

        let files = parsed.into_iter().collect::<Result<Vec<_>>>()?;
        merge(files)
    }

    /// Read and parse a single file
    pub fn parse_file(&self, path: &Path) -> Result<ParsedFile> {
        let sql = std::fs::read_to_string(path)?;
        self.parse_str(&path.display().to_string(), &sql)
    }

    /// Parse schema text; `file` is used in error positions
    pub fn parse_str(&self, file: &str, sql: &str) -> Result<ParsedFile> {
        let cleaned = scanner::strip_comments(sql, file)?;
        let mut parsed = ParsedFile {
            file: file.to_string(),
            ..ParsedFile::default()
        };

        for statement in scanner::split_statements(&cleaned, file)? {
            let ctx = Context {
                file,
                src: &cleaned,
            };

            if let Some(caps) = self.patterns.create_table.captures(statement.text) {
                let name = caps.get(1).map(|m| (m.as_str(), m.end())).unwrap_or_default();
                let table = self.parse_table(&ctx, &statement, name.0, name.1)?;
                parsed.tables.push(table);
            } else if let Some(caps) = self.patterns.create_enum.captures(statement.text) {
                let name = caps.get(1).map_or("", |m| m.as_str());
                let open = caps.get(0).map_or(0, |m| m.end() - 1);
                parsed.enums.push(self.parse_enum(&ctx, &statement, name, open)?);
            } else if let Some(caps) = self.patterns.create_index.captures(statement.text) {
                let open = caps.get(0).map_or(0, |m| m.end() - 1);
                let close = scanner::matching_paren(statement.text, open).ok_or_else(|| {
                    ctx.error(statement.offset + open, "unclosed index column list")
                })?;
                let columns = scanner::split_top_level(&statement.text[open + 1..close], b',')
                    .into_iter()
                    .filter(|(_, c)| !c.is_empty())
                    .map(|(_, c)| index_column_name(c))
                    .collect();

                parsed.indexes.push(SchemaIndex {
                    name: unquote_identifier(caps.get(2).map_or("", |m| m.as_str())),
                    table: unquote_identifier(caps.get(3).map_or("", |m| m.as_str())),
                    columns,
                    unique: caps.get(1).is_some(),
                });
            } else {
                tracing::debug!(
                    file,
                    statement = %first_line(statement.text),
                    "Skipping statement outside the schema subset"
                );
            }
        }

        Ok(parsed)
    }

    fn parse_table(
        &self,
        ctx: &Context<'_>,
        statement: &Statement<'_>,
        raw_name: &str,
        name_end: usize,
    ) -> Result<SchemaTable> {
        let text = statement.text;
        let after_name = &text[name_end..];
        let open = name_end + (after_name.len() - after_name.trim_start().len());

        if text.as_bytes().get(open) != Some(&b'(') {
            return Err(ctx.error(statement.offset + open, "expected '(' to open the column list"));
        }
        let close = scanner::matching_paren(text, open)
            .ok_or_else(|| ctx.error(statement.offset + open, "unclosed column list"))?;

        let mut table = SchemaTable::new(unquote_identifier(raw_name));
        let body = &text[open + 1..close];
        let body_offset = statement.offset + open + 1;

        for (item_offset, item) in scanner::split_top_level(body, b',') {
            let offset = body_offset + item_offset;
            if item.is_empty() {
                return Err(ctx.error(offset, "empty column definition"));
            }

            let first_word = item
                .split(|c: char| c.is_whitespace() || c == '(')
                .next()
                .unwrap_or_default()
                .to_uppercase();

            if CONSTRAINT_KEYWORDS.contains(&first_word.as_str()) {
                self.parse_table_constraint(&mut table, item);
            } else {
                let column = self.parse_column(ctx, item, offset)?;
                if let Some(reference) = &column.references {
                    push_unique(&mut table.references, reference.table.clone());
                }
                if table.has_column(&column.name) {
                    return Err(Error::SchemaValidation(format!(
                        "{}: column '{}' is declared twice in table '{}'",
                        ctx.file, column.name, table.name
                    )));
                }
                table.columns.push(column);
            }
        }

        if table.columns.is_empty() {
            return Err(ctx.error(statement.offset + open, format!("table '{}' has no columns", table.name)));
        }

        Ok(table)
    }

    fn parse_table_constraint(&self, table: &mut SchemaTable, item: &str) {
        if let Some(caps) = self.patterns.primary_key.captures(item) {
            let columns = caps.get(1).map_or("", |m| m.as_str());
            table.primary_key = columns
                .split(',')
                .map(unquote_identifier)
                .filter(|c| !c.is_empty())
                .collect();
        }

        for caps in self.patterns.references.captures_iter(item) {
            if let Some(target) = caps.get(1) {
                push_unique(&mut table.references, unquote_identifier(target.as_str()));
            }
        }

        table.constraints.push(collapse_whitespace(item));
    }

    fn parse_column(&self, ctx: &Context<'_>, item: &str, offset: usize) -> Result<SchemaColumn> {
        let words = scanner::split_words(item);
        let Some(&(_, raw_name)) = words.first() else {
            return Err(ctx.error(offset, "empty column definition"));
        };

        let type_end = words
            .iter()
            .skip(1)
            .position(|(_, w)| is_column_keyword(w))
            .map_or(words.len(), |p| p + 1);

        if type_end <= 1 {
            return Err(ctx.error(
                offset + raw_name.len(),
                format!("missing type for column '{}'", unquote_identifier(raw_name)),
            ));
        }

        let data_type = words[1..type_end]
            .iter()
            .map(|(_, w)| *w)
            .collect::<Vec<_>>()
            .join(" ");
        let mut column = SchemaColumn::new(unquote_identifier(raw_name), data_type);

        let rest: Vec<&str> = words[type_end..].iter().map(|(_, w)| *w).collect();
        let upper: Vec<String> = rest.iter().map(|w| w.to_uppercase()).collect();
        let mut not_null = false;

        let mut i = 0;
        while i < rest.len() {
            match upper[i].as_str() {
                "NOT" if upper.get(i + 1).map(String::as_str) == Some("NULL") => {
                    not_null = true;
                    i += 1;
                }
                "PRIMARY" if upper.get(i + 1).map(String::as_str) == Some("KEY") => {
                    column.primary_key = true;
                    i += 1;
                }
                "UNIQUE" => column.unique = true,
                "AUTO_INCREMENT" | "AUTOINCREMENT" => column.auto_increment = true,
                "DEFAULT" => {
                    let Some(value) = rest.get(i + 1) else {
                        return Err(ctx.error(
                            offset,
                            format!("missing value after DEFAULT for column '{}'", column.name),
                        ));
                    };
                    column.default = Some(value.to_string());
                    i += 1;
                }
                "REFERENCES" => {
                    let Some(target) = rest.get(i + 1) else {
                        return Err(ctx.error(
                            offset,
                            format!("missing table after REFERENCES for column '{}'", column.name),
                        ));
                    };
                    let (table, target_column) = split_reference(target);
                    i += 1;

                    let mut on_delete = None;
                    if upper.get(i + 1).map(String::as_str) == Some("ON")
                        && upper.get(i + 2).map(String::as_str) == Some("DELETE")
                    {
                        let action_len = match upper.get(i + 3).map(String::as_str) {
                            Some("SET") | Some("NO") => 2,
                            _ => 1,
                        };
                        let action = rest
                            .iter()
                            .skip(i + 3)
                            .take(action_len)
                            .map(|w| w.to_uppercase())
                            .collect::<Vec<_>>()
                            .join(" ");
                        if !action.is_empty() {
                            on_delete = Some(action);
                        }
                        i += 2 + action_len;
                    }

                    column.references = Some(ForeignKeyRef {
                        table,
                        column: target_column,
                        on_delete,
                    });
                }
                _ => {}
            }
            i += 1;
        }

        column.nullable = !(not_null || column.primary_key || column.is_serial());
        Ok(column)
    }

    fn parse_enum(
        &self,
        ctx: &Context<'_>,
        statement: &Statement<'_>,
        raw_name: &str,
        open: usize,
    ) -> Result<SchemaEnum> {
        let close = scanner::matching_paren(statement.text, open)
            .ok_or_else(|| ctx.error(statement.offset + open, "unclosed enum value list"))?;
        let name = unquote_identifier(raw_name);

        let mut values = Vec::new();
        for (value_offset, raw) in scanner::split_top_level(&statement.text[open + 1..close], b',') {
            if raw.is_empty() {
                continue;
            }
            let quoted = raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'');
            if !quoted {
                return Err(ctx.error(
                    statement.offset + open + 1 + value_offset,
                    format!("enum '{}' values must be string literals", name),
                ));
            }
            values.push(raw[1..raw.len() - 1].replace("''", "'"));
        }

        if values.is_empty() {
            return Err(ctx.error(statement.offset + open, format!("enum '{}' has no values", name)));
        }

        Ok(SchemaEnum { name, values })
    }
}

/// File name plus comment-stripped source, for positioning errors
struct Context<'a> {
    file: &'a str,
    src: &'a str,
}

impl Context<'_> {
    fn error(&self, offset: usize, message: impl Into<String>) -> Error {
        scanner::syntax_error(self.file, self.src, offset, message)
    }
}

/// Combine per-file results; duplicate tables or enums across files are rejected
pub fn merge(files: Vec<ParsedFile>) -> Result<SchemaSnapshot> {
    let mut snapshot = SchemaSnapshot::new();
    let mut table_sources: Vec<(String, String)> = Vec::new();
    let mut indexes = Vec::new();

    for file in files {
        for table in file.tables {
            let key = table.name.to_lowercase();
            if let Some((_, first)) = table_sources.iter().find(|(k, _)| *k == key) {
                return Err(Error::SchemaValidation(format!(
                    "table '{}' is defined in both {} and {}",
                    table.name, first, file.file
                )));
            }
            table_sources.push((key, file.file.clone()));
            snapshot.insert_table(table);
        }

        for schema_enum in file.enums {
            let name = schema_enum.name.clone();
            if snapshot.insert_enum(schema_enum).is_some() {
                return Err(Error::SchemaValidation(format!(
                    "enum '{}' is defined more than once",
                    name
                )));
            }
        }

        indexes.extend(file.indexes);
    }

    for index in indexes {
        match snapshot.table_mut(&index.table) {
            Some(table) => table.indexes.push(index),
            None => tracing::warn!(
                index = %index.name,
                table = %index.table,
                "Index refers to a table not declared in the schema, ignoring"
            ),
        }
    }

    Ok(snapshot)
}

fn is_sql(path: &Path) -> bool {
    path.extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("sql"))
}

fn is_column_keyword(word: &str) -> bool {
    let upper = word.to_uppercase();
    COLUMN_KEYWORDS.contains(&upper.as_str())
}

/// `users(id)` into `("users", Some("id"))`
fn split_reference(target: &str) -> (String, Option<String>) {
    match target.find('(') {
        Some(open) => {
            let column = target[open + 1..].trim_end_matches(')');
            let column = column.split(',').next().unwrap_or_default();
            (
                unquote_identifier(&target[..open]),
                Some(unquote_identifier(column)).filter(|c| !c.is_empty()),
            )
        }
        None => (unquote_identifier(target), None),
    }
}

/// Index key without ordering or operator-class suffixes
fn index_column_name(raw: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with('(') || raw.contains('(') {
        return raw.to_string();
    }
    let first = scanner::split_words(raw)
        .first()
        .map_or(raw, |(_, w)| *w)
        .to_string();
    unquote_identifier(&first)
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.iter().any(|v| v.eq_ignore_ascii_case(&value)) {
        list.push(value);
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

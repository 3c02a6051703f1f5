//! Migration files on disk
//!
//! `<dir>/<YYYYMMDDhhmmss>_<slug>.sql`, with a two line comment header, a
//! blank line and the SQL body. The checksum covers the body only.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::db::executor;
use crate::error::{Error, Result};
use crate::utils::naming;

const NAME_HEADER: &str = "-- Migration:";
const CREATED_HEADER: &str = "-- Created:";
const CREATED_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single migration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// File stem, `<timestamp>_<slug>`
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    /// SHA-256 hex of the body
    pub checksum: String,
    pub created_at: Option<DateTime<Utc>>,
    pub body: String,
}

impl Migration {
    /// Read a migration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        Self::parse(path, &content)
    }

    /// Build a migration from file content
    pub fn parse(path: &Path, content: &str) -> Result<Self> {
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| Error::MigrationError(format!("Invalid migration path: {}", path.display())))?;

        let mut name = None;
        let mut created_at = None;
        for line in content.lines().take_while(|l| l.starts_with("--")) {
            if let Some(value) = line.strip_prefix(NAME_HEADER) {
                name = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix(CREATED_HEADER) {
                created_at = NaiveDateTime::parse_from_str(value.trim(), CREATED_FORMAT)
                    .ok()
                    .map(|naive| Utc.from_utc_datetime(&naive));
            }
        }

        let body = extract_body(content);
        Ok(Self {
            name: name.unwrap_or_else(|| naming::name_from_id(&id)),
            checksum: checksum(&body),
            path: path.to_path_buf(),
            id,
            created_at,
            body,
        })
    }

    /// Write a new migration file under `dir`. An id that already exists is
    /// moved one second forward until it is free.
    pub fn create(dir: impl AsRef<Path>, name: &str, body: &str, now: DateTime<Utc>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        // The header is one line per field
        let name = name
            .split(char::is_control)
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let name = name.as_str();

        let mut timestamp = now;
        let mut id = naming::migration_id(&timestamp, name);
        while dir.join(format!("{}.sql", id)).exists() {
            timestamp += chrono::Duration::seconds(1);
            id = naming::migration_id(&timestamp, name);
        }

        let body = body.trim().to_string();
        let content = format!(
            "{} {}\n{} {}\n\n{}\n",
            NAME_HEADER,
            name,
            CREATED_HEADER,
            timestamp.format(CREATED_FORMAT),
            body
        );
        let path = dir.join(format!("{}.sql", id));
        fs::write(&path, content)?;

        tracing::info!(migration = %id, path = %path.display(), "Wrote migration file");

        Ok(Self {
            id,
            name: name.to_string(),
            path,
            checksum: checksum(&body),
            created_at: Some(timestamp),
            body,
        })
    }

    /// Executable statements of the body
    pub fn statements(&self) -> Result<Vec<String>> {
        executor::migration_statements(&self.path.display().to_string(), &self.body)
    }
}

/// SHA-256 hex digest of a migration body
pub fn checksum(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

/// Body of a migration file: everything after the leading `--` header lines,
/// with surrounding blank lines removed
pub fn extract_body(content: &str) -> String {
    let mut lines = content.lines().peekable();
    while let Some(line) = lines.peek() {
        let trimmed = line.trim();
        if trimmed.starts_with(NAME_HEADER) || trimmed.starts_with(CREATED_HEADER) || trimmed.is_empty() {
            lines.next();
        } else {
            break;
        }
    }

    lines.collect::<Vec<_>>().join("\n").trim().to_string()
}

/// Every `*.sql` migration in `dir`, sorted by id. Unreadable files are
/// skipped with a warning; a missing directory has no migrations.
pub fn discover(dir: impl AsRef<Path>) -> Result<Vec<Migration>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut migrations = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_sql = path.is_file()
            && path
                .extension()
                .map_or(false, |ext| ext.eq_ignore_ascii_case("sql"));
        if !is_sql {
            continue;
        }

        match Migration::load(&path) {
            Ok(migration) => migrations.push(migration),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable migration file"),
        }
    }

    migrations.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(migrations)
}

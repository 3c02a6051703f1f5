//! Naming utilities for graft
//!
//! Slugs for migration ids, identifier cleanup and branch-name rules.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::db::dialect::Dialect;
use crate::error::{Error, Result};

/// Longest migration id written to the tracking table
pub const MAX_MIGRATION_ID_LENGTH: usize = 200;

/// Turn a human migration name into a filesystem and identifier safe slug
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_was_underscore = false;

    for c in name.trim().to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_was_underscore = false;
        } else if !last_was_underscore {
            slug.push('_');
            last_was_underscore = true;
        }
    }

    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        "migration".to_string()
    } else {
        slug.to_string()
    }
}

/// Build `<YYYYMMDDhhmmss>_<slug>`, keeping the result within the tracking column
pub fn migration_id(timestamp: &DateTime<Utc>, name: &str) -> String {
    let id = format!("{}_{}", timestamp.format("%Y%m%d%H%M%S"), slugify(name));

    if id.len() <= MAX_MIGRATION_ID_LENGTH {
        id
    } else {
        // slug is ASCII, so byte truncation is safe
        id[..MAX_MIGRATION_ID_LENGTH].trim_end_matches('_').to_string()
    }
}

/// Human readable name recovered from a migration id
pub fn name_from_id(id: &str) -> String {
    match id.split_once('_') {
        Some((_, rest)) if !rest.is_empty() => rest.replace('_', " "),
        _ => id.to_string(),
    }
}

/// Strip quoting and schema qualification from an identifier as written in DDL
pub fn unquote_identifier(raw: &str) -> String {
    let raw = raw.trim();
    let last = split_qualified(raw).pop().unwrap_or(raw);

    let trimmed = last.trim();
    for (open, close) in [('"', '"'), ('`', '`'), ('[', ']')] {
        if trimmed.len() >= 2 && trimmed.starts_with(open) && trimmed.ends_with(close) {
            return trimmed[1..trimmed.len() - 1].to_string();
        }
    }

    trimmed.to_string()
}

/// Split `schema.table` on dots that sit outside quotes
fn split_qualified(raw: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, c) in raw.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '`' => quote = Some(c),
            None if c == '[' => quote = Some(']'),
            None if c == '.' => {
                parts.push(&raw[start..i]);
                start = i + 1;
            }
            None => {}
        }
    }
    parts.push(&raw[start..]);
    parts
}

/// Branch names become schema, database and file names, so keep them boring
pub fn validate_branch_name(name: &str) -> Result<()> {
    let mut chars = name.chars();

    let valid_start = chars.next().map_or(false, |c| c.is_ascii_alphabetic());
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if !valid_start || !valid_rest || name.len() > 48 {
        return Err(Error::branch(format!(
            "invalid branch name '{}': use letters, digits, '_' or '-', starting with a letter (max 48 chars)",
            name
        )));
    }

    Ok(())
}

/// Truncate an identifier to fit database limits
pub fn truncate_identifier(name: &str, max_length: usize) -> String {
    if name.len() <= max_length {
        return name.to_string();
    }

    // 8 hex chars of hash plus the joining underscore
    let keep_length = max_length.saturating_sub(9);
    let hash = hex::encode(Sha256::digest(name.as_bytes()));

    let mut cut = keep_length.min(name.len());
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }

    format!("{}_{}", &name[..cut], &hash[..8])
}

/// Get maximum identifier length for a dialect
pub fn max_identifier_length(dialect: Dialect) -> usize {
    match dialect {
        Dialect::Postgres => 63,
        Dialect::MySql => 64,
        Dialect::Sqlite => 2048,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("Add users table", "add_users_table")]
    #[case("  --Create   Posts!! ", "create_posts")]
    #[case("v2: orders/items", "v2_orders_items")]
    #[case("!!!", "migration")]
    #[case("", "migration")]
    fn test_slugify(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(slugify(input), expected);
    }

    #[test]
    fn test_migration_id() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(migration_id(&ts, "Init Schema"), "20240102030405_init_schema");

        let long = "x".repeat(400);
        let id = migration_id(&ts, &long);
        assert_eq!(id.len(), MAX_MIGRATION_ID_LENGTH);
        assert!(id.starts_with("20240102030405_xxx"));
    }

    #[test]
    fn test_name_from_id() {
        assert_eq!(name_from_id("20240101000000_add_users"), "add users");
        assert_eq!(name_from_id("plain"), "plain");
    }

    #[rstest]
    #[case("users", "users")]
    #[case("\"Users\"", "Users")]
    #[case("public.users", "users")]
    #[case("\"my.schema\".\"order\"", "order")]
    #[case("`accounts`", "accounts")]
    fn test_unquote_identifier(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(unquote_identifier(input), expected);
    }

    #[test]
    fn test_validate_branch_name() {
        assert!(validate_branch_name("feature_x").is_ok());
        assert!(validate_branch_name("feature-1").is_ok());
        assert!(validate_branch_name("1feature").is_err());
        assert!(validate_branch_name("drop table;").is_err());
        assert!(validate_branch_name("").is_err());
    }

    #[test]
    fn test_truncate_identifier() {
        assert_eq!(truncate_identifier("short", 63), "short");

        let long = format!("graft_branch_{}", "a".repeat(80));
        let truncated = truncate_identifier(&long, 63);
        assert_eq!(truncated.len(), 63);
        assert!(truncated.starts_with("graft_branch_aaa"));
        assert_eq!(truncated, truncate_identifier(&long, 63));
    }
}

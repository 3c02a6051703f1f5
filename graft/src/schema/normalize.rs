//! Type and default equivalence
//!
//! DDL sugar and catalog output rarely agree textually (`SERIAL` vs `integer`,
//! `VARCHAR(255)` vs `character varying(255)`, `NOW()` vs `CURRENT_TIMESTAMP`).
//! These functions reduce both sides to a canonical form before comparison.

use crate::schema::scanner;

/// Collapse whitespace and drop it around parentheses and commas
fn compact(raw: &str) -> String {
    let upper = raw.trim().to_uppercase();
    let collapsed = upper.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut out = String::with_capacity(collapsed.len());
    let chars: Vec<char> = collapsed.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if c == ' ' {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1).copied();
            if matches!(prev, Some('(') | Some(',')) || matches!(next, Some('(') | Some(')') | Some(',')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

pub fn is_serial_type(raw: &str) -> bool {
    matches!(
        compact(raw).as_str(),
        "SERIAL" | "SERIAL2" | "SERIAL4" | "SERIAL8" | "SMALLSERIAL" | "BIGSERIAL"
    )
}

/// Canonical form of a column type
pub fn normalize_type(raw: &str) -> String {
    let mut compacted = compact(raw);

    let mut array_suffix = String::new();
    while let Some(stripped) = compacted.strip_suffix("[]") {
        array_suffix.push_str("[]");
        compacted = stripped.to_string();
    }

    let (base, params) = match compacted.find('(') {
        Some(open) => {
            // `TIMESTAMP(3) WITH TIME ZONE` keeps its tail as part of the base name
            let close = compacted[open..].find(')').map_or(compacted.len(), |c| open + c + 1);
            let base = format!("{}{}", &compacted[..open], &compacted[close..]);
            (base.trim().to_string(), compacted[open..close].to_string())
        }
        None => (compacted.clone(), String::new()),
    };

    let canonical = match base.as_str() {
        "SMALLSERIAL" | "SERIAL2" | "INT2" | "SMALLINT" => "SMALLINT".to_string(),
        "SERIAL" | "SERIAL4" | "INT" | "INT4" | "INTEGER" | "MEDIUMINT" => "INTEGER".to_string(),
        "BIGSERIAL" | "SERIAL8" | "INT8" | "BIGINT" => "BIGINT".to_string(),
        "TINYINT" if params == "(1)" => "BOOLEAN".to_string(),
        "TINYINT" => "TINYINT".to_string(),
        "VARCHAR" | "CHARACTER VARYING" => "VARCHAR".to_string(),
        "CHAR" | "CHARACTER" | "BPCHAR" => format!("CHAR{}", params),
        "TIMESTAMP" | "TIMESTAMP WITHOUT TIME ZONE" => "TIMESTAMP".to_string(),
        "TIMESTAMPTZ" | "TIMESTAMP WITH TIME ZONE" => "TIMESTAMPTZ".to_string(),
        "TIME" | "TIME WITHOUT TIME ZONE" => "TIME".to_string(),
        "TIMETZ" | "TIME WITH TIME ZONE" => "TIMETZ".to_string(),
        "BOOL" | "BOOLEAN" => "BOOLEAN".to_string(),
        "DECIMAL" | "NUMERIC" => format!("NUMERIC{}", params),
        "FLOAT8" | "DOUBLE" | "DOUBLE PRECISION" => "DOUBLE PRECISION".to_string(),
        "FLOAT4" | "REAL" => "REAL".to_string(),
        _ => format!("{}{}", base, params),
    };

    format!("{}{}", canonical, array_suffix)
}

pub fn types_equivalent(a: &str, b: &str) -> bool {
    normalize_type(a) == normalize_type(b)
}

/// Cut a trailing top-level `::type` cast, as catalogs report `'x'::character varying`
fn strip_casts(raw: &str) -> &str {
    let mut depth = 0usize;
    let mut cut = None;
    let bytes = raw.as_bytes();

    for (i, b) in scanner::code_bytes(raw) {
        match b {
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b':' if depth == 0 && bytes.get(i + 1) == Some(&b':') && cut.is_none() => cut = Some(i),
            _ => {}
        }
    }

    match cut {
        Some(i) => raw[..i].trim_end(),
        None => raw,
    }
}

/// Canonical comparison key for a default expression. `None` means "no default".
pub fn normalize_default(raw: Option<&str>) -> Option<String> {
    let raw = strip_casts(raw?.trim()).trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("NULL") {
        return None;
    }

    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return Some(raw[1..raw.len() - 1].replace("''", "'"));
    }

    let upper = compact(raw);
    let unwrapped = match upper.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        Some(inner) if !inner.contains('(') || inner.ends_with("()") => inner.to_string(),
        _ => upper,
    };

    match unwrapped.as_str() {
        "NOW()" | "CURRENT_TIMESTAMP" | "CURRENT_TIMESTAMP()" | "LOCALTIMESTAMP" => {
            Some("CURRENT_TIMESTAMP".to_string())
        }
        _ => Some(unwrapped),
    }
}

pub fn defaults_equivalent(a: Option<&str>, b: Option<&str>) -> bool {
    normalize_default(a) == normalize_default(b)
}

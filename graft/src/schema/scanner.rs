//! Quote-aware scanning of SQL text
//!
//! The parser never looks inside string literals, quoted identifiers or
//! dollar-quoted bodies. Everything here works on byte offsets into the
//! original text so errors can point at a line and column.

use crate::error::{Error, Result};

/// 1-based line and column of a byte offset
pub fn line_col(src: &str, offset: usize) -> (usize, usize) {
    let mut offset = offset.min(src.len());
    while !src.is_char_boundary(offset) {
        offset -= 1;
    }

    let before = &src[..offset];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map_or(0, |nl| nl + 1);
    let column = before[line_start..].chars().count() + 1;

    (line, column)
}

/// Build a positioned syntax error
pub fn syntax_error(file: &str, src: &str, offset: usize, message: impl Into<String>) -> Error {
    let (line, column) = line_col(src, offset);
    Error::SyntaxError {
        file: file.to_string(),
        line,
        column,
        message: message.into(),
    }
}

/// End (exclusive) of the quoted region opening at `start`, doubled quotes escape
fn skip_quoted(bytes: &[u8], start: usize) -> Option<usize> {
    let quote = bytes[start];
    let mut i = start + 1;

    while i < bytes.len() {
        if bytes[i] == quote {
            if i + 1 < bytes.len() && bytes[i + 1] == quote {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }

    None
}

/// If a dollar-quote tag (`$$` or `$tag$`) opens at `start`, the end of that tag
fn dollar_tag(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
        i += 1;
    }

    let tag_starts_with_digit = i > start + 1 && bytes[start + 1].is_ascii_digit();
    if i < bytes.len() && bytes[i] == b'$' && !tag_starts_with_digit {
        Some(i + 1)
    } else {
        None
    }
}

/// End (exclusive) of the dollar-quoted body whose opening tag is `bytes[start..tag_end]`
fn skip_dollar_quoted(bytes: &[u8], start: usize, tag_end: usize) -> Option<usize> {
    let tag = &bytes[start..tag_end];
    bytes[tag_end..]
        .windows(tag.len())
        .position(|w| w == tag)
        .map(|pos| tag_end + pos + tag.len())
}

/// Replace `--` and `/* */` comments with spaces, keeping newlines and offsets
pub fn strip_comments(src: &str, file: &str) -> Result<String> {
    let bytes = src.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    let blank = |b: u8| if b == b'\n' { b'\n' } else { b' ' };

    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();

        match b {
            b'-' if next == Some(b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    out.push(b' ');
                    i += 1;
                }
            }
            b'/' if next == Some(b'*') => {
                let end = bytes[i + 2..]
                    .windows(2)
                    .position(|w| w == b"*/")
                    .map(|pos| i + 2 + pos + 2)
                    .ok_or_else(|| syntax_error(file, src, i, "unterminated block comment"))?;
                out.extend(bytes[i..end].iter().map(|&b| blank(b)));
                i = end;
            }
            b'\'' | b'"' | b'`' => {
                let end = skip_quoted(bytes, i).ok_or_else(|| {
                    let what = if b == b'\'' { "string literal" } else { "quoted identifier" };
                    syntax_error(file, src, i, format!("unterminated {}", what))
                })?;
                out.extend_from_slice(&bytes[i..end]);
                i = end;
            }
            b'$' => match dollar_tag(bytes, i) {
                Some(tag_end) => {
                    let end = skip_dollar_quoted(bytes, i, tag_end).ok_or_else(|| {
                        syntax_error(file, src, i, "unterminated dollar-quoted string")
                    })?;
                    out.extend_from_slice(&bytes[i..end]);
                    i = end;
                }
                None => {
                    out.push(b);
                    i += 1;
                }
            },
            _ => {
                out.push(b);
                i += 1;
            }
        }
    }

    // only ASCII bytes were substituted, so this cannot fail on valid input
    String::from_utf8(out).map_err(|e| Error::Unknown(e.to_string()))
}

/// Iterates the code bytes of a text. A quoted region is reported once, as its
/// opening byte, and then skipped entirely.
pub struct CodeBytes<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for CodeBytes<'a> {
    type Item = (usize, u8);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.bytes.len() {
            return None;
        }

        let start = self.pos;
        let b = self.bytes[start];
        self.pos = match b {
            b'\'' | b'"' | b'`' => skip_quoted(self.bytes, start).unwrap_or(self.bytes.len()),
            b'$' => match dollar_tag(self.bytes, start) {
                Some(tag_end) => skip_dollar_quoted(self.bytes, start, tag_end)
                    .unwrap_or(self.bytes.len()),
                None => start + 1,
            },
            _ => start + 1,
        };

        Some((start, b))
    }
}

pub fn code_bytes(text: &str) -> CodeBytes<'_> {
    CodeBytes {
        bytes: text.as_bytes(),
        pos: 0,
    }
}

/// One `;`-terminated statement; `offset` is where `text` starts in the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Statement<'a> {
    pub offset: usize,
    pub text: &'a str,
}

/// Trim a slice, returning the offset of the trimmed start relative to the slice
fn trim_with_offset(text: &str) -> (usize, &str) {
    let trimmed_start = text.trim_start();
    let lead = text.len() - trimmed_start.len();
    (lead, trimmed_start.trim_end())
}

/// Split comment-free SQL into statements at top-level semicolons, checking
/// that parentheses balance within each statement
pub fn split_statements<'a>(src: &'a str, file: &str) -> Result<Vec<Statement<'a>>> {
    let mut statements = Vec::new();
    let mut open_parens: Vec<usize> = Vec::new();
    let mut start = 0;

    let push = |from: usize, to: usize, statements: &mut Vec<Statement<'a>>| {
        let (lead, text) = trim_with_offset(&src[from..to]);
        if !text.is_empty() {
            statements.push(Statement {
                offset: from + lead,
                text,
            });
        }
    };

    for (i, b) in code_bytes(src) {
        match b {
            b'(' => open_parens.push(i),
            b')' => {
                if open_parens.pop().is_none() {
                    return Err(syntax_error(file, src, i, "unmatched closing parenthesis"));
                }
            }
            b';' => {
                if let Some(&open) = open_parens.last() {
                    return Err(syntax_error(file, src, open, "unclosed parenthesis"));
                }
                push(start, i, &mut statements);
                start = i + 1;
            }
            _ => {}
        }
    }

    if let Some(&open) = open_parens.last() {
        return Err(syntax_error(file, src, open, "unclosed parenthesis"));
    }
    push(start, src.len(), &mut statements);

    Ok(statements)
}

/// Split on `sep` outside quotes and parentheses. Pieces are trimmed and carry
/// their offset into `text`; empty pieces are kept so callers can reject them.
pub fn split_top_level(text: &str, sep: u8) -> Vec<(usize, &str)> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, b) in code_bytes(text) {
        match b {
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            _ if b == sep && depth == 0 => {
                let (lead, piece) = trim_with_offset(&text[start..i]);
                pieces.push((start + lead, piece));
                start = i + 1;
            }
            _ => {}
        }
    }

    let (lead, piece) = trim_with_offset(&text[start..]);
    pieces.push((start + lead, piece));
    pieces
}

/// Split a definition into words at top-level whitespace. A parenthesised
/// group that follows a word after a space (`NUMERIC (10, 2)`) joins that word.
pub fn split_words(text: &str) -> Vec<(usize, &str)> {
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut depth = 0usize;
    let mut start: Option<usize> = None;

    for (i, b) in code_bytes(text) {
        match b {
            b'(' => {
                depth += 1;
                start.get_or_insert(i);
            }
            b')' => depth = depth.saturating_sub(1),
            _ if b.is_ascii_whitespace() && depth == 0 => {
                if let Some(s) = start.take() {
                    spans.push((s, i));
                }
            }
            _ => {
                start.get_or_insert(i);
            }
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }

    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(spans.len());
    for (s, e) in spans {
        match merged.last_mut() {
            Some(last) if text.as_bytes()[s] == b'(' => last.1 = e,
            _ => merged.push((s, e)),
        }
    }

    merged.into_iter().map(|(s, e)| (s, &text[s..e])).collect()
}

/// Index of the parenthesis closing the one at `open`
pub fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;

    for (i, b) in code_bytes(&text[open..]) {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn strips_comments_but_keeps_offsets() {
        let src = "CREATE TABLE a ( -- note\n  id INT /* inline */ ,\n  s TEXT DEFAULT '--not a comment'\n);";
        let stripped = strip_comments(src, "a.sql").unwrap();

        assert_eq!(stripped.len(), src.len());
        assert!(!stripped.contains("note"));
        assert!(!stripped.contains("inline"));
        assert!(stripped.contains("'--not a comment'"));
        assert_eq!(stripped.matches('\n').count(), src.matches('\n').count());
    }

    #[test]
    fn unterminated_block_comment_is_positioned() {
        let err = strip_comments("SELECT 1;\n  /* never closed", "x.sql").unwrap_err();
        match err {
            Error::SyntaxError { line, column, .. } => assert_eq!((line, column), (2, 3)),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn splits_statements_outside_quotes_and_dollar_bodies() {
        let src = "CREATE TABLE a (x TEXT DEFAULT ';');\nDO $$ BEGIN PERFORM 1; END $$;\n\n";
        let statements = split_statements(src, "a.sql").unwrap();

        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].text, "CREATE TABLE a (x TEXT DEFAULT ';')");
        assert_eq!(statements[1].text, "DO $$ BEGIN PERFORM 1; END $$");
        assert_eq!(statements[1].offset, src.find("DO").unwrap());
    }

    #[test]
    fn unbalanced_parentheses_fail_at_open_paren() {
        let src = "CREATE TABLE t (\n  price NUMERIC(10,2\n);";
        let err = split_statements(src, "t.sql").unwrap_err();
        match err {
            Error::SyntaxError { file, line, column, .. } => {
                assert_eq!(file, "t.sql");
                assert_eq!((line, column), (1, 16));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn top_level_split_respects_nesting() {
        let pieces = split_top_level("id INT, price NUMERIC(10, 2), CHECK (a IN ('x,y')),", b',');
        let texts: Vec<&str> = pieces.iter().map(|(_, p)| *p).collect();
        assert_eq!(
            texts,
            vec!["id INT", "price NUMERIC(10, 2)", "CHECK (a IN ('x,y'))", ""]
        );
    }

    #[test]
    fn words_keep_parameter_groups_and_literals() {
        let words: Vec<&str> = split_words("NUMERIC (10, 2) DEFAULT 'a b' NOT NULL")
            .into_iter()
            .map(|(_, w)| w)
            .collect();
        assert_eq!(words, vec!["NUMERIC (10, 2)", "DEFAULT", "'a b'", "NOT", "NULL"]);
    }

    #[test]
    fn finds_matching_paren() {
        let text = "t (a NUMERIC(1,2), b TEXT) rest";
        assert_eq!(matching_paren(text, 2), Some(25));
        assert_eq!(matching_paren("(unclosed", 0), None);
    }
}

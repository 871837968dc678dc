//! Lexical helpers for rewriting generated SQL without a full parser.
//!
//! Every helper keeps byte offsets stable: masked strings have exactly the same
//! length as their input so positions found in the mask can be used to slice the
//! original statement.

use regex::Regex;
use std::ops::Range;
use std::sync::LazyLock;

static CLAUSE_AFTER_FROM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:WHERE|GROUP\s+BY|HAVING|ORDER\s+BY|LIMIT|OFFSET|QUALIFY|WINDOW|UNION|INTERSECT|EXCEPT)\b")
        .expect("clause regex")
});

static CLAUSE_AFTER_WHERE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:GROUP\s+BY|HAVING|ORDER\s+BY|LIMIT|OFFSET|QUALIFY|WINDOW|UNION|INTERSECT|EXCEPT)\b")
        .expect("clause regex")
});

static FROM_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bFROM\b").expect("from regex"));

static WHERE_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bWHERE\b").expect("where regex"));

static TABLE_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(?:^|\bJOIN\b|,)\s*(?:"?[A-Za-z_][A-Za-z0-9_]*"?\.)?"?([A-Za-z_][A-Za-z0-9_]*)"?(?:\s+(?:AS\s+)?"?([A-Za-z_][A-Za-z0-9_]*)"?)?"#,
    )
    .expect("table ref regex")
});

const NON_ALIAS_WORDS: &[&str] = &[
    "on", "using", "join", "inner", "left", "right", "full", "outer", "cross", "natural",
    "where", "group", "order", "limit", "offset", "having", "as", "lateral", "window",
    "qualify", "union", "intersect", "except",
];

/// A table named in the FROM clause of one SELECT scope.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
    pub table: String,
    pub alias: Option<String>,
}

impl TableRef {
    /// The name a column must be qualified with to refer to this table.
    pub fn qualifier(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }
}

/// Removes `-- line` and `/* block */` comments that are not inside string literals.
pub fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut in_literal = false;

    while let Some(c) = chars.next() {
        if in_literal {
            out.push(c);
            if c == '\'' {
                in_literal = false;
            }
            continue;
        }
        match c {
            '\'' => {
                in_literal = true;
                out.push(c);
            }
            '-' if chars.peek() == Some(&'-') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }

    out
}

fn blank(out: &mut String, c: char) {
    for _ in 0..c.len_utf8() {
        out.push(' ');
    }
}

/// Blanks the contents of single-quoted literals, keeping the quotes.
pub fn mask_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    for c in sql.chars() {
        if c == '\'' {
            in_literal = !in_literal;
            out.push(c);
        } else if in_literal {
            blank(&mut out, c);
        } else {
            out.push(c);
        }
    }
    out
}

/// Blanks literal contents and everything nested inside parentheses, so that only
/// the outermost level of the statement remains visible. The outermost parentheses
/// themselves are kept.
pub fn mask_nested(sql: &str) -> String {
    let literals = mask_literals(sql);
    let mut out = String::with_capacity(literals.len());
    let mut depth = 0usize;
    for c in literals.chars() {
        match c {
            '(' => {
                depth += 1;
                if depth == 1 {
                    out.push(c);
                } else {
                    blank(&mut out, c);
                }
            }
            ')' => {
                if depth == 1 {
                    out.push(c);
                } else {
                    blank(&mut out, c);
                }
                depth = depth.saturating_sub(1);
            }
            _ if depth > 0 => blank(&mut out, c),
            _ => out.push(c),
        }
    }
    out
}

/// Byte ranges of the contents of first-level parenthesised groups that hold a
/// subquery (`(SELECT ...)` or `(WITH ...)`).
pub fn subquery_ranges(sql: &str) -> Vec<Range<usize>> {
    let literals = mask_literals(sql);
    let mut ranges = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;

    for (i, c) in literals.char_indices() {
        match c {
            '(' => {
                if depth == 0 {
                    start = i + 1;
                }
                depth += 1;
            }
            ')' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    let inner = literals[start..i].trim_start().to_ascii_lowercase();
                    if inner.starts_with("select") || inner.starts_with("with") {
                        ranges.push(start..i);
                    }
                }
            }
            _ => {}
        }
    }

    ranges
}

/// Position of the first top-level FROM keyword in a masked statement.
pub fn find_from(masked: &str) -> Option<Range<usize>> {
    FROM_KEYWORD.find(masked).map(|m| m.range())
}

/// Position of the top-level WHERE keyword that follows `after`.
pub fn find_where(masked: &str, after: usize) -> Option<Range<usize>> {
    WHERE_KEYWORD.find_at(masked, after).map(|m| m.range())
}

/// Start of the first clause that terminates a FROM list, searching from `after`.
pub fn end_of_from(masked: &str, after: usize) -> usize {
    CLAUSE_AFTER_FROM
        .find_at(masked, after)
        .map(|m| m.start())
        .unwrap_or(masked.len())
}

/// Start of the first clause that terminates a WHERE condition, searching from `after`.
pub fn end_of_where(masked: &str, after: usize) -> usize {
    CLAUSE_AFTER_WHERE
        .find_at(masked, after)
        .map(|m| m.start())
        .unwrap_or(masked.len())
}

/// Tables listed in a masked FROM segment (the text between FROM and the next clause).
pub fn table_refs(from_segment: &str) -> Vec<TableRef> {
    let is_keyword = |word: &str| NON_ALIAS_WORDS.contains(&word.to_ascii_lowercase().as_str());
    let mut refs = Vec::new();
    let mut pos = 0;

    while let Some(caps) = TABLE_REF.captures_at(from_segment, pos) {
        let (Some(whole), Some(table)) = (caps.get(0), caps.get(1)) else {
            break;
        };
        let mut next = whole.end();

        if !is_keyword(table.as_str()) {
            let alias = match caps.get(2) {
                // A keyword in alias position belongs to the next join; rescan from it.
                Some(alias) if is_keyword(alias.as_str()) => {
                    next = alias.start();
                    None
                }
                Some(alias) => Some(alias.as_str().to_string()),
                None => None,
            };
            refs.push(TableRef { table: table.as_str().to_string(), alias });
        }

        if next <= pos {
            break;
        }
        pos = next;
    }

    refs
}

/// Normalises a generated statement for execution: comments removed, every
/// semicolon dropped, surrounding whitespace trimmed.
pub fn normalize(sql: &str) -> String {
    strip_comments(sql).replace(';', " ").trim().to_string()
}

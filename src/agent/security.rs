//! Intent-level and SQL-level gates for every query.
//!
//! Intent checks (`classify`, `authorize`) run before any SQL exists and their
//! verdicts are terminal. SQL checks (`validate_sql`, `validate_projection`,
//! `apply_row_filter`) run on oracle output and their failures are retryable.

use regex::Regex;
use std::error::Error;
use std::fmt;
use std::sync::LazyLock;
use tracing::debug;

use super::sql_scan::{self, TableRef};
use super::state::{Role, UserContext};

/// Whether a query needs the database at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Conversational,
    Data,
}

/// Verdict of the intent-level authorization check.
#[derive(Debug, Clone, PartialEq)]
pub struct Authorization {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl Authorization {
    fn allow() -> Self {
        Self { allowed: true, reason: None }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self { allowed: false, reason: Some(reason.into()) }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterError {
    /// No scope of the statement reads a table that carries owner data.
    NoGuardedTable,
    /// The statement has a shape the rewriter refuses to touch.
    Unparseable(String),
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::NoGuardedTable => write!(
                f,
                "Row filter could not be applied: the query must read Properties, Owners, Units or Leases directly"
            ),
            FilterError::Unparseable(msg) => write!(f, "Row filter could not be applied: {}", msg),
        }
    }
}

impl Error for FilterError {}

static CONVERSATIONAL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\bhello\b",
        r"\bhi\b",
        r"\bhey\b",
        r"\bgreetings\b",
        r"\bhow are you\b",
        r"\bhow's it going\b",
        r"\bwhat can you do\b",
        r"\bwhat are you\b",
        r"\bwho are you\b",
        r"\bhelp me\b",
        r"\btell me about yourself\b",
        r"\bgood (?:morning|afternoon|evening)\b",
        r"\bthank you\b",
        r"\bthanks\b",
        r"\bbye\b",
        r"\bgoodbye\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("conversational regex"))
    .collect()
});

static OWNER_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:llc\s*(\d+)|owner(?:_id)?\s*(?:=|#|id|number)?\s*(\d+))\b").expect("owner regex")
});

static FIRST_PERSON_SCOPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:my|mine|our|i have|i own|do i|did i|have i)\b").expect("scope regex")
});

const UNSCOPED_TERMS: &[&str] = &[
    "all properties",
    "total properties",
    "entire",
    "every property",
    "all owners",
    "every owner",
    "everyone",
    "admin",
];

static VIEWER_SENSITIVE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\baddress(?:es)?\b",
        r"\btenants?\b",
        r"\bnames?\b",
        r"\bcontacts?\b",
        r"\bphones?\b",
        r"\be-?mails?\b",
        r"\bunit numbers?\b",
        r"\bzip(?: code)?s?\b",
        r"\b(?:list|show|display|enumerate|which)\b.*\b(?:properties|units|leases|tenants|owners)\b",
        r"\bllc\s*\d\b",
        r"\bowner\s+\d\b",
        r"\b(?:for|of|does|do)\s+llc",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("viewer regex"))
    .collect()
});

static FORBIDDEN_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(insert|update|delete|drop|alter|create|truncate|exec|execute|attach|detach|copy|pragma|install|load|grant|revoke|vacuum)\b",
    )
    .expect("dml regex")
});

static SET_OPERATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(UNION|INTERSECT|EXCEPT)\b").expect("set operation regex"));

static TAUTOLOGY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bOR\s+(?:(\d+)\s*=\s*(\d+)|'([^']*)'\s*=\s*'([^']*)')").expect("tautology regex")
});

static SENSITIVE_COLUMN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(address|tenant_name|contact_email|contact_phone|owner_name|unit_number|zip_code)\b")
        .expect("column regex")
});

static SELECT_STAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bSELECT\s+(?:DISTINCT\s+)?(?:\w+\.)?\*").expect("star regex"));

static TOP_LEVEL_OR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bOR\b").expect("or regex"));

static TOP_LEVEL_AND: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bAND\b").expect("and regex"));

static FILESYSTEM_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?:[A-Za-z]:\\[^\s"']+|/[^\s"']+/)"#).expect("path regex"));

/// Stateless query gate. All checks are pure functions of their inputs.
#[derive(Debug, Default, Clone, Copy)]
pub struct SecurityValidator;

impl SecurityValidator {
    pub fn classify(query: &str) -> Classification {
        let normalized = query.trim().to_lowercase();
        if CONVERSATIONAL_PATTERNS.iter().any(|p| p.is_match(&normalized)) {
            Classification::Conversational
        } else {
            Classification::Data
        }
    }

    pub fn authorize(query: &str, context: &UserContext) -> Authorization {
        let normalized = query.to_lowercase();

        match context.role {
            Role::Admin => Authorization::allow(),
            Role::Owner => {
                let own_id = context.owner_id.unwrap_or_default();
                for caps in OWNER_REFERENCE.captures_iter(&normalized) {
                    let referenced = caps
                        .get(1)
                        .or_else(|| caps.get(2))
                        .and_then(|m| m.as_str().parse::<i64>().ok());
                    if let Some(id) = referenced {
                        if id != own_id {
                            return Authorization::deny(format!(
                                "Access denied: As an owner, you can only view your own properties (LLC{}). You cannot query other owners' data.",
                                own_id
                            ));
                        }
                    }
                }

                let scoped = FIRST_PERSON_SCOPE.is_match(&normalized);
                if !scoped && UNSCOPED_TERMS.iter().any(|t| normalized.contains(t)) {
                    return Authorization::deny(
                        "Access denied: As an owner, you can only view your own properties. Try asking 'How many properties do I have?' instead.",
                    );
                }

                Authorization::allow()
            }
            Role::Viewer => {
                if VIEWER_SENSITIVE.iter().any(|p| p.is_match(&normalized)) {
                    return Authorization::deny(
                        "Access denied: Viewers can only access aggregated data (counts, averages, totals). Detailed property information is restricted.",
                    );
                }
                Authorization::allow()
            }
        }
    }

    /// Rejects statements that could modify data or smuggle in a second statement.
    pub fn validate_sql(sql: &str) -> Result<(), String> {
        if let Some(m) = FORBIDDEN_KEYWORD.find(sql) {
            return Err(format!(
                "Forbidden SQL operation detected: {}",
                m.as_str().to_uppercase()
            ));
        }

        let visible = sql_scan::mask_literals(&sql_scan::strip_comments(sql));
        if let Some(pos) = visible.find(';') {
            if !visible[pos + 1..].trim_matches(|c: char| c == ';' || c.is_whitespace()).is_empty() {
                return Err("Multiple SQL statements are not allowed".to_string());
            }
        }

        // Every branch of a set operation would need its own row filter
        if let Some(m) = SET_OPERATION.find(&visible) {
            return Err(format!(
                "Potential SQL injection detected: {} is not allowed",
                m.as_str().to_uppercase()
            ));
        }

        for caps in TAUTOLOGY.captures_iter(sql) {
            let numeric = caps.get(1).zip(caps.get(2)).map(|(a, b)| a.as_str() == b.as_str());
            let textual = caps.get(3).zip(caps.get(4)).map(|(a, b)| a.as_str() == b.as_str());
            if numeric.or(textual).unwrap_or(false) {
                return Err("Potential SQL injection detected: always-true condition".to_string());
            }
        }

        Ok(())
    }

    /// Role-specific projection check. Viewers may never select identifying columns.
    pub fn validate_projection(sql: &str, context: &UserContext) -> Result<(), String> {
        if context.role != Role::Viewer {
            return Ok(());
        }
        let visible = sql_scan::mask_literals(sql);
        if let Some(m) = SENSITIVE_COLUMN.find(&visible) {
            return Err(format!(
                "Viewers may only query aggregated data; column '{}' is not permitted",
                m.as_str()
            ));
        }
        if SELECT_STAR.is_match(&visible) {
            return Err("Viewers may only query aggregated data; SELECT * is not permitted".to_string());
        }
        Ok(())
    }

    /// Constrains every SELECT scope that reads owner data to `owner_id`.
    pub fn apply_row_filter(sql: &str, owner_id: i64) -> Result<String, FilterError> {
        let trimmed = sql.trim().trim_end_matches(';').trim_end();
        if trimmed.is_empty() {
            return Err(FilterError::Unparseable("empty statement".to_string()));
        }
        if trimmed.matches('(').count() != trimmed.matches(')').count() {
            return Err(FilterError::Unparseable("unbalanced parentheses".to_string()));
        }

        let (filtered, constrained) = scope_statement(trimmed, owner_id)?;
        if !constrained {
            return Err(FilterError::NoGuardedTable);
        }
        debug!("Row filter applied for owner {}: {}", owner_id, filtered);
        Ok(filtered)
    }

    /// Applies the row filter only when the session requires it.
    pub fn scope_for(sql: &str, context: &UserContext) -> Result<String, FilterError> {
        match (context.role, context.owner_id) {
            (Role::Owner, Some(owner_id)) => Self::apply_row_filter(sql, owner_id),
            _ => Ok(sql.to_string()),
        }
    }

    /// Removes filesystem paths from data-layer error messages.
    pub fn sanitize_error(error: &str) -> String {
        FILESYSTEM_PATH.replace_all(error, "[PATH]/").to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Guarded {
    Properties,
    Owners,
    Units,
    Leases,
}

impl Guarded {
    fn of(table: &str) -> Option<Self> {
        match table.to_ascii_lowercase().as_str() {
            "properties" => Some(Guarded::Properties),
            "owners" => Some(Guarded::Owners),
            "units" => Some(Guarded::Units),
            "leases" => Some(Guarded::Leases),
            _ => None,
        }
    }

    fn condition(self, qualifier: &str, owner_id: i64) -> String {
        match self {
            Guarded::Properties | Guarded::Owners => format!("{}.owner_id = {}", qualifier, owner_id),
            Guarded::Units => format!(
                "{}.property_id IN (SELECT property_id FROM Properties WHERE owner_id = {})",
                qualifier, owner_id
            ),
            Guarded::Leases => format!(
                "{}.unit_id IN (SELECT fu.unit_id FROM Units fu JOIN Properties fp ON fu.property_id = fp.property_id WHERE fp.owner_id = {})",
                qualifier, owner_id
            ),
        }
    }
}

/// Rewrites nested scopes first, then the outermost one. Returns the new statement
/// and whether any scope was constrained.
fn scope_statement(sql: &str, owner_id: i64) -> Result<(String, bool), FilterError> {
    let mut out = sql.to_string();
    let mut constrained = false;

    for range in sql_scan::subquery_ranges(sql).into_iter().rev() {
        let (inner, inner_constrained) = scope_statement(&sql[range.clone()], owner_id)?;
        constrained |= inner_constrained;
        out.replace_range(range, &inner);
    }

    let masked = sql_scan::mask_nested(&out);
    if let Some(m) = SET_OPERATION.find(&masked) {
        return Err(FilterError::Unparseable(format!(
            "cannot scope {} branches",
            m.as_str().to_uppercase()
        )));
    }
    let Some(from) = sql_scan::find_from(&masked) else {
        return Ok((out, constrained));
    };
    let from_end = sql_scan::end_of_from(&masked, from.end);
    let refs = sql_scan::table_refs(&masked[from.end..from_end]);

    let Some(primary) = refs.iter().filter_map(|r| Guarded::of(&r.table)).min() else {
        return Ok((out, constrained));
    };
    let bound: Vec<&TableRef> = refs
        .iter()
        .filter(|r| Guarded::of(&r.table) == Some(primary))
        .collect();

    let where_kw = sql_scan::find_where(&masked, from_end).filter(|w| w.start == from_end);
    if let Some(where_kw) = &where_kw {
        let cond_end = sql_scan::end_of_where(&masked, where_kw.end);
        let existing = &masked[where_kw.end..cond_end];
        let has_or = TOP_LEVEL_OR.is_match(existing);
        if !has_or
            && matches!(primary, Guarded::Properties | Guarded::Owners)
            && bound.iter().all(|r| already_bound(existing, r, owner_id))
        {
            return Ok((out, true));
        }
    }

    let condition = bound
        .iter()
        .map(|r| primary.condition(r.qualifier(), owner_id))
        .collect::<Vec<_>>()
        .join(" AND ");

    let rewritten = match where_kw {
        Some(where_kw) => {
            let cond_end = sql_scan::end_of_where(&masked, where_kw.end);
            let existing = out[where_kw.end..cond_end].trim();
            if existing.is_empty() {
                return Err(FilterError::Unparseable("empty WHERE clause".to_string()));
            }
            let rest = out[cond_end..].trim_start();
            let mut s = format!("{} {} AND ({})", &out[..where_kw.end], condition, existing);
            if !rest.is_empty() {
                s.push(' ');
                s.push_str(rest);
            }
            s
        }
        None => {
            let insert_at = from_end;
            let rest = out[insert_at..].trim_start();
            let mut s = format!("{} WHERE {}", out[..insert_at].trim_end(), condition);
            if !rest.is_empty() {
                s.push(' ');
                s.push_str(rest);
            }
            s
        }
    };

    Ok((rewritten, true))
}

/// True when a top-level conjunct of the masked WHERE text is exactly the owner
/// predicate for `table`. Nested groups are blank in `masked_condition`, so
/// predicates under `NOT (...)` or inside subqueries never count.
fn already_bound(masked_condition: &str, table: &TableRef, owner_id: i64) -> bool {
    let pattern = format!(
        r"(?i)^(?:{}\s*\.\s*)?owner_id\s*=\s*{}$",
        regex::escape(table.qualifier()),
        owner_id
    );
    let Ok(exact) = Regex::new(&pattern) else {
        return false;
    };
    TOP_LEVEL_AND
        .split(masked_condition)
        .any(|conjunct| exact.is_match(conjunct.trim()))
}

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::LazyLock;
use tracing::debug;

use crate::db::executor::QueryResult;

const FOLLOW_UP_MARKER: &str = "(follow-up context:";

const STATE_ALIASES: &[(&str, &str)] = &[
    ("california", "California"),
    ("cali", "California"),
    ("ca", "California"),
    ("texas", "Texas"),
    ("tx", "Texas"),
    ("arizona", "Arizona"),
    ("ariz", "Arizona"),
    ("az", "Arizona"),
    ("florida", "Florida"),
    ("fl", "Florida"),
    ("new york", "New York"),
    ("ny", "New York"),
    ("illinois", "Illinois"),
    ("il", "Illinois"),
    ("pennsylvania", "Pennsylvania"),
    ("pa", "Pennsylvania"),
    ("washington", "Washington"),
    ("wa", "Washington"),
];

const PROPERTY_TYPES: &[&str] = &[
    "Single Family",
    "Multi-Family",
    "Commercial",
    "Residential",
    "Apartment",
    "Condo",
];

static STATE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    STATE_ALIASES
        .iter()
        .map(|(alias, state)| {
            let re = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(alias))).expect("state regex");
            (re, *state)
        })
        .collect()
});

static OWNER_IN_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bLLC\s?(\d+)\b").expect("owner regex"));

static OWNER_IN_SQL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bowner_id\s*=\s*(\d+)\b").expect("owner sql regex"));

static LEAD_FOLLOW_UP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:what about|how about|and|also)\b|^\s*(?:in|for)\s+[\w\s-]{1,30}\?\s*$")
        .expect("lead follow-up regex")
});

static PRONOUN_FOLLOW_UP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:those|them|these|that one|same)\b").expect("pronoun regex")
});

static AGGREGATE_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:average|avg|mean|total|sum|count|how many|max|maximum|min|minimum|highest|lowest)\b")
        .expect("aggregate regex")
});

static SUBJECT_NOUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:propert(?:y|ies)|units?|leases?|tenants?|owners?|homes?|buildings?|llc\s?\d+)\b")
        .expect("subject regex")
});

/// Signals remembered between turns. Each key is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CurrentContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_type: Option<String>,
}

impl CurrentContext {
    pub fn is_empty(&self) -> bool {
        self.location.is_none() && self.owner.is_none() && self.topic.is_none() && self.property_type.is_none()
    }

    /// Per-key overwrite: keys present in `newer` replace ours, absent keys are kept.
    fn merge(&mut self, newer: &CurrentContext) {
        if newer.location.is_some() {
            self.location = newer.location.clone();
        }
        if newer.owner.is_some() {
            self.owner = newer.owner.clone();
        }
        if newer.topic.is_some() {
            self.topic = newer.topic.clone();
        }
        if newer.property_type.is_some() {
            self.property_type = newer.property_type.clone();
        }
    }

    /// Context signals found in one piece of text.
    fn from_text(text: &str) -> Self {
        let lower = text.to_lowercase();

        let location = STATE_PATTERNS
            .iter()
            .find(|(re, _)| re.is_match(text))
            .map(|(_, state)| state.to_string());

        let property_type = PROPERTY_TYPES
            .iter()
            .find(|t| lower.contains(&t.to_lowercase()))
            .map(|t| t.to_string());

        let has_any = |words: &[&str]| words.iter().any(|w| lower.contains(w));
        let topic = if has_any(&["rent", "rental", "income", "average"]) {
            Some("rent")
        } else if has_any(&["profit", "profitable", "profitability"]) {
            Some("profitability")
        } else if has_any(&["count", "how many", "number of"]) {
            Some("count")
        } else if has_any(&["property", "properties"]) {
            Some("properties")
        } else {
            None
        }
        .map(str::to_string);

        let owner = OWNER_IN_TEXT
            .captures(text)
            .or_else(|| OWNER_IN_SQL.captures(text))
            .and_then(|caps| caps.get(1))
            .map(|id| format!("LLC{}", id.as_str()));

        Self {
            location,
            owner,
            topic,
            property_type,
        }
    }

    /// Query signals first; keys the query leaves open are filled from the SQL.
    pub fn extract(query: &str, sql: Option<&str>) -> Self {
        let mut context = Self::from_text(query);
        if let Some(sql) = sql {
            let from_sql = Self::from_text(sql);
            context.location = context.location.or(from_sql.location);
            context.owner = context.owner.or(from_sql.owner);
            context.topic = context.topic.or(from_sql.topic);
            context.property_type = context.property_type.or(from_sql.property_type);
        }
        context
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub sql: Option<String>,
    pub result: Option<QueryResult>,
    pub answer: String,
    pub extracted_context: CurrentContext,
}

impl ConversationTurn {
    pub fn new(query: &str, sql: Option<String>, result: Option<QueryResult>, answer: &str) -> Self {
        let extracted_context = CurrentContext::extract(query, sql.as_deref());
        Self {
            timestamp: Utc::now(),
            query: query.to_string(),
            sql,
            result,
            answer: answer.to_string(),
            extracted_context,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStats {
    pub turn_count: usize,
    pub context_snapshot: CurrentContext,
    pub most_common_topic: Option<String>,
    pub most_common_location: Option<String>,
}

/// Bounded per-session conversation log.
#[derive(Debug, Clone)]
pub struct ConversationMemory {
    max_history: usize,
    turns: VecDeque<ConversationTurn>,
    current: CurrentContext,
}

impl Default for ConversationMemory {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ConversationMemory {
    pub fn new(max_history: usize) -> Self {
        Self {
            max_history: max_history.max(1),
            turns: VecDeque::with_capacity(max_history.max(1)),
            current: CurrentContext::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn current_context(&self) -> &CurrentContext {
        &self.current
    }

    /// Whether `query` leans on earlier turns for its subject.
    pub fn is_follow_up(query: &str) -> bool {
        if LEAD_FOLLOW_UP.is_match(query) || PRONOUN_FOLLOW_UP.is_match(query) {
            return true;
        }
        query.split_whitespace().count() <= 4
            && AGGREGATE_WORD.is_match(query)
            && !SUBJECT_NOUN.is_match(query)
    }

    /// Rewrites a follow-up with the context it leaves implicit. Standalone
    /// queries, and queries already rewritten, come back unchanged.
    pub fn enhance(&self, query: &str) -> String {
        if query.contains(FOLLOW_UP_MARKER) || self.current.is_empty() || !Self::is_follow_up(query) {
            return query.to_string();
        }

        let explicit = CurrentContext::from_text(query);
        let mut parts = Vec::new();

        match (&self.current.owner, &self.current.location) {
            (Some(owner), _) if explicit.owner.is_none() => parts.push(format!("owner {}", owner)),
            (_, Some(location)) if explicit.location.is_none() && explicit.owner.is_none() => {
                parts.push(format!("location {}", location))
            }
            _ => {}
        }
        if let (Some(topic), None) = (&self.current.topic, &explicit.topic) {
            parts.push(format!("topic {}", topic));
        }
        if let (Some(property_type), None) = (&self.current.property_type, &explicit.property_type) {
            parts.push(format!("property type {}", property_type));
        }

        if parts.is_empty() {
            return query.to_string();
        }

        let enhanced = format!("{} {} {})", query.trim_end(), FOLLOW_UP_MARKER, parts.join("; "));
        debug!("Enhanced follow-up query: {}", enhanced);
        enhanced
    }

    /// Appends a turn, evicting the oldest at capacity.
    pub fn record(&mut self, turn: ConversationTurn) {
        if self.turns.len() == self.max_history {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
        self.recompute_context();
    }

    fn recompute_context(&mut self) {
        let mut context = CurrentContext::default();
        for turn in &self.turns {
            context.merge(&turn.extracted_context);
        }
        self.current = context;
    }

    pub fn clear(&mut self) {
        self.turns.clear();
        self.current = CurrentContext::default();
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            turn_count: self.turns.len(),
            context_snapshot: self.current.clone(),
            most_common_topic: most_common(self.turns.iter().filter_map(|t| t.extracted_context.topic.as_deref())),
            most_common_location: most_common(
                self.turns.iter().filter_map(|t| t.extracted_context.location.as_deref()),
            ),
        }
    }

    /// Context block for the answer oracle. Empty unless the last recorded query
    /// was itself a follow-up.
    pub fn context_prompt(&self) -> String {
        let Some(last) = self.turns.back() else {
            return String::new();
        };
        if !Self::is_follow_up(&last.query) {
            return String::new();
        }

        let mut lines = vec!["Previous query context:".to_string()];
        if let Some(owner) = &self.current.owner {
            lines.push(format!("- Owner: {}", owner));
        }
        if let Some(location) = &self.current.location {
            lines.push(format!("- Location: {}", location));
        }
        if let Some(topic) = &self.current.topic {
            lines.push(format!("- Topic: {}", topic));
        }
        if lines.len() == 1 {
            return String::new();
        }
        lines.join("\n")
    }

    pub fn recent_summary(&self, n: usize) -> String {
        if self.turns.is_empty() {
            return String::new();
        }
        let skip = self.turns.len().saturating_sub(n);
        let mut lines = vec!["Recent questions:".to_string()];
        for (i, turn) in self.turns.iter().skip(skip).enumerate() {
            lines.push(format!("{}. Q: {}", i + 1, truncate(&turn.query, 80)));
            lines.push(format!("   A: {}", truncate(&turn.answer, 100)));
        }
        lines.join("\n")
    }

    pub fn history(&self) -> Vec<ConversationTurn> {
        self.turns.iter().cloned().collect()
    }
}

/// Most frequent value; ties go to the most recent.
fn most_common<'a>(values: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut counts: Vec<(&str, usize, usize)> = Vec::new();
    for (i, value) in values.enumerate() {
        match counts.iter_mut().find(|(v, _, _)| *v == value) {
            Some(entry) => {
                entry.1 += 1;
                entry.2 = i;
            }
            None => counts.push((value, 1, i)),
        }
    }
    counts
        .into_iter()
        .max_by_key(|(_, count, last)| (*count, *last))
        .map(|(value, _, _)| value.to_string())
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(query: &str, sql: Option<&str>) -> ConversationTurn {
        ConversationTurn::new(query, sql.map(str::to_string), None, "ok")
    }

    #[test]
    fn extracts_context_from_query_then_sql() {
        let ctx = CurrentContext::extract(
            "How many Single Family properties does LLC2 have?",
            Some("SELECT COUNT(*) FROM Properties WHERE state = 'AZ'"),
        );
        assert_eq!(ctx.owner.as_deref(), Some("LLC2"));
        assert_eq!(ctx.topic.as_deref(), Some("count"));
        assert_eq!(ctx.property_type.as_deref(), Some("Single Family"));
        assert_eq!(ctx.location.as_deref(), Some("Arizona"));
    }

    #[test]
    fn owner_can_come_from_sql_filter() {
        let ctx = CurrentContext::extract("How many do I have?", Some("SELECT COUNT(*) FROM Properties WHERE owner_id = 4"));
        assert_eq!(ctx.owner.as_deref(), Some("LLC4"));
    }

    #[test]
    fn standalone_queries_pass_through() {
        let mut memory = ConversationMemory::default();
        memory.record(turn("How many properties does LLC2 have?", None));
        let query = "What is the average rent of Commercial properties in Texas?";
        assert_eq!(memory.enhance(query), query);
    }

    #[test]
    fn existential_question_is_not_a_follow_up() {
        let mut memory = ConversationMemory::default();
        memory.record(turn("How many properties does LLC2 have?", None));
        let query = "How many properties are there in Texas?";
        assert!(!ConversationMemory::is_follow_up(query));
        assert_eq!(memory.enhance(query), query);
    }

    #[test]
    fn empty_memory_never_rewrites() {
        assert_eq!(ConversationMemory::default().enhance("What about Arizona?"), "What about Arizona?");
    }

    #[test]
    fn follow_up_prefers_owner_over_location() {
        let mut memory = ConversationMemory::default();
        memory.record(turn("How many properties does LLC2 have in Texas?", None));

        let enhanced = memory.enhance("What about Arizona?");
        assert!(enhanced.starts_with("What about Arizona?"));
        assert!(enhanced.contains("owner LLC2"));
        assert!(!enhanced.contains("location"));
        assert!(enhanced.contains("topic count"));

        let pronoun = memory.enhance("Show those again");
        assert!(pronoun.contains("owner LLC2"));
    }

    #[test]
    fn location_fills_in_without_owner() {
        let mut memory = ConversationMemory::default();
        memory.record(turn("What is the average rent in Arizona?", None));
        let enhanced = memory.enhance("And the total?");
        assert!(enhanced.contains("location Arizona"));
        assert!(enhanced.contains("topic rent"));
        assert!(!enhanced.contains("owner"));
    }

    #[test]
    fn bare_aggregate_is_a_follow_up() {
        assert!(ConversationMemory::is_follow_up("average rent?"));
        assert!(!ConversationMemory::is_follow_up("average rent of units?"));
        assert!(!ConversationMemory::is_follow_up("List the cities we operate in"));
    }

    #[test]
    fn enhance_is_idempotent() {
        let mut memory = ConversationMemory::default();
        memory.record(turn("How many properties does LLC5 have?", None));
        let once = memory.enhance("what about Phoenix?");
        assert_ne!(once, "what about Phoenix?");
        assert_eq!(memory.enhance(&once), once);
    }

    #[test]
    fn record_evicts_oldest_and_context_tracks_history() {
        let mut memory = ConversationMemory::new(2);
        memory.record(turn("How many properties does LLC1 have in Texas?", None));
        memory.record(turn("What is the average rent?", None));
        assert_eq!(memory.current_context().owner.as_deref(), Some("LLC1"));

        memory.record(turn("How many Condo units are there?", None));
        let stats = memory.stats();
        assert_eq!(stats.turn_count, 2);
        // The LLC1/Texas turn has been evicted, so its signals are gone too.
        assert_eq!(stats.context_snapshot.owner, None);
        assert_eq!(stats.context_snapshot.location, None);
        assert_eq!(stats.context_snapshot.property_type.as_deref(), Some("Condo"));
        assert_eq!(stats.context_snapshot.topic.as_deref(), Some("count"));
    }

    #[test]
    fn stats_report_most_common_values() {
        let mut memory = ConversationMemory::default();
        memory.record(turn("Average rent in Texas?", None));
        memory.record(turn("How many properties in Arizona?", None));
        memory.record(turn("Total rental income in Arizona?", None));
        let stats = memory.stats();
        assert_eq!(stats.turn_count, 3);
        assert_eq!(stats.most_common_topic.as_deref(), Some("rent"));
        assert_eq!(stats.most_common_location.as_deref(), Some("Arizona"));
    }

    #[test]
    fn clear_empties_everything() {
        let mut memory = ConversationMemory::default();
        memory.record(turn("How many properties does LLC2 have?", None));
        memory.clear();
        assert!(memory.is_empty());
        assert!(memory.current_context().is_empty());
        assert_eq!(memory.stats().turn_count, 0);
    }

    #[test]
    fn context_prompt_only_after_follow_up() {
        let mut memory = ConversationMemory::default();
        memory.record(turn("How many properties does LLC2 have?", None));
        assert!(memory.context_prompt().is_empty());

        memory.record(turn("What about Arizona?", None));
        let prompt = memory.context_prompt();
        assert!(prompt.starts_with("Previous query context:"));
        assert!(prompt.contains("- Owner: LLC2"));
        assert!(prompt.contains("- Location: Arizona"));
    }

    #[test]
    fn recent_summary_truncates() {
        let mut memory = ConversationMemory::default();
        memory.record(turn(&"x".repeat(90), None));
        memory.record(turn("How many units?", None));
        let summary = memory.recent_summary(1);
        assert!(summary.contains("1. Q: How many units?"));
        assert!(!summary.contains("xxx"));
        assert!(memory.recent_summary(2).contains("..."));
    }
}

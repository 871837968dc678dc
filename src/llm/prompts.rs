use tracing::{debug, info, warn};

use super::models::{AnswerGenerationInput, SqlGenerationInput};

// Leading keywords of lines that look like a statement. Mutation verbs are
// included so that they reach validation instead of being silently dropped.
const STATEMENT_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "INSERT", "UPDATE", "DELETE", "CREATE", "ALTER", "DROP",
];

pub const SQL_SYSTEM_PROMPT: &str = "You are an expert SQL query generator for a property management database running on DuckDB.";

pub const ANSWER_SYSTEM_PROMPT: &str = "You are a helpful property management assistant. Convert SQL query results into a clear, natural language answer. Be concise but informative. Format currency with $ and counts as integers.";

pub fn sql_prompt(input: &SqlGenerationInput) -> String {
    let mut prompt = format!(
        r#"### Instructions:
Convert the question into a single read-only SQL query for DuckDB, given the database schema below.
Adhere to these rules:
- ONLY generate SELECT queries. Never modify data or schema.
- Use table aliases and proper JOIN clauses to connect related tables.
- For questions about "active" properties, use the is_active = 1 condition.
- For counting properties, use COUNT(DISTINCT property_id).
- For average rent, use AVG(monthly_rent) from the Units table.
- When asked about "my properties", the system handles owner filtering; do not guess an owner.
- Only add location filters that are explicitly mentioned in the question.
- "out of [location]" means EXCLUDE that location.

### Schema:
{}

### Question:
{}
"#,
        input.schema, input.question
    );

    if let Some(error) = &input.prior_error {
        prompt.push_str(&format!(
            "\n### Previous attempt failed with error:\n{}\nCorrect the SQL query to fix this error.\n",
            error
        ));
    }

    prompt.push_str("\nReturn ONLY the SQL query, nothing else.\n```sql\n");
    prompt
}

pub fn answer_prompt(input: &AnswerGenerationInput) -> String {
    let mut prompt = format!(
        "Question: {}\n\nSQL Query: {}\n\nResults:\n{}\n\n",
        input.question, input.sql, input.result_summary
    );
    if let Some(context) = input.context.as_deref().filter(|c| !c.is_empty()) {
        prompt.push_str(context);
        prompt.push_str("\n\n");
    }
    prompt.push_str(
        "Answer the question based ONLY on these results, not on conversation context.",
    );
    prompt
}

/// Pulls the SQL statement out of a model completion.
pub fn extract_sql(content: &str) -> String {
    // ```sql ... ``` block
    if let Some(start) = content.find("```sql") {
        let after = &content[start + 6..];
        let end = after.find("```").unwrap_or(after.len());
        let sql = after[..end].trim();
        debug!("Extracted SQL from fenced block: {}", sql);
        return sql.to_string();
    }

    // Plain ``` ... ``` block
    if let Some(start) = content.find("```") {
        let after = &content[start + 3..];
        if let Some(end) = after.find("```") {
            let sql = after[..end].trim();
            debug!("Extracted SQL from plain code block: {}", sql);
            return sql.to_string();
        }
    }

    let lines: Vec<&str> = content.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let upper = line.trim().to_uppercase();
        if !STATEMENT_KEYWORDS.iter().any(|kw| upper.starts_with(kw)) {
            continue;
        }

        let mut sql = line.trim().to_string();
        if !sql.ends_with(';') {
            for next in &lines[i + 1..] {
                let next = next.trim();
                if next.starts_with("```") {
                    break;
                }
                sql.push(' ');
                sql.push_str(next);
                if next.ends_with(';') {
                    break;
                }
            }
        }
        info!("Extracted SQL using line scanning");
        return sql.trim().to_string();
    }

    warn!("Could not locate SQL in completion, using full content");
    content.trim().to_string()
}

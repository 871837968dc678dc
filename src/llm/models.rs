use serde::{Deserialize, Serialize};

// Input data for SQL generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlGenerationInput {
    pub question: String,
    pub schema: String,
    /// Reason the previous attempt was rejected, when retrying.
    pub prior_error: Option<String>,
}

// Input data for answer generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerGenerationInput {
    pub question: String,
    pub sql: String,
    pub result_summary: String,
    pub context: Option<String>,
}

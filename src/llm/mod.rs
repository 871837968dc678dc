pub mod models;
pub mod prompts;
pub mod providers;

use crate::config::LlmConfig;
use async_trait::async_trait;
use models::{AnswerGenerationInput, SqlGenerationInput};
use reqwest::StatusCode;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

#[derive(Debug)]
pub enum LlmError {
    ConnectionError(String),
    AuthError(String),
    QuotaExceeded(String),
    ResponseError(String),
    ConfigError(String),
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::ConnectionError(msg) => write!(f, "LLM connection error: {}", msg),
            LlmError::AuthError(msg) => write!(f, "LLM authentication error: {}", msg),
            LlmError::QuotaExceeded(msg) => write!(f, "LLM quota exceeded: {}", msg),
            LlmError::ResponseError(msg) => write!(f, "LLM response error: {}", msg),
            LlmError::ConfigError(msg) => write!(f, "LLM configuration error: {}", msg),
        }
    }
}

impl Error for LlmError {}

impl LlmError {
    /// Maps a non-success HTTP response to an error class.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let detail = if body.is_empty() {
            format!("API responded with status code: {}", status)
        } else {
            format!("API responded with status code: {} - {}", status, body)
        };

        if status == StatusCode::TOO_MANY_REQUESTS
            || body.contains("RESOURCE_EXHAUSTED")
            || body.to_lowercase().contains("quota")
        {
            LlmError::QuotaExceeded(detail)
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            LlmError::AuthError(detail)
        } else {
            LlmError::ResponseError(detail)
        }
    }

    /// Message shown to users in place of the raw error.
    pub fn friendly_message(&self) -> &'static str {
        match self {
            LlmError::QuotaExceeded(_) => {
                "I've reached my AI service usage limit. Please try again in a minute or contact your administrator for a higher quota."
            }
            LlmError::AuthError(_) | LlmError::ConfigError(_) => {
                "I'm having trouble connecting to my AI service. Please contact your administrator to verify the API key configuration."
            }
            LlmError::ConnectionError(_) => {
                "I'm having trouble connecting to my AI service. Please check the network connection and try again in a moment."
            }
            LlmError::ResponseError(_) => {
                "I encountered an unexpected error while processing your question. Please try rephrasing or contact your administrator."
            }
        }
    }

    /// Short upper-case label recorded in the error log.
    pub fn class(&self) -> &'static str {
        match self {
            LlmError::QuotaExceeded(_) => "API_QUOTA",
            LlmError::AuthError(_) | LlmError::ConfigError(_) => "API_AUTH",
            LlmError::ConnectionError(_) => "NETWORK",
            LlmError::ResponseError(_) => "GENERAL",
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            LlmError::from_status(status, "")
        } else if e.is_timeout() || e.is_connect() || e.is_request() {
            LlmError::ConnectionError(e.to_string())
        } else {
            LlmError::ResponseError(e.to_string())
        }
    }
}

/// Turns a question into a single SQL statement.
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate_sql(&self, input: &SqlGenerationInput) -> Result<String, LlmError>;
}

/// Turns a question and its query result into a natural-language answer.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate_answer(&self, input: &AnswerGenerationInput) -> Result<String, LlmError>;
}

pub struct LlmManager {
    sql_generator: Arc<dyn SqlGenerator>,
    answer_generator: Arc<dyn AnswerGenerator>,
    backend: String,
    model: String,
}

impl LlmManager {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let (sql_generator, answer_generator): (Arc<dyn SqlGenerator>, Arc<dyn AnswerGenerator>) =
            match config.backend.as_str() {
                "remote" => {
                    let provider = Arc::new(providers::remote::RemoteLlmProvider::new(config)?);
                    (provider.clone(), provider)
                }
                "ollama" => {
                    let provider = Arc::new(providers::ollama::OllamaProvider::new(config)?);
                    (provider.clone(), provider)
                }
                _ => {
                    return Err(LlmError::ConfigError(format!(
                        "Unsupported LLM backend: {}",
                        config.backend
                    )));
                }
            };

        Ok(Self {
            sql_generator,
            answer_generator,
            backend: config.backend.clone(),
            model: config.model.clone(),
        })
    }

    pub fn sql_generator(&self) -> Arc<dyn SqlGenerator> {
        self.sql_generator.clone()
    }

    pub fn answer_generator(&self) -> Arc<dyn AnswerGenerator> {
        self.answer_generator.clone()
    }

    pub fn describe(&self) -> String {
        format!("{} ({})", self.backend, self.model)
    }
}

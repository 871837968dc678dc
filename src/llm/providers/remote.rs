use crate::config::LlmConfig;
use crate::llm::models::{AnswerGenerationInput, SqlGenerationInput};
use crate::llm::{AnswerGenerator, LlmError, SqlGenerator, prompts};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

/// OpenAI-compatible chat completions endpoint.
pub struct RemoteLlmProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

#[derive(Serialize)]
struct PromptRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct PromptResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

impl RemoteLlmProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_url = config.api_url.clone().ok_or_else(|| {
            LlmError::ConfigError("API URL is required for remote LLM provider".to_string())
        })?;

        let api_key = config.api_key.clone().ok_or_else(|| {
            LlmError::ConfigError("API key is required for remote LLM provider".to_string())
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::ConfigError(e.to_string()))?;

        Ok(Self {
            client,
            api_url,
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        let request = PromptRequest {
            model: &self.model,
            messages: vec![
                Message { role: "system", content: system },
                Message { role: "user", content: prompt },
            ],
            temperature: self.temperature,
            max_tokens: 2000,
        };

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Remote LLM responded with status code: {}", status);
            return Err(LlmError::from_status(status, &body));
        }

        let prompt_response: PromptResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ResponseError(e.to_string()))?;

        let choice = prompt_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::ResponseError("No choices in response".to_string()))?;

        debug!("Remote LLM completion: {}", choice.message.content);
        Ok(choice.message.content)
    }
}

#[async_trait]
impl SqlGenerator for RemoteLlmProvider {
    async fn generate_sql(&self, input: &SqlGenerationInput) -> Result<String, LlmError> {
        let content = self
            .complete(prompts::SQL_SYSTEM_PROMPT, &prompts::sql_prompt(input))
            .await?;
        let sql = prompts::extract_sql(&content);
        if sql.is_empty() {
            return Err(LlmError::ResponseError(
                "Failed to extract valid SQL from response".to_string(),
            ));
        }
        Ok(sql)
    }
}

#[async_trait]
impl AnswerGenerator for RemoteLlmProvider {
    async fn generate_answer(&self, input: &AnswerGenerationInput) -> Result<String, LlmError> {
        let content = self
            .complete(prompts::ANSWER_SYSTEM_PROMPT, &prompts::answer_prompt(input))
            .await?;
        Ok(content.trim().to_string())
    }
}

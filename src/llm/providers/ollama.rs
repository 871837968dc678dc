use crate::config::LlmConfig;
use crate::llm::models::{AnswerGenerationInput, SqlGenerationInput};
use crate::llm::{AnswerGenerator, LlmError, SqlGenerator, prompts};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

pub struct OllamaProvider {
    client: reqwest::Client,
    api_url: String,
    model: String,
    temperature: f32,
}

#[derive(Serialize, Debug)]
struct OllamaRequest<'a> {
    model: &'a str,
    system: &'a str,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize, Debug)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize, Debug)]
struct OllamaResponse {
    response: String,
}

impl OllamaProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_url = config
            .api_url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434/api/generate".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::ConfigError(e.to_string()))?;

        Ok(Self {
            client,
            api_url,
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    async fn complete(&self, system: &str, prompt: String) -> Result<String, LlmError> {
        info!("Sending request to Ollama with model: {}", self.model);
        debug!("API URL: {}", self.api_url);

        let request = OllamaRequest {
            model: &self.model,
            system,
            prompt,
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
            },
        };

        let response = self.client.post(&self.api_url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Ollama API responded with status code: {} - {}", status, body);
            return Err(LlmError::from_status(status, &body));
        }

        let response_text = response
            .text()
            .await
            .map_err(|e| LlmError::ResponseError(format!("Failed to read response body: {}", e)))?;
        debug!("Raw response from Ollama: {}", response_text);

        let parsed = serde_json::from_str::<OllamaResponse>(&response_text).map_err(|e| {
            error!("Failed to parse Ollama response: {} - Response was: {}", e, response_text);
            LlmError::ResponseError(format!("Failed to parse Ollama response: {}", e))
        })?;

        Ok(parsed.response)
    }
}

#[async_trait]
impl SqlGenerator for OllamaProvider {
    async fn generate_sql(&self, input: &SqlGenerationInput) -> Result<String, LlmError> {
        let content = self
            .complete(prompts::SQL_SYSTEM_PROMPT, prompts::sql_prompt(input))
            .await?;
        let sql = prompts::extract_sql(&content);

        if sql.trim().is_empty() {
            return Err(LlmError::ResponseError(
                "Failed to extract valid SQL from response".to_string(),
            ));
        }

        Ok(sql)
    }
}

#[async_trait]
impl AnswerGenerator for OllamaProvider {
    async fn generate_answer(&self, input: &AnswerGenerationInput) -> Result<String, LlmError> {
        let answer = self
            .complete(prompts::ANSWER_SYSTEM_PROMPT, prompts::answer_prompt(input))
            .await?;
        let answer = answer.trim();
        if answer.is_empty() {
            return Err(LlmError::ResponseError("Empty answer from model".to_string()));
        }
        Ok(answer.to_string())
    }
}

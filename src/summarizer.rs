//! External summarization capability
//!
//! Summarization is an injected capability: the engine tolerates its absence
//! (compression falls back to truncation) and treats a failing or hung call
//! as "unavailable". The bundled implementation talks to an OpenAI-compatible
//! chat completion endpoint and enforces its own timeout.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Summarization capability: reduce `text` to roughly `target_tokens`,
/// steered by `instruction`.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        text: &str,
        instruction: &str,
        target_tokens: usize,
    ) -> Result<String, SummarizerError>;
}

/// Summarizer errors
#[derive(Debug, Error)]
pub enum SummarizerError {
    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unknown error")]
    Unknown,
}

/// Configuration for the HTTP summarizer
#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
    pub max_retries: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/v1/chat/completions".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

/// Summarizer backed by an OpenAI-compatible chat completion API
pub struct LlmSummarizer {
    client: Client,
    config: SummarizerConfig,
}

impl LlmSummarizer {
    pub fn new(config: SummarizerConfig) -> Result<Self, SummarizerError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SummarizerError::Initialization(e.to_string()))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(
        &self,
        text: &str,
        instruction: &str,
        target_tokens: usize,
    ) -> Result<String, SummarizerError> {
        if text.is_empty() {
            return Ok(String::new());
        }

        debug!(
            target_tokens,
            chars = text.len(),
            "requesting summarization"
        );

        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: format!(
                        "{instruction} Keep the summary under {target_tokens} tokens."
                    ),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: text.to_string(),
                },
            ],
            max_tokens: Some(target_tokens),
            temperature: Some(0.3),
        };

        let mut last_error = None;
        for attempt in 0..self.config.max_retries {
            if attempt > 0 {
                debug!(attempt, "retrying summarization");
                tokio::time::sleep(Duration::from_millis(100 * (1 << attempt))).await;
            }

            let mut req = self.client.post(&self.config.endpoint).json(&request);
            if let Some(ref api_key) = self.config.api_key {
                req = req.header("Authorization", format!("Bearer {api_key}"));
            }

            match req.send().await {
                Ok(response) => {
                    if !response.status().is_success() {
                        let status = response.status();
                        let body = response.text().await.unwrap_or_default();
                        last_error = Some(SummarizerError::Api(format!("HTTP {status}: {body}")));
                        continue;
                    }
                    match response.json::<ChatCompletionResponse>().await {
                        Ok(resp) => {
                            if let Some(choice) = resp.choices.first() {
                                return Ok(choice.message.content.clone());
                            }
                            last_error =
                                Some(SummarizerError::Api("no choices in response".to_string()));
                        }
                        Err(e) => {
                            last_error = Some(SummarizerError::Api(format!(
                                "failed to parse response: {e}"
                            )));
                        }
                    }
                }
                Err(e) => {
                    last_error = Some(SummarizerError::Network(e.to_string()));
                }
            }
        }

        warn!(
            attempts = self.config.max_retries,
            "summarization failed, treating summarizer as unavailable"
        );
        Err(last_error.unwrap_or(SummarizerError::Unknown))
    }
}

// OpenAI-compatible API types
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

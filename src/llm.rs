//! Language model capability
//!
//! Generation is consumed behind a single-method trait; the shipped
//! implementation speaks the OpenAI-compatible chat-completions shape so it
//! works against OpenAI, OpenRouter, or a local server with the same config.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PlaybookError, Result};

/// Text-in/text-out generation capability
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String>;
}

/// Provider configuration for the chat-completions client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL, e.g. "https://api.openai.com/v1"
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Model name
    #[serde(default = "default_model")]
    pub model: String,
    /// API key; if None, read from `ACE_LLM_API_KEY`
    #[serde(skip)]
    pub api_key: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// OpenAI-compatible chat-completions client
pub struct OpenAiCompatClient {
    config: LlmConfig,
    client: Client,
}

impl OpenAiCompatClient {
    pub fn new(mut config: LlmConfig) -> Result<Self> {
        if config.api_key.is_none() {
            if let Ok(key) = std::env::var("ACE_LLM_API_KEY") {
                if !key.is_empty() {
                    config.api_key = Some(key);
                }
            }
        }
        if config.api_key.is_none() {
            return Err(PlaybookError::TransientGeneration(
                "no API key configured for generation".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PlaybookError::TransientGeneration(e.to_string()))?;

        Ok(Self { config, client })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatClient {
    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let api_key = self
            .config
            .api_key
            .as_ref()
            .ok_or_else(|| PlaybookError::TransientGeneration("API key missing".to_string()))?;

        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: Some(max_tokens),
        };

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| PlaybookError::TransientGeneration(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("Generation API error ({}): {}", status, body);
            return Err(PlaybookError::TransientGeneration(format!(
                "API returned {status}: {body}"
            )));
        }

        let result: ChatResponse = response
            .json()
            .await
            .map_err(|e| PlaybookError::TransientGeneration(format!("bad response body: {e}")))?;

        result
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| PlaybookError::TransientGeneration("empty completion".to_string()))
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

//! Chat-completion client.
//!
//! [`ChatCompletion`] is the seam the answer orchestrator calls through.
//! [`OpenAIChat`] speaks the OpenAI `/chat/completions` protocol, which
//! both OpenAI and GitHub Models serve; only the base URL and the token
//! variable differ.
//!
//! | `llm.provider` | Default URL | Token |
//! |----------------|-------------|-------|
//! | `openai` | `https://api.openai.com/v1` | `OPENAI_API_KEY` |
//! | `github` | `https://models.github.ai/inference` | `GITHUB_TOKEN` |

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::LlmConfig;
use crate::error::{FailureKind, ServiceError};
use crate::http;

const SERVICE: &str = "llm";

/// A chat-completion backend. Makes one attempt per call.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    fn model_name(&self) -> &str;
    /// Complete a two-message conversation and return the assistant text.
    async fn complete(&self, system: &str, user: &str) -> Result<String, ServiceError>;
}

/// Client for OpenAI-compatible chat-completion endpoints.
pub struct OpenAIChat {
    model: String,
    url: String,
    api_key: String,
    temperature: f32,
    client: reqwest::Client,
}

impl OpenAIChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let (default_url, token_var) = match config.provider.as_str() {
            "openai" => ("https://api.openai.com/v1", "OPENAI_API_KEY"),
            "github" => ("https://models.github.ai/inference", "GITHUB_TOKEN"),
            other => bail!("Unknown llm provider: {}", other),
        };
        let api_key = std::env::var(token_var)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", token_var))?;
        let url = config.url.clone().unwrap_or_else(|| default_url.to_string());

        Ok(Self {
            model: config.model.clone(),
            url: url.trim_end_matches('/').to_string(),
            api_key,
            temperature: config.temperature,
            client: http::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl ChatCompletion for OpenAIChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, ServiceError> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });
        let request = self
            .client
            .post(format!("{}/chat/completions", self.url))
            .bearer_auth(&self.api_key)
            .json(&body);

        let json = http::send_json(SERVICE, request).await?;
        parse_completion(&json)
    }
}

/// Extract `choices[0].message.content`.
fn parse_completion(json: &serde_json::Value) -> Result<String, ServiceError> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|c| c.trim().to_string())
        .ok_or_else(|| {
            ServiceError::new(
                SERVICE,
                FailureKind::InvalidResponse,
                "response has no choices[0].message.content",
            )
        })
}

pub fn create_chat_client(config: &LlmConfig) -> Result<Arc<dyn ChatCompletion>> {
    Ok(Arc::new(OpenAIChat::new(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_completion() {
        let json = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "  Alice said Friday.\n" } }]
        });
        assert_eq!(parse_completion(&json).unwrap(), "Alice said Friday.");
    }

    #[test]
    fn test_parse_completion_without_choices() {
        let err = parse_completion(&serde_json::json!({ "choices": [] })).unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidResponse);
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let config = LlmConfig {
            provider: "carrier-pigeon".to_string(),
            ..Default::default()
        };
        let err = OpenAIChat::new(&config).err().unwrap();
        assert!(err.to_string().contains("carrier-pigeon"));
    }
}

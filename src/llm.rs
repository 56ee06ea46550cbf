//! Reply generation through an OpenAI-compatible chat completion API.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::Config;
use crate::error::GenerationError;
use crate::prompting::{render_system_prompt, SystemPromptContext};

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, GenerationError>;
}

pub struct OpenAiClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(config.openai_timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.openai_base_url),
            api_key: config.openai_api_key.clone(),
            model: config.openai_model.clone(),
        })
    }
}

#[async_trait]
impl CompletionBackend for OpenAiClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String, GenerationError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": user }
                ]
            }))
            .send()
            .await
            .map_err(|err| GenerationError::Request(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status { status, body });
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| GenerationError::Malformed(err.to_string()))?;
        payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .map(|text| text.trim().to_string())
            .ok_or_else(|| GenerationError::Malformed("missing choices[0].message.content".to_string()))
    }
}

/// What the generator produced: a model reply, or the fixed fallback when
/// the completion call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Generated(String),
    Fallback { text: String, reason: String },
}

impl Reply {
    pub fn text(&self) -> &str {
        match self {
            Reply::Generated(text) => text,
            Reply::Fallback { text, .. } => text,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Reply::Fallback { .. })
    }
}

pub struct ReplyGenerator {
    backend: Arc<dyn CompletionBackend>,
    system_prompt: String,
    fallback: String,
}

impl ReplyGenerator {
    pub fn new(backend: Arc<dyn CompletionBackend>, config: &Config) -> Self {
        let system_prompt = render_system_prompt(&SystemPromptContext {
            bot_name: &config.bot_name,
            business_name: &config.business_name,
        });
        Self {
            backend,
            system_prompt,
            fallback: config.fallback_reply.clone(),
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub async fn generate(&self, contact: &str, user_text: &str) -> Reply {
        tracing::debug!(contact, chars = user_text.chars().count(), "requesting completion");
        match self.backend.complete(&self.system_prompt, user_text).await {
            Ok(text) => {
                tracing::info!(chars = text.chars().count(), "reply generated");
                Reply::Generated(text)
            }
            Err(err) => {
                tracing::warn!(contact, error = %err, "completion failed, using fallback reply");
                tracing::warn!(
                    target: "dead_letter",
                    kind = "generation",
                    contact = %contact,
                    user_text = %user_text,
                    error = %err,
                    "generation failed"
                );
                Reply::Fallback {
                    text: self.fallback.clone(),
                    reason: err.to_string(),
                }
            }
        }
    }
}

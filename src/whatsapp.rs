//! Outbound text messages through the WhatsApp Cloud API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::config::Config;

/// Result of one send. Advisory: callers log it but never branch on it.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Delivered(Value),
    Rejected { status: u16, body: Value },
    Unreachable(String),
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered(_))
    }

    fn is_transient(&self) -> bool {
        match self {
            SendOutcome::Delivered(_) => false,
            SendOutcome::Unreachable(_) => true,
            SendOutcome::Rejected { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || *status >= 500
            }
        }
    }
}

#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send_text(&self, to: &str, text: &str) -> SendOutcome;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

pub struct WhatsAppClient {
    http: reqwest::Client,
    endpoint: String,
    access_token: String,
    retry: RetryPolicy,
}

impl WhatsAppClient {
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(config.send_timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: format!(
                "{}/{}/{}/messages",
                config.graph_api_base_url, config.graph_api_version, config.phone_number_id
            ),
            access_token: config.access_token.clone(),
            retry: RetryPolicy {
                max_attempts: config.send_max_attempts,
                base_delay: config.send_backoff,
            },
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send_once(&self, payload: &Value) -> SendOutcome {
        let response = match self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.access_token)
            .json(payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return SendOutcome::Unreachable(err.to_string()),
        };

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        let body =
            serde_json::from_str::<Value>(&raw_body).unwrap_or_else(|_| json!({ "raw": raw_body }));

        if status == StatusCode::OK {
            SendOutcome::Delivered(body)
        } else {
            SendOutcome::Rejected {
                status: status.as_u16(),
                body,
            }
        }
    }
}

#[async_trait]
impl MessageTransport for WhatsAppClient {
    async fn send_text(&self, to: &str, text: &str) -> SendOutcome {
        let payload = json!({
            "messaging_product": "whatsapp",
            "to": to,
            "text": { "body": text },
        });
        tracing::info!(to, chars = text.chars().count(), "sending whatsapp message");

        let mut attempt = 1;
        loop {
            let outcome = self.send_once(&payload).await;
            match &outcome {
                SendOutcome::Delivered(_) => {
                    tracing::debug!(to, attempt, "whatsapp message accepted");
                    return outcome;
                }
                SendOutcome::Rejected { status, body } => {
                    tracing::warn!(to, attempt, status, %body, "whatsapp send rejected");
                }
                SendOutcome::Unreachable(reason) => {
                    tracing::warn!(to, attempt, reason = %reason, "whatsapp api unreachable");
                }
            }
            if !outcome.is_transient() || attempt >= self.retry.max_attempts {
                return outcome;
            }
            let delay = self.retry.delay_for(attempt);
            tracing::debug!(to, attempt, delay_ms = delay.as_millis() as u64, "retrying whatsapp send");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

//! OpenAI-compatible LLM gateway client.
//!
//! One operation is consumed in this crate: chat completion, behind the
//! retry engine's advisory layer. Prompts are truncated to a configured
//! cap and every request carries a strict timeout. Connection refused,
//! timeout, non-200, and empty choice arrays all surface as
//! `GatewayUnavailable` so callers can degrade gracefully.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GatewayConfig;
use crate::error::{KilnError, Result};

#[derive(Debug, Clone)]
pub struct Gateway {
    base_url: String,
    model: String,
    max_prompt_chars: usize,
    client: reqwest::blocking::Client,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

impl Gateway {
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|err| KilnError::GatewayUnavailable(format!("build client: {err}")))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_prompt_chars: config.max_prompt_chars,
            client,
        })
    }

    /// Whether the gateway answers a model-list probe.
    pub fn is_available(&self) -> bool {
        self.client
            .get(format!("{}/models", self.base_url))
            .send()
            .map(|resp| resp.status().is_success())
            .unwrap_or(false)
    }

    /// Bounded chat completion: the prompt is truncated to the configured
    /// character cap before sending.
    pub fn chat(&self, prompt: &str) -> Result<String> {
        let prompt: String = prompt.chars().take(self.max_prompt_chars).collect();
        debug!(chars = prompt.len(), model = %self.model, "chat request");

        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &prompt,
            }],
            temperature: 0.0,
        };
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request)
            .send()
            .map_err(|err| KilnError::GatewayUnavailable(format!("gateway unreachable: {err}")))?;
        if !response.status().is_success() {
            return Err(KilnError::GatewayUnavailable(format!(
                "gateway returned {}",
                response.status()
            )));
        }
        let parsed: ChatResponse = response
            .json()
            .map_err(|err| KilnError::GatewayUnavailable(format!("malformed response: {err}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| KilnError::GatewayUnavailable("empty response".to_string()))
    }
}

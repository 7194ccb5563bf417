//! Hosted model backends. Each provider shapes its own wire request; the
//! gateway only consumes the extracted response text.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::ChatProvider;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

const SYSTEM_ROLE: &str = "You translate browser-automation instructions into JSON action plans. \
     Respond with only a JSON array of action objects, no prose.";

pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    model: String,
    temperature: f64,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, temperature: f64) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            temperature,
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn ready(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn invoke(&self, prompt: &str) -> Result<String> {
        let response = self
            .client
            .post(OPENAI_CHAT_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": SYSTEM_ROLE},
                    {"role": "user", "content": prompt},
                ],
                "temperature": self.temperature,
            }))
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("unknown API error");
            return Err(anyhow!("OpenAI API error ({status}): {message}"));
        }

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("no content in OpenAI response: {body}"))
    }
}

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    model: String,
    temperature: f64,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, temperature: f64) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            temperature,
        }
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn ready(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn invoke(&self, prompt: &str) -> Result<String> {
        let response = self
            .client
            .post(ANTHROPIC_MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&json!({
                "model": self.model,
                "max_tokens": 2048,
                "temperature": self.temperature,
                "system": SYSTEM_ROLE,
                "messages": [
                    {"role": "user", "content": prompt},
                ],
            }))
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("unknown API error");
            return Err(anyhow!("Anthropic API error ({status}): {message}"));
        }

        body["content"][0]["text"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("no text in Anthropic response: {body}"))
    }
}

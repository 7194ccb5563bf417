//! LLM gateway: an ordered list of provider candidates tried strictly in
//! order, with per-call timeout and cheap token estimation.

pub mod prompt;
mod providers;

pub use providers::{AnthropicProvider, OpenAiProvider};

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Provider/model ranking and sampling settings, overridable from the YAML
/// config. Models are tried most-capable first within each provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_openai_models")]
    pub openai_models: Vec<String>,

    #[serde(default = "default_anthropic_models")]
    pub anthropic_models: Vec<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_openai_models() -> Vec<String> {
    vec!["gpt-4.1".to_string(), "gpt-4o-mini".to_string()]
}

fn default_anthropic_models() -> Vec<String> {
    vec![
        "claude-sonnet-4-5".to_string(),
        "claude-haiku-4-5".to_string(),
    ]
}

fn default_temperature() -> f64 {
    0.1
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            openai_models: default_openai_models(),
            anthropic_models: default_anthropic_models(),
            temperature: default_temperature(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no model provider is configured")]
    NoProviders,

    #[error("all {attempts} model candidates failed, last error: {last}")]
    AllFailed { attempts: usize, last: String },
}

/// One configured model backend. Implementations are free to shape the wire
/// request however the vendor requires; the gateway only needs text back.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Model identifier reported in transcripts.
    fn model_name(&self) -> &str;

    /// Candidates without credentials are skipped without counting as a
    /// failure.
    fn ready(&self) -> bool {
        true
    }

    async fn invoke(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Gateway reply: raw text plus call metadata.
#[derive(Debug, Clone)]
pub struct LlmReply {
    pub text: String,
    pub model: String,
    pub duration: Duration,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Length-based token estimate; providers report no exact counts here.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64 + 3) / 4
}

pub struct LlmGateway {
    candidates: Vec<Arc<dyn ChatProvider>>,
    call_timeout: Duration,
}

impl LlmGateway {
    pub fn new(candidates: Vec<Arc<dyn ChatProvider>>) -> Self {
        Self {
            candidates,
            call_timeout: Duration::from_secs(90),
        }
    }

    /// Build the ranked candidate list from whichever provider credentials
    /// are present in the environment, with the default model ranking.
    pub fn from_env() -> Self {
        Self::from_env_with(&GatewayConfig::default())
    }

    /// As [`from_env`](Self::from_env), with the model ranking and sampling
    /// settings taken from `config`.
    pub fn from_env_with(config: &GatewayConfig) -> Self {
        let mut candidates: Vec<Arc<dyn ChatProvider>> = Vec::new();
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            for model in &config.openai_models {
                candidates.push(Arc::new(OpenAiProvider::new(
                    key.clone(),
                    model.clone(),
                    config.temperature,
                )));
            }
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            for model in &config.anthropic_models {
                candidates.push(Arc::new(AnthropicProvider::new(
                    key.clone(),
                    model.clone(),
                    config.temperature,
                )));
            }
        }
        Self::new(candidates)
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Candidate model identifiers, in try order.
    pub fn model_names(&self) -> Vec<&str> {
        self.candidates.iter().map(|c| c.model_name()).collect()
    }

    /// Try each candidate strictly in order; earlier failures are logged and
    /// absorbed, and only total exhaustion surfaces an error.
    pub async fn invoke_with_fallback(&self, prompt: &str) -> Result<LlmReply, GatewayError> {
        if self.candidates.is_empty() {
            return Err(GatewayError::NoProviders);
        }

        let mut attempts = 0usize;
        let mut last_error = String::new();

        for candidate in &self.candidates {
            if !candidate.ready() {
                debug!(model = candidate.model_name(), "skipping candidate without credentials");
                continue;
            }
            attempts += 1;
            let start = Instant::now();
            let outcome =
                tokio::time::timeout(self.call_timeout, candidate.invoke(prompt)).await;
            match outcome {
                Ok(Ok(text)) => {
                    let duration = start.elapsed();
                    debug!(
                        model = candidate.model_name(),
                        ms = duration.as_millis() as u64,
                        "model call succeeded"
                    );
                    return Ok(LlmReply {
                        input_tokens: estimate_tokens(prompt),
                        output_tokens: estimate_tokens(&text),
                        model: candidate.model_name().to_string(),
                        duration,
                        text,
                    });
                }
                Ok(Err(e)) => {
                    warn!(model = candidate.model_name(), "model call failed: {e}");
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!(
                        model = candidate.model_name(),
                        "model call timed out after {:?}", self.call_timeout
                    );
                    last_error = format!("timed out after {:?}", self.call_timeout);
                }
            }
        }

        Err(GatewayError::AllFailed {
            attempts,
            last: if last_error.is_empty() {
                "no candidate had credentials".to_string()
            } else {
                last_error
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProvider {
        name: &'static str,
        reply: Result<&'static str, &'static str>,
        ready: bool,
    }

    #[async_trait]
    impl ChatProvider for FixedProvider {
        fn model_name(&self) -> &str {
            self.name
        }

        fn ready(&self) -> bool {
            self.ready
        }

        async fn invoke(&self, _prompt: &str) -> anyhow::Result<String> {
            match self.reply {
                Ok(text) => Ok(text.to_string()),
                Err(e) => Err(anyhow::anyhow!(e)),
            }
        }
    }

    fn provider(
        name: &'static str,
        reply: Result<&'static str, &'static str>,
    ) -> Arc<dyn ChatProvider> {
        Arc::new(FixedProvider {
            name,
            reply,
            ready: true,
        })
    }

    #[tokio::test]
    async fn falls_through_to_third_candidate() {
        let gateway = LlmGateway::new(vec![
            provider("m1", Err("boom")),
            provider("m2", Err("bust")),
            provider("m3", Ok("[]")),
        ]);
        let reply = gateway.invoke_with_fallback("hi").await.unwrap();
        assert_eq!(reply.model, "m3");
        assert_eq!(reply.text, "[]");
    }

    #[tokio::test]
    async fn unready_candidates_do_not_count_as_failures() {
        let gateway = LlmGateway::new(vec![
            Arc::new(FixedProvider {
                name: "m1",
                reply: Ok("unused"),
                ready: false,
            }),
            provider("m2", Ok("[]")),
        ]);
        let reply = gateway.invoke_with_fallback("hi").await.unwrap();
        assert_eq!(reply.model, "m2");
    }

    #[tokio::test]
    async fn exhaustion_surfaces_last_error() {
        let gateway = LlmGateway::new(vec![
            provider("m1", Err("first")),
            provider("m2", Err("second")),
        ]);
        let err = gateway.invoke_with_fallback("hi").await.unwrap_err();
        match err {
            GatewayError::AllFailed { attempts, last } => {
                assert_eq!(attempts, 2);
                assert_eq!(last, "second");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn default_ranking_tries_capable_models_first() {
        let config = GatewayConfig::default();
        assert_eq!(config.openai_models, vec!["gpt-4.1", "gpt-4o-mini"]);
        assert_eq!(
            config.anthropic_models,
            vec!["claude-sonnet-4-5", "claude-haiku-4-5"]
        );
        assert_eq!(config.temperature, 0.1);
    }

    #[test]
    fn token_estimate_is_length_based() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}

//! Natural-language browser command execution.
//!
//! One instruction ("type 'alice' into Username, click Login, then wait 2
//! seconds") is normalized, planned into a closed set of browser actions with
//! an LLM, and executed against a live page via chromiumoxide. The
//! [`engine::Engine`] round loop owns the whole run; everything else is a
//! stage it composes.

pub mod driver;
pub mod engine;
pub mod instruction;
pub mod llm;
pub mod locator;
pub mod page;
pub mod pipeline;
pub mod report;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

pub use driver::cdp::{launch_browser, BrowserHandle, CdpDriver};
pub use engine::{Engine, EngineConfig, EngineError};
pub use llm::{GatewayConfig, LlmGateway};
pub use pipeline::{ActionPipeline, ExecutableAction, PipelineBuilder};
pub use report::{RunReport, StepStatus};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub browser: BrowserSection,

    #[serde(default)]
    pub llm: llm::GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Failed visibility assertions become skipped steps instead of errors.
    #[serde(default)]
    pub soft_assertions: bool,

    /// Keep cookies when a clearCache action runs.
    #[serde(default)]
    pub preserve_cookies: bool,

    /// Outline each element before acting on it.
    #[serde(default)]
    pub highlight: bool,

    /// CSS selector scoping page summarization.
    #[serde(default)]
    pub container: Option<String>,
}

/// Browser launch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserSection {
    #[serde(default = "default_headless")]
    pub headless: bool,

    #[serde(default)]
    pub window: WindowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_window_width")]
    pub width: u32,

    #[serde(default = "default_window_height")]
    pub height: u32,
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    900
}
fn default_timeout_ms() -> u64 {
    5_000
}

fn default_headless() -> bool {
    true
}

fn default_window_width() -> u32 {
    1280
}

fn default_window_height() -> u32 {
    720
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            default_timeout_ms: default_timeout_ms(),
            soft_assertions: false,
            preserve_cookies: false,
            highlight: false,
            container: None,
        }
    }
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            headless: default_headless(),
            window: WindowConfig::default(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: default_window_width(),
            height: default_window_height(),
        }
    }
}

impl Config {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_retries: self.engine.max_retries,
            retry_backoff_ms: self.engine.retry_backoff_ms,
            default_timeout_ms: self.engine.default_timeout_ms,
            soft_assertions: self.engine.soft_assertions,
            preserve_cookies: self.engine.preserve_cookies,
            highlight: self.engine.highlight,
            container: self.engine.container.clone(),
        }
    }
}

/// Load config from config.yaml in package root
pub fn load_yaml_config() -> anyhow::Result<Config> {
    let config_path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config.yaml");

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    } else {
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_sections_default_independently() {
        let config: Config = serde_yaml::from_str("engine:\n  soft_assertions: true\n").unwrap();
        assert!(config.engine.soft_assertions);
        assert_eq!(config.engine.max_retries, 3);
        assert!(config.browser.headless);
        assert_eq!(config.browser.window.width, 1280);
    }

    #[test]
    fn llm_section_overrides_only_what_it_names() {
        let config: Config = serde_yaml::from_str(
            "llm:\n  anthropic_models:\n    - claude-sonnet-4-5\n  temperature: 0.0\n",
        )
        .unwrap();
        assert_eq!(config.llm.anthropic_models, vec!["claude-sonnet-4-5"]);
        assert_eq!(config.llm.temperature, 0.0);
        // Unnamed keys keep their ranking defaults.
        assert_eq!(config.llm.openai_models, vec!["gpt-4.1", "gpt-4o-mini"]);
    }

    #[test]
    fn engine_config_mirrors_the_engine_section() {
        let mut config = Config::default();
        config.engine.highlight = true;
        config.engine.container = Some("#app".into());
        let engine = config.engine_config();
        assert!(engine.highlight);
        assert_eq!(engine.container.as_deref(), Some("#app"));
        assert_eq!(engine.retry_backoff_ms, 900);
    }
}

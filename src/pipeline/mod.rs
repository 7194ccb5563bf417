//! Action pipeline: untrusted model text in, executable actions out.
//!
//! Every stage is a hard gate. The normalizer/validator/mapper chains are open
//! extension points registered on [`PipelineBuilder`] at engine build time;
//! execution order is insertion order and the defaults always run first.

mod types;

pub use types::{ExecutableAction, RawAction, SelectorKind, Target};

use thiserror::Error;
use tracing::debug;

use crate::instruction::TypedLiteral;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("model response contains no JSON array")]
    NoJsonArray,

    #[error("model response is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("action {index}: {reason}")]
    Schema { index: usize, reason: String },

    #[error("action '{action}' requires a selector")]
    MissingSelector { action: String },

    #[error("type action has no text to type")]
    MissingText,

    #[error("no executable actions left after filtering")]
    Empty,
}

/// Rewrites or vetoes a raw action before validation. Returning `None` drops
/// the action.
pub trait ActionNormalizer: Send + Sync {
    fn normalize(&self, action: RawAction) -> Option<RawAction>;
}

/// Structural validation; may also patch the action in place with safe
/// defaults.
pub trait ActionValidator: Send + Sync {
    fn validate(&self, action: &mut RawAction) -> Result<(), PipelineError>;
}

/// Maps a raw action to its executable form. First mapper returning `Some`
/// wins; an action no mapper accepts is dropped.
pub trait ActionMapper: Send + Sync {
    fn map(&self, action: &RawAction) -> Option<ExecutableAction>;
}

struct DefaultNormalizer;

impl ActionNormalizer for DefaultNormalizer {
    fn normalize(&self, mut action: RawAction) -> Option<RawAction> {
        action.action = match action.action.as_str() {
            "press" | "tap" | "submit" => "click".to_string(),
            "refresh" => "reload".to_string(),
            other => other.to_string(),
        };

        if action.selector_type.is_none() {
            if RawAction::is_selectorless_kind(&action.action) {
                action.selector_type = Some(SelectorKind::None);
            } else if let Some(selector) = &action.selector {
                action.selector_type = Some(SelectorKind::infer(selector));
            } else {
                action.selector_type = Some(SelectorKind::None);
            }
        }

        Some(action)
    }
}

struct DefaultValidator;

impl ActionValidator for DefaultValidator {
    fn validate(&self, action: &mut RawAction) -> Result<(), PipelineError> {
        if !RawAction::is_selectorless_kind(&action.action) {
            let missing = action
                .selector
                .as_deref()
                .map(|s| s.trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(PipelineError::MissingSelector {
                    action: action.action.clone(),
                });
            }
        }

        if action.action == "type" {
            let blank = action
                .text
                .as_deref()
                .map(|t| t.trim().is_empty())
                .unwrap_or(true);
            if blank {
                return Err(PipelineError::MissingText);
            }
        }

        // A zero or negative wait would never progress; floor it at one second.
        if action.action == "wait" {
            match action.duration {
                Some(d) if d < 1 => action.duration = Some(1),
                None => action.duration = Some(1),
                _ => {}
            }
        }

        Ok(())
    }
}

struct DefaultMapper;

impl DefaultMapper {
    fn target_of(action: &RawAction) -> Option<Target> {
        let selector = action.selector.as_deref()?.trim();
        let kind = action
            .selector_type
            .unwrap_or_else(|| SelectorKind::infer(selector));
        Some(Target::new(selector, kind))
    }
}

impl ActionMapper for DefaultMapper {
    fn map(&self, action: &RawAction) -> Option<ExecutableAction> {
        let mapped = match action.action.as_str() {
            "click" => ExecutableAction::Click {
                target: Self::target_of(action)?,
            },
            "toggle" => ExecutableAction::Toggle {
                target: Self::target_of(action)?,
            },
            "type" => ExecutableAction::Type {
                target: Self::target_of(action)?,
                text: action.text.clone()?,
            },
            "wait" => ExecutableAction::Wait {
                seconds: action.duration.unwrap_or(1).max(1) as u64,
            },
            "reload" => ExecutableAction::Reload,
            "clearCache" => ExecutableAction::ClearCache,
            "waitForVisible" => ExecutableAction::WaitForVisible {
                target: Self::target_of(action)?,
                timeout_ms: action.timeout,
            },
            "waitForHidden" => ExecutableAction::WaitForHidden {
                target: Self::target_of(action)?,
                timeout_ms: action.timeout,
            },
            "assertVisible" => ExecutableAction::AssertVisible {
                target: Self::target_of(action)?,
                timeout_ms: action.timeout,
            },
            "assertNotVisible" => ExecutableAction::AssertNotVisible {
                target: Self::target_of(action)?,
            },
            "waitForNavigation" => ExecutableAction::WaitForNavigation {
                timeout_ms: action.timeout,
            },
            "waitForURL" => ExecutableAction::WaitForUrl {
                url: action.url.clone(),
                pattern: action.pattern.clone(),
                timeout_ms: action.timeout,
            },
            _ => return None,
        };
        Some(mapped)
    }
}

/// Ordered registry of pipeline stages.
pub struct ActionPipeline {
    normalizers: Vec<Box<dyn ActionNormalizer>>,
    validators: Vec<Box<dyn ActionValidator>>,
    mappers: Vec<Box<dyn ActionMapper>>,
}

/// Builds an [`ActionPipeline`] with the default stages registered first.
pub struct PipelineBuilder {
    normalizers: Vec<Box<dyn ActionNormalizer>>,
    validators: Vec<Box<dyn ActionValidator>>,
    mappers: Vec<Box<dyn ActionMapper>>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            normalizers: vec![Box::new(DefaultNormalizer)],
            validators: vec![Box::new(DefaultValidator)],
            mappers: vec![Box::new(DefaultMapper)],
        }
    }

    pub fn with_normalizer(mut self, normalizer: Box<dyn ActionNormalizer>) -> Self {
        self.normalizers.push(normalizer);
        self
    }

    pub fn with_validator(mut self, validator: Box<dyn ActionValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn with_mapper(mut self, mapper: Box<dyn ActionMapper>) -> Self {
        self.mappers.push(mapper);
        self
    }

    pub fn build(self) -> ActionPipeline {
        ActionPipeline {
            normalizers: self.normalizers,
            validators: self.validators,
            mappers: self.mappers,
        }
    }
}

impl ActionPipeline {
    /// Parse raw model text into executable actions.
    ///
    /// `literals` are field/value pairs pre-extracted from the instruction;
    /// `already_typed` names fields the engine has already filled so the model
    /// cannot type into them a second time.
    pub fn parse_and_plan(
        &self,
        raw_response: &str,
        literals: &[TypedLiteral],
        already_typed: &[String],
    ) -> Result<Vec<ExecutableAction>, PipelineError> {
        let body = extract_json_array(raw_response).ok_or(PipelineError::NoJsonArray)?;

        let raw_actions: Vec<RawAction> =
            serde_json::from_str(&body).map_err(|e| PipelineError::InvalidJson(e.to_string()))?;

        let mut actions = Vec::with_capacity(raw_actions.len());
        for (index, mut raw) in raw_actions.into_iter().enumerate() {
            validate_schema(index, &mut raw)?;
            actions.push(raw);
        }

        // Literal handling: the instruction's own quoted text always wins over
        // whatever the model paraphrased.
        for action in &mut actions {
            if action.action == "type" && action.text.is_none() {
                if let Some(field) = action.selector.as_deref() {
                    if let Some(lit) = literals
                        .iter()
                        .find(|l| l.field.eq_ignore_ascii_case(field.trim()))
                    {
                        action.text = Some(lit.value.clone());
                    }
                }
            }
        }
        actions.retain(|a| {
            if a.action != "type" {
                return true;
            }
            let field = a.selector.as_deref().unwrap_or("").trim();
            let duplicate = already_typed.iter().any(|f| f.eq_ignore_ascii_case(field));
            if duplicate {
                debug!(field, "dropping model type action for already-typed field");
            }
            !duplicate
        });
        actions.retain(|a| a.action != "type" || a.text.is_some());

        let mut executable = Vec::with_capacity(actions.len());
        'next_action: for mut raw in actions {
            for normalizer in &self.normalizers {
                match normalizer.normalize(raw) {
                    Some(next) => raw = next,
                    None => continue 'next_action,
                }
            }
            for validator in &self.validators {
                validator.validate(&mut raw)?;
            }
            for mapper in &self.mappers {
                if let Some(action) = mapper.map(&raw) {
                    executable.push(action);
                    continue 'next_action;
                }
            }
            debug!(action = %raw.action, "no mapper accepted action, dropping");
        }

        if executable.is_empty() {
            return Err(PipelineError::Empty);
        }
        Ok(executable)
    }
}

/// Pull the first top-level JSON array out of conversational wrapping.
fn extract_json_array(raw: &str) -> Option<String> {
    let cleaned = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let start = cleaned.find('[')?;
    let end = cleaned.rfind(']')?;
    if end < start {
        return None;
    }
    Some(cleaned[start..=end].to_string())
}

/// Per-field structural checks plus selector-kind inference.
fn validate_schema(index: usize, raw: &mut RawAction) -> Result<(), PipelineError> {
    if raw.action.trim().is_empty() {
        return Err(PipelineError::Schema {
            index,
            reason: "empty action name".into(),
        });
    }

    if let Some(selector) = &raw.selector {
        if selector.trim().is_empty() {
            return Err(PipelineError::Schema {
                index,
                reason: "selector must be a non-empty string".into(),
            });
        }
    }

    if let Some(timeout) = raw.timeout {
        if timeout == 0 {
            return Err(PipelineError::Schema {
                index,
                reason: "timeout must be a positive integer".into(),
            });
        }
    }

    if let Some(url) = &raw.url {
        url::Url::parse(url).map_err(|e| PipelineError::Schema {
            index,
            reason: format!("malformed url '{url}': {e}"),
        })?;
    }

    if raw.selector_type.is_none() {
        if let Some(selector) = &raw.selector {
            raw.selector_type = Some(SelectorKind::infer(selector));
        }
    }

    Ok(())
}

//! Execution engine: the round loop that turns one natural-language
//! instruction into executed browser actions.
//!
//! Each round handles exactly one of: an inline shortcut command, pending
//! quoted literals, or one model planning call whose actions run in order.
//! Executed work is consumed out of the instruction text, so the loop
//! terminates when the text is empty. Failures abandon the round and retry
//! from the remaining text, up to a fixed attempt budget.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::driver::{DomElement, Driver, DriverError};
use crate::instruction::{
    consume_processed, match_inline_command, normalize_assertion_phrases,
    pre_extract_type_actions, strip_literal_phrase, strip_vague, InlineCommand, TypedLiteral,
};
use crate::llm::{prompt::build_prompt, GatewayError, LlmGateway};
use crate::locator::{self, Resolution};
use crate::page::{get_optimized_html, NavigationState, PageCache};
use crate::pipeline::{
    ActionPipeline, ExecutableAction, PipelineBuilder, PipelineError, SelectorKind, Target,
};
use crate::report::{RunReport, StepStatus};

/// Extra visibility wait granted before clicking, so late-rendering targets
/// are not clicked mid-layout.
const CLICK_PRE_WAIT: Duration = Duration::from_secs(5);

/// Pause between the two attempts of single-retry operations.
const RETRY_PAUSE: Duration = Duration::from_millis(500);

/// Timeout floor applied to selectors that name notoriously slow widgets.
const SLOW_SELECTOR_FLOOR_MS: u64 = 10_000;

/// Default budget for navigation-style waits.
const NAVIGATION_TIMEOUT_MS: u64 = 10_000;

/// Post-reload settle budget.
const RELOAD_SETTLE: Duration = Duration::from_secs(10);

/// Brief settle after storage clears and slow-widget assertions.
const SHORT_SETTLE: Duration = Duration::from_millis(300);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("planning failed: {0}")]
    Planning(#[from] PipelineError),

    #[error("model gateway failed: {0}")]
    Gateway(#[from] GatewayError),

    #[error("could not locate element for {action} '{selector}'")]
    Resolution { action: String, selector: String },

    #[error("{action} failed: {reason}")]
    Execution { action: String, reason: String },

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("instruction abandoned after {attempts} failed rounds, last error: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Consecutive failed rounds tolerated before the run is abandoned.
    pub max_retries: u32,
    /// Pause between failed rounds.
    pub retry_backoff_ms: u64,
    /// Wait budget used when an action carries no timeout of its own.
    pub default_timeout_ms: u64,
    /// Downgrade failed visibility assertions to skipped steps.
    pub soft_assertions: bool,
    /// Keep cookies across `clearCache`.
    pub preserve_cookies: bool,
    /// Flash a visual outline on each element before acting on it.
    pub highlight: bool,
    /// CSS selector scoping page summarization, when set.
    pub container: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 900,
            default_timeout_ms: 5_000,
            soft_assertions: false,
            preserve_cookies: false,
            highlight: false,
            container: None,
        }
    }
}

/// Mutable per-run state. Owned by the engine, never shared.
#[derive(Default)]
struct RunContext {
    cache: PageCache,
    nav: NavigationState,
    literals: Vec<TypedLiteral>,
    already_typed: Vec<String>,
}

/// What a successfully dispatched action tells the round loop to do next.
enum StepOutcome {
    Done,
    /// Click caused a navigation; the rest of this round's plan is stale.
    DoneNavigated,
    Skipped(String),
}

pub struct Engine {
    driver: Box<dyn Driver>,
    gateway: LlmGateway,
    pipeline: ActionPipeline,
    config: EngineConfig,
    ctx: RunContext,
}

impl Engine {
    pub fn new(driver: Box<dyn Driver>, gateway: LlmGateway, config: EngineConfig) -> Self {
        Self {
            driver,
            gateway,
            pipeline: PipelineBuilder::new().build(),
            config,
            ctx: RunContext::default(),
        }
    }

    /// Replace the default action pipeline, for callers that register extra
    /// normalizers, validators, or mappers.
    pub fn with_pipeline(mut self, pipeline: ActionPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Execute one instruction to completion.
    pub async fn run(&mut self, instruction: &str) -> Result<RunReport, EngineError> {
        self.ctx = RunContext::default();
        let mut report = RunReport::default();
        let mut remaining = normalize_assertion_phrases(instruction);
        let mut retry = 0u32;

        loop {
            remaining = strip_vague(&remaining);
            if remaining.trim().is_empty() {
                break;
            }
            report.rounds += 1;
            let before = remaining.clone();
            match self.round(&mut remaining, &mut report).await {
                Ok(()) => {
                    retry = 0;
                    if remaining == before {
                        warn!("round made no progress on the instruction, stopping");
                        break;
                    }
                }
                Err(e) => {
                    let last_error = e.to_string();
                    retry += 1;
                    warn!(retry, "round failed: {last_error}");
                    if retry >= self.config.max_retries {
                        return Err(EngineError::RetriesExhausted {
                            attempts: retry,
                            last: last_error,
                        });
                    }
                    tokio::time::sleep(Duration::from_millis(self.config.retry_backoff_ms)).await;
                }
            }
        }

        info!(
            rounds = report.rounds,
            steps = report.steps.entries().len(),
            "instruction complete"
        );
        Ok(report)
    }

    async fn round(
        &mut self,
        remaining: &mut String,
        report: &mut RunReport,
    ) -> Result<(), EngineError> {
        // Shortcut commands at the head of the instruction never need a model.
        if let Some((command, rest)) = match_inline_command(remaining) {
            self.execute_inline(&command, report).await?;
            *remaining = rest;
            return Ok(());
        }

        // Quoted literals are typed verbatim before any model call so the
        // model can never paraphrase user-supplied text.
        self.execute_literals(remaining, report).await?;
        let stripped = strip_vague(remaining);
        if stripped.trim().is_empty() {
            *remaining = stripped;
            return Ok(());
        }

        let url = self.driver.current_url().await?;
        if self.ctx.nav.observe(&url) {
            debug!(%url, "navigation detected, invalidating page cache");
            self.ctx.cache.invalidate();
        }

        let excerpt = get_optimized_html(
            self.driver.as_ref(),
            self.config.container.as_deref(),
            &mut self.ctx.cache,
            true,
        )
        .await?;

        let prompt = build_prompt(remaining, &excerpt);
        let reply = self.gateway.invoke_with_fallback(&prompt).await?;
        self.ctx.cache.last_command = Some(prompt.clone());
        self.ctx.cache.last_response = Some(reply.text.clone());
        report.record_transcript(
            &reply.model,
            &prompt,
            &reply.text,
            reply.duration.as_millis() as u64,
            reply.input_tokens,
            reply.output_tokens,
        );

        let plan =
            self.pipeline
                .parse_and_plan(&reply.text, &self.ctx.literals, &self.ctx.already_typed)?;
        debug!(actions = plan.len(), "plan parsed");

        for action in plan {
            match self.dispatch(&action).await {
                Ok(outcome) => {
                    let (status, note) = match &outcome {
                        StepOutcome::Done | StepOutcome::DoneNavigated => (StepStatus::Passed, None),
                        StepOutcome::Skipped(reason) => {
                            (StepStatus::Skipped, Some(reason.clone()))
                        }
                    };
                    self.log_step(report, &action, status, note);
                    *remaining = consume_processed(remaining, &action);
                    if matches!(outcome, StepOutcome::DoneNavigated) {
                        debug!("page navigated, abandoning the rest of this plan");
                        break;
                    }
                }
                Err(e) => {
                    self.log_step(report, &action, StepStatus::Failed, Some(e.to_string()));
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn execute_inline(
        &mut self,
        command: &InlineCommand,
        report: &mut RunReport,
    ) -> Result<(), EngineError> {
        match command {
            InlineCommand::Wait { seconds } => {
                let seconds = (*seconds).max(1);
                debug!(seconds, "inline wait");
                tokio::time::sleep(Duration::from_secs(seconds)).await;
                report
                    .steps
                    .append("wait", None, None, None, StepStatus::Passed, None);
            }
            InlineCommand::Reload => {
                self.driver.reload().await?;
                self.ctx.cache.invalidate();
                let _ = self.driver.wait_dom_content_loaded(RELOAD_SETTLE).await;
                report
                    .steps
                    .append("reload", None, None, None, StepStatus::Passed, None);
            }
            InlineCommand::ClearCache => {
                self.driver
                    .clear_storage(self.config.preserve_cookies)
                    .await?;
                self.ctx.cache.invalidate();
                tokio::time::sleep(SHORT_SETTLE).await;
                report
                    .steps
                    .append("clearCache", None, None, None, StepStatus::Passed, None);
            }
        }
        Ok(())
    }

    async fn execute_literals(
        &mut self,
        remaining: &mut String,
        report: &mut RunReport,
    ) -> Result<(), EngineError> {
        for literal in pre_extract_type_actions(remaining) {
            if self
                .ctx
                .already_typed
                .iter()
                .any(|f| f.eq_ignore_ascii_case(&literal.field))
            {
                continue;
            }
            let action = ExecutableAction::Type {
                target: Target::new(literal.field.clone(), SelectorKind::Text),
                text: literal.value.clone(),
            };
            match locator::resolve(self.driver.as_ref(), &action).await? {
                Resolution::Found(element) => {
                    if self.config.highlight {
                        let _ = element.highlight().await;
                    }
                    self.fill_with_retry(element.as_ref(), &literal.value, &literal.field)
                        .await?;
                    report.steps.append(
                        "type",
                        Some(&literal.field),
                        Some("text"),
                        Some(&literal.value),
                        StepStatus::Passed,
                        None,
                    );
                    *remaining = strip_literal_phrase(remaining, &literal.field);
                    self.ctx.already_typed.push(literal.field.clone());
                    self.ctx.literals.push(literal);
                }
                Resolution::NotFound => {
                    report.steps.append(
                        "type",
                        Some(&literal.field),
                        Some("text"),
                        Some(&literal.value),
                        StepStatus::Failed,
                        Some("input field not found".into()),
                    );
                    return Err(EngineError::Resolution {
                        action: "type".into(),
                        selector: literal.field,
                    });
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, action: &ExecutableAction) -> Result<StepOutcome, EngineError> {
        match action {
            ExecutableAction::Click { .. } | ExecutableAction::Toggle { .. } => {
                self.dispatch_click(action).await
            }

            ExecutableAction::Type { target, text } => {
                let element = self.must_resolve(action).await?;
                if self.config.highlight {
                    let _ = element.highlight().await;
                }
                self.fill_with_retry(element.as_ref(), text, &target.selector)
                    .await?;
                self.ctx.already_typed.push(target.selector.clone());
                Ok(StepOutcome::Done)
            }

            ExecutableAction::Wait { seconds } => {
                tokio::time::sleep(Duration::from_secs((*seconds).max(1))).await;
                Ok(StepOutcome::Done)
            }

            ExecutableAction::Reload => {
                self.driver.reload().await?;
                self.ctx.cache.invalidate();
                let _ = self.driver.wait_dom_content_loaded(RELOAD_SETTLE).await;
                Ok(StepOutcome::Done)
            }

            ExecutableAction::ClearCache => {
                self.driver
                    .clear_storage(self.config.preserve_cookies)
                    .await?;
                self.ctx.cache.invalidate();
                tokio::time::sleep(SHORT_SETTLE).await;
                Ok(StepOutcome::Done)
            }

            ExecutableAction::WaitForVisible { target, timeout_ms } => {
                let timeout = self.wait_timeout(target, *timeout_ms);
                let element = self.resolve_with_retry(action).await?;
                element
                    .wait_visible(timeout)
                    .await
                    .map_err(|e| execution_error(action, e))?;
                Ok(StepOutcome::Done)
            }

            ExecutableAction::WaitForHidden { target, timeout_ms } => {
                let timeout = self.wait_timeout(target, *timeout_ms);
                let element = self.resolve_with_retry(action).await?;
                element
                    .wait_hidden(timeout)
                    .await
                    .map_err(|e| execution_error(action, e))?;
                Ok(StepOutcome::Done)
            }

            ExecutableAction::AssertVisible { target, timeout_ms } => {
                let timeout = self.wait_timeout(target, *timeout_ms);
                let failure = match locator::resolve(self.driver.as_ref(), action).await? {
                    Resolution::Found(element) => {
                        if self.config.highlight {
                            let _ = element.highlight().await;
                        }
                        element.wait_visible(timeout).await.err().map(|e| e.to_string())
                    }
                    Resolution::NotFound => {
                        Some(format!("'{}' did not resolve to any element", target.selector))
                    }
                };
                match failure {
                    None => {
                        // Slow widgets keep painting after they report visible.
                        if is_slow_selector(&target.selector) {
                            tokio::time::sleep(SHORT_SETTLE).await;
                        }
                        Ok(StepOutcome::Done)
                    }
                    Some(reason) if self.config.soft_assertions => {
                        // A soft miss may just be a page mid-render; give the
                        // document a moment before the next step.
                        let _ = self
                            .driver
                            .wait_dom_content_loaded(Duration::from_secs(2))
                            .await;
                        Ok(StepOutcome::Skipped(reason))
                    }
                    Some(reason) => Err(EngineError::Execution {
                        action: "assertVisible".into(),
                        reason,
                    }),
                }
            }

            ExecutableAction::AssertNotVisible { target } => {
                match locator::resolve(self.driver.as_ref(), action).await? {
                    Resolution::Found(element)
                        if element.is_visible().await.unwrap_or(false) =>
                    {
                        Err(EngineError::Execution {
                            action: "assertNotVisible".into(),
                            reason: format!("'{}' is visible", target.selector),
                        })
                    }
                    _ => Ok(StepOutcome::Done),
                }
            }

            ExecutableAction::WaitForNavigation { timeout_ms } => {
                let timeout =
                    Duration::from_millis(timeout_ms.unwrap_or(NAVIGATION_TIMEOUT_MS));
                self.driver
                    .wait_load(timeout)
                    .await
                    .map_err(|e| execution_error(action, e))?;
                self.note_navigation().await?;
                Ok(StepOutcome::Done)
            }

            ExecutableAction::WaitForUrl {
                url,
                pattern,
                timeout_ms,
            } => {
                let timeout =
                    Duration::from_millis(timeout_ms.unwrap_or(NAVIGATION_TIMEOUT_MS));
                self.driver
                    .wait_for_url(url.as_deref(), pattern.as_deref(), timeout)
                    .await
                    .map_err(|e| execution_error(action, e))?;
                self.note_navigation().await?;
                Ok(StepOutcome::Done)
            }
        }
    }

    async fn dispatch_click(
        &mut self,
        action: &ExecutableAction,
    ) -> Result<StepOutcome, EngineError> {
        let element = self.must_resolve(action).await?;
        if self.config.highlight {
            let _ = element.highlight().await;
        }
        // Best effort: a target that never becomes visible may still accept a
        // synthetic click below.
        let _ = element.wait_visible(CLICK_PRE_WAIT).await;
        let _ = element.scroll_into_view().await;

        if let Err(first) = element.click(false).await {
            debug!("pointer click failed ({first}), falling back to synthetic click");
            tokio::time::sleep(RETRY_PAUSE).await;
            element
                .click(true)
                .await
                .map_err(|e| execution_error(action, e))?;
        }

        let url = self.driver.current_url().await?;
        if self.ctx.nav.observe(&url) {
            self.ctx.cache.invalidate();
            return Ok(StepOutcome::DoneNavigated);
        }
        Ok(StepOutcome::Done)
    }

    async fn must_resolve(
        &self,
        action: &ExecutableAction,
    ) -> Result<Box<dyn DomElement>, EngineError> {
        match locator::resolve(self.driver.as_ref(), action).await? {
            Resolution::Found(element) => Ok(element),
            Resolution::NotFound => Err(EngineError::Resolution {
                action: action.kind_name().to_string(),
                selector: action
                    .target()
                    .map(|t| t.selector.clone())
                    .unwrap_or_default(),
            }),
        }
    }

    /// Resolve, allowing one re-attempt after a short pause for elements that
    /// have not been attached yet.
    async fn resolve_with_retry(
        &self,
        action: &ExecutableAction,
    ) -> Result<Box<dyn DomElement>, EngineError> {
        if let Resolution::Found(element) =
            locator::resolve(self.driver.as_ref(), action).await?
        {
            return Ok(element);
        }
        tokio::time::sleep(RETRY_PAUSE).await;
        self.must_resolve(action).await
    }

    async fn fill_with_retry(
        &self,
        element: &dyn DomElement,
        text: &str,
        field: &str,
    ) -> Result<(), EngineError> {
        if let Err(first) = element.fill(text).await {
            debug!(field, "fill failed ({first}), retrying once");
            tokio::time::sleep(RETRY_PAUSE).await;
            element.fill(text).await.map_err(|e| EngineError::Execution {
                action: "type".into(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    async fn note_navigation(&mut self) -> Result<(), EngineError> {
        let url = self.driver.current_url().await?;
        if self.ctx.nav.observe(&url) {
            self.ctx.cache.invalidate();
        }
        Ok(())
    }

    fn wait_timeout(&self, target: &Target, timeout_ms: Option<u64>) -> Duration {
        effective_timeout(self.config.default_timeout_ms, target, timeout_ms)
    }

    fn log_step(
        &self,
        report: &mut RunReport,
        action: &ExecutableAction,
        status: StepStatus,
        error: Option<String>,
    ) {
        report.steps.append(
            action.kind_name(),
            action.target().map(|t| t.selector.as_str()),
            action.target().map(|t| t.kind.name()),
            action.text(),
            status,
            error,
        );
    }
}

fn execution_error(action: &ExecutableAction, e: DriverError) -> EngineError {
    EngineError::Execution {
        action: action.kind_name().to_string(),
        reason: e.to_string(),
    }
}

/// Effective wait budget for one targeted action. Selectors naming slow
/// widgets (embedded maps, iframes, canvases) get a raised floor.
fn effective_timeout(default_ms: u64, target: &Target, timeout_ms: Option<u64>) -> Duration {
    let mut ms = timeout_ms.unwrap_or(default_ms);
    if is_slow_selector(&target.selector) {
        ms = ms.max(SLOW_SELECTOR_FLOOR_MS);
    }
    Duration::from_millis(ms)
}

fn is_slow_selector(selector: &str) -> bool {
    let lower = selector.to_lowercase();
    ["map", "iframe", "canvas"].iter().any(|w| lower.contains(w))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_budgets() {
        let config = EngineConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_backoff_ms, 900);
        assert_eq!(config.default_timeout_ms, 5_000);
        assert!(!config.soft_assertions);
        assert!(!config.preserve_cookies);
    }

    #[test]
    fn slow_selectors_raise_the_timeout_floor() {
        assert!(is_slow_selector("#store-map"));
        assert!(is_slow_selector("iframe.checkout"));
        assert!(is_slow_selector("the loading canvas"));
        assert!(!is_slow_selector("#login"));
    }

    #[test]
    fn wait_timeout_respects_explicit_value_and_floor() {
        let plain = Target::new("#login", SelectorKind::Css);
        assert_eq!(effective_timeout(5_000, &plain, None), Duration::from_millis(5_000));
        assert_eq!(
            effective_timeout(5_000, &plain, Some(2_000)),
            Duration::from_millis(2_000)
        );

        let slow = Target::new("#store-map", SelectorKind::Css);
        assert_eq!(
            effective_timeout(5_000, &slow, Some(2_000)),
            Duration::from_millis(10_000)
        );
        assert_eq!(
            effective_timeout(5_000, &slow, Some(20_000)),
            Duration::from_millis(20_000)
        );
    }
}

//! End-to-end engine tests over an in-memory page and scripted model replies.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use pagepilot::driver::{DomElement, Driver, DriverResult, ElementQuery, SearchScope};
use pagepilot::engine::{Engine, EngineConfig, EngineError};
use pagepilot::llm::{ChatProvider, LlmGateway};
use pagepilot::report::StepStatus;

/// Shared state of the fake page: which labelled elements exist and what was
/// done to them.
#[derive(Default)]
struct PageState {
    url: Mutex<String>,
    labels: Mutex<Vec<String>>,
    clicks: Mutex<Vec<String>>,
    fills: Mutex<Vec<(String, String)>>,
    navigate_on_click: Mutex<Option<String>>,
    html_fetches: Mutex<usize>,
}

struct FakeDriver {
    state: Arc<PageState>,
}

impl FakeDriver {
    fn new(url: &str, labels: &[&str]) -> Self {
        let state = Arc::new(PageState::default());
        *state.url.lock().unwrap() = url.to_string();
        *state.labels.lock().unwrap() = labels.iter().map(|l| l.to_string()).collect();
        Self { state }
    }
}

struct FakeElement {
    label: String,
    state: Arc<PageState>,
}

#[async_trait]
impl DomElement for FakeElement {
    async fn is_visible(&self) -> DriverResult<bool> {
        Ok(true)
    }

    async fn click(&self, _force: bool) -> DriverResult<()> {
        self.state.clicks.lock().unwrap().push(self.label.clone());
        if let Some(next) = self.state.navigate_on_click.lock().unwrap().take() {
            *self.state.url.lock().unwrap() = next;
        }
        Ok(())
    }

    async fn fill(&self, text: &str) -> DriverResult<()> {
        self.state
            .fills
            .lock()
            .unwrap()
            .push((self.label.clone(), text.to_string()));
        Ok(())
    }

    async fn wait_visible(&self, _timeout: Duration) -> DriverResult<()> {
        Ok(())
    }

    async fn wait_hidden(&self, _timeout: Duration) -> DriverResult<()> {
        Ok(())
    }

    async fn scroll_into_view(&self) -> DriverResult<()> {
        Ok(())
    }

    async fn highlight(&self) -> DriverResult<()> {
        Ok(())
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn current_url(&self) -> DriverResult<String> {
        Ok(self.state.url.lock().unwrap().clone())
    }

    async fn page_html(&self) -> DriverResult<String> {
        *self.state.html_fetches.lock().unwrap() += 1;
        let labels = self.state.labels.lock().unwrap();
        Ok(format!("<body>{}</body>", labels.join(" ")))
    }

    async fn container_html(&self, _css: &str) -> DriverResult<Option<String>> {
        Ok(None)
    }

    // A candidate query matches when it embeds a known label verbatim, which
    // is how the locator's lowered queries carry the original text.
    async fn find(
        &self,
        query: &ElementQuery,
        scope: SearchScope,
    ) -> DriverResult<Vec<Box<dyn DomElement>>> {
        if scope != SearchScope::MainDocument {
            return Ok(Vec::new());
        }
        let labels = self.state.labels.lock().unwrap();
        Ok(labels
            .iter()
            .filter(|label| query.as_str().contains(label.as_str()))
            .map(|label| {
                Box::new(FakeElement {
                    label: label.clone(),
                    state: self.state.clone(),
                }) as Box<dyn DomElement>
            })
            .collect())
    }

    async fn subframe_count(&self) -> DriverResult<usize> {
        Ok(0)
    }

    async fn wait_dom_content_loaded(&self, _timeout: Duration) -> DriverResult<()> {
        Ok(())
    }

    async fn wait_load(&self, _timeout: Duration) -> DriverResult<()> {
        Ok(())
    }

    async fn wait_for_url(
        &self,
        _literal: Option<&str>,
        _pattern: Option<&str>,
        _timeout: Duration,
    ) -> DriverResult<()> {
        Ok(())
    }

    async fn reload(&self) -> DriverResult<()> {
        Ok(())
    }

    async fn clear_storage(&self, _preserve_cookies: bool) -> DriverResult<()> {
        Ok(())
    }
}

/// Replies are consumed in order; the last one repeats.
struct ScriptedProvider {
    replies: Mutex<Vec<String>>,
    calls: Arc<Mutex<usize>>,
    fail: bool,
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, _prompt: &str) -> anyhow::Result<String> {
        *self.calls.lock().unwrap() += 1;
        if self.fail {
            anyhow::bail!("scripted failure");
        }
        let mut replies = self.replies.lock().unwrap();
        if replies.len() > 1 {
            Ok(replies.remove(0))
        } else {
            Ok(replies[0].clone())
        }
    }
}

fn scripted(replies: &[&str]) -> (LlmGateway, Arc<Mutex<usize>>) {
    let calls = Arc::new(Mutex::new(0));
    let provider = Arc::new(ScriptedProvider {
        replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
        calls: calls.clone(),
        fail: false,
    });
    (LlmGateway::new(vec![provider]), calls)
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        retry_backoff_ms: 1,
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn click_then_inline_wait_completes() {
    let driver = FakeDriver::new("https://shop.test/", &["Login"]);
    let state = driver.state.clone();
    let (gateway, calls) =
        scripted(&[r#"[{"action":"click","selector":"Login","selectorType":"text"}]"#]);
    let mut engine = Engine::new(Box::new(driver), gateway, fast_config());

    let report = engine
        .run("click Login then wait 1 second")
        .await
        .expect("run succeeds");

    assert_eq!(*calls.lock().unwrap(), 1, "inline wait must not call the model");
    assert_eq!(*state.clicks.lock().unwrap(), vec!["Login".to_string()]);
    let steps = report.steps.entries();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].action, "click");
    assert_eq!(steps[0].status, StepStatus::Passed);
    assert_eq!(steps[1].action, "wait");
    assert_eq!(steps[1].status, StepStatus::Passed);
    assert_eq!(report.rounds, 2);
}

#[tokio::test]
async fn unparseable_model_output_exhausts_retries() {
    let driver = FakeDriver::new("https://shop.test/", &["Login"]);
    let (gateway, calls) = scripted(&["I cannot produce actions for that."]);
    let mut engine = Engine::new(Box::new(driver), gateway, fast_config());

    let err = engine.run("click Login").await.expect_err("run must fail");
    match err {
        EngineError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(*calls.lock().unwrap(), 3);
}

#[tokio::test]
async fn soft_assertion_miss_is_logged_as_skipped() {
    let driver = FakeDriver::new("https://shop.test/", &["Login"]);
    let (gateway, _calls) =
        scripted(&[r#"[{"action":"assertVisible","selector":"Banner","selectorType":"text"}]"#]);
    let config = EngineConfig {
        soft_assertions: true,
        ..fast_config()
    };
    let mut engine = Engine::new(Box::new(driver), gateway, config);

    let report = engine
        .run("check that the Banner is visible")
        .await
        .expect("soft assertion must not fail the run");

    let steps = report.steps.entries();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].action, "assertVisible");
    assert_eq!(steps[0].status, StepStatus::Skipped);
    assert!(steps[0].error.as_deref().unwrap_or("").contains("Banner"));
}

#[tokio::test]
async fn quoted_literal_is_typed_without_a_model_call() {
    let driver = FakeDriver::new("https://shop.test/", &["Email"]);
    let state = driver.state.clone();
    let (gateway, calls) = scripted(&["[]"]);
    let mut engine = Engine::new(Box::new(driver), gateway, fast_config());

    let report = engine
        .run("type 'alice@example.com' into Email")
        .await
        .expect("run succeeds");

    assert_eq!(*calls.lock().unwrap(), 0);
    assert_eq!(
        *state.fills.lock().unwrap(),
        vec![("Email".to_string(), "alice@example.com".to_string())]
    );
    let steps = report.steps.entries();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].action, "type");
    assert_eq!(steps[0].status, StepStatus::Passed);
    assert_eq!(steps[0].text.as_deref(), Some("alice@example.com"));
    assert_eq!(report.rounds, 1);
}

#[tokio::test]
async fn navigation_abandons_the_plan_and_replans_fresh() {
    let driver = FakeDriver::new("https://shop.test/", &["Login", "Banner"]);
    let state = driver.state.clone();
    *state.navigate_on_click.lock().unwrap() = Some("https://shop.test/dashboard".into());
    let (gateway, calls) = scripted(&[
        // First plan carries two actions; only the click should run because
        // it navigates.
        r#"[{"action":"click","selector":"Login","selectorType":"text"},
            {"action":"assertVisible","selector":"Banner","selectorType":"text"}]"#,
        r#"[{"action":"assertVisible","selector":"Banner","selectorType":"text"}]"#,
    ]);
    let mut engine = Engine::new(Box::new(driver), gateway, fast_config());

    let report = engine
        .run("click Login and check that the Banner is visible")
        .await
        .expect("run succeeds");

    assert_eq!(*calls.lock().unwrap(), 2, "navigation must force a replan");
    assert_eq!(
        *state.html_fetches.lock().unwrap(),
        2,
        "cache must be invalidated by the navigation"
    );
    let steps = report.steps.entries();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].action, "click");
    assert_eq!(steps[1].action, "assertVisible");
    assert_eq!(steps[1].status, StepStatus::Passed);
}

#[tokio::test]
async fn gateway_falls_back_past_a_failing_provider() {
    let driver = FakeDriver::new("https://shop.test/", &["Login"]);
    let calls = Arc::new(Mutex::new(0));
    let failing = Arc::new(ScriptedProvider {
        replies: Mutex::new(vec![String::new()]),
        calls: calls.clone(),
        fail: true,
    });
    let working = Arc::new(ScriptedProvider {
        replies: Mutex::new(vec![
            r#"[{"action":"click","selector":"Login","selectorType":"text"}]"#.to_string(),
        ]),
        calls: Arc::new(Mutex::new(0)),
        fail: false,
    });
    let gateway = LlmGateway::new(vec![failing, working]);
    let mut engine = Engine::new(Box::new(driver), gateway, fast_config());

    let report = engine.run("click Login").await.expect("fallback succeeds");

    assert_eq!(*calls.lock().unwrap(), 1, "first provider was tried");
    assert_eq!(report.transcripts.len(), 1);
    assert_eq!(report.transcripts[0].model, "scripted");
    assert_eq!(report.steps.entries()[0].status, StepStatus::Passed);
}

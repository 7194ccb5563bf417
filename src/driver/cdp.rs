//! chromiumoxide-backed driver.
//!
//! Lookup semantics: CSS and XPath run against the main document; the
//! sub-frame pass uses the DOM agent's flattened search, which reaches
//! same-process iframe content documents. Cross-origin frames are out of
//! reach over a single CDP session.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::ClearBrowserCookiesParams;
use chromiumoxide::element::Element;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{DomElement, Driver, DriverError, DriverResult, ElementQuery, SearchScope};

const POLL_START: Duration = Duration::from_millis(100);
const POLL_CAP: Duration = Duration::from_secs(1);

const IS_VISIBLE_FN: &str = r#"function() {
    const rect = this.getBoundingClientRect();
    const style = window.getComputedStyle(this);
    return rect.width > 0 && rect.height > 0
        && style.visibility !== 'hidden' && style.display !== 'none';
}"#;

const HIGHLIGHT_FN: &str = r#"function() {
    this.scrollIntoView({ block: 'center', inline: 'center' });
    const previous = this.style.outline;
    this.style.outline = '3px solid orange';
    setTimeout(() => { this.style.outline = previous; }, 600);
}"#;

fn backend(e: impl std::fmt::Display) -> DriverError {
    DriverError::Backend(e.to_string())
}

/// Launched browser plus its event-handler task.
///
/// The handler MUST be aborted when done, otherwise it keeps running after the
/// browser is closed; `Drop` takes care of that.
pub struct BrowserHandle {
    pub browser: Browser,
    handler: JoinHandle<()>,
}

impl Drop for BrowserHandle {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

/// Launch a Chrome instance and drive its event loop on a background task.
pub async fn launch_browser(headless: bool, width: u32, height: u32) -> DriverResult<BrowserHandle> {
    info!(headless, "launching browser");

    let mut builder = BrowserConfig::builder()
        .request_timeout(Duration::from_secs(30))
        .window_size(width, height);
    if !headless {
        builder = builder.with_head();
    }
    let config = builder.build().map_err(DriverError::Backend)?;

    let (browser, mut handler) = Browser::launch(config).await.map_err(backend)?;
    let handler = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                debug!("browser handler event error: {e}");
                break;
            }
        }
    });

    Ok(BrowserHandle { browser, handler })
}

/// [`Driver`] implementation over a chromiumoxide [`Page`].
pub struct CdpDriver {
    page: Page,
}

impl CdpDriver {
    pub fn new(page: Page) -> Self {
        Self { page }
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    async fn ready_state(&self) -> DriverResult<String> {
        self.page
            .evaluate("document.readyState")
            .await
            .map_err(backend)?
            .into_value::<String>()
            .map_err(backend)
    }

    /// Poll until `done(state)` holds, doubling the poll interval up to a cap.
    async fn wait_ready_state(
        &self,
        timeout: Duration,
        what: &str,
        done: impl Fn(&str) -> bool,
    ) -> DriverResult<()> {
        let start = std::time::Instant::now();
        let mut poll = POLL_START;
        loop {
            if done(&self.ready_state().await.unwrap_or_default()) {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(DriverError::Timeout(timeout, what.to_string()));
            }
            tokio::time::sleep(poll).await;
            poll = (poll * 2).min(POLL_CAP);
        }
    }
}

#[async_trait]
impl Driver for CdpDriver {
    async fn current_url(&self) -> DriverResult<String> {
        self.page
            .url()
            .await
            .map_err(backend)?
            .ok_or_else(|| DriverError::Backend("page has no URL".into()))
    }

    async fn page_html(&self) -> DriverResult<String> {
        self.page.content().await.map_err(backend)
    }

    async fn container_html(&self, css: &str) -> DriverResult<Option<String>> {
        let elements = match self.page.find_elements(css).await {
            Ok(elements) => elements,
            Err(e) => {
                debug!(selector = css, "container lookup failed: {e}");
                return Ok(None);
            }
        };
        for element in elements {
            let cdp = CdpElement { element };
            if cdp.is_visible().await.unwrap_or(false) {
                return match cdp.element.inner_html().await {
                    Ok(html) => Ok(html),
                    Err(e) => {
                        debug!(selector = css, "container markup read failed: {e}");
                        Ok(None)
                    }
                };
            }
        }
        Ok(None)
    }

    async fn find(
        &self,
        query: &ElementQuery,
        scope: SearchScope,
    ) -> DriverResult<Vec<Box<dyn DomElement>>> {
        let elements: Vec<Element> = match (scope, query) {
            (SearchScope::MainDocument, ElementQuery::Css(css)) => {
                self.page.find_elements(css.as_str()).await.unwrap_or_default()
            }
            (SearchScope::MainDocument, ElementQuery::Xpath(xpath)) => {
                self.page.find_xpaths(xpath.as_str()).await.unwrap_or_default()
            }
            (SearchScope::SubFrame(_), ElementQuery::Xpath(xpath)) => {
                // The flattened DOM search covers same-process frame content
                // documents; one pass stands in for every sub-frame.
                self.page.find_xpaths(xpath.as_str()).await.unwrap_or_default()
            }
            (SearchScope::SubFrame(_), ElementQuery::Css(_)) => {
                // CSS cannot pierce frame boundaries from the main document.
                Vec::new()
            }
        };

        Ok(elements
            .into_iter()
            .map(|element| Box::new(CdpElement { element }) as Box<dyn DomElement>)
            .collect())
    }

    async fn subframe_count(&self) -> DriverResult<usize> {
        // Only the flattened-search pass exists; report one searchable
        // sub-frame scope whenever the page embeds any frame at all.
        let iframes = self.page.find_elements("iframe").await.unwrap_or_default();
        Ok(usize::from(!iframes.is_empty()))
    }

    async fn wait_dom_content_loaded(&self, timeout: Duration) -> DriverResult<()> {
        self.wait_ready_state(timeout, "DOM content loaded", |s| s != "loading")
            .await
    }

    async fn wait_load(&self, timeout: Duration) -> DriverResult<()> {
        self.wait_ready_state(timeout, "load event", |s| s == "complete")
            .await
    }

    async fn wait_for_url(
        &self,
        literal: Option<&str>,
        pattern: Option<&str>,
        timeout: Duration,
    ) -> DriverResult<()> {
        if literal.is_none() && pattern.is_none() {
            return self.wait_load(timeout).await;
        }

        let regex = match pattern {
            Some(p) => Some(regex::Regex::new(p).map_err(|e| DriverError::InvalidSelector {
                selector: p.to_string(),
                reason: e.to_string(),
            })?),
            None => None,
        };

        let start = std::time::Instant::now();
        let mut poll = POLL_START;
        loop {
            let url = self.current_url().await.unwrap_or_default();
            let literal_hit = literal.map(|l| url.contains(l)).unwrap_or(false);
            let pattern_hit = regex.as_ref().map(|r| r.is_match(&url)).unwrap_or(false);
            if literal_hit || pattern_hit {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(DriverError::Timeout(
                    timeout,
                    format!(
                        "URL matching {}",
                        literal.or(pattern).unwrap_or_default()
                    ),
                ));
            }
            tokio::time::sleep(poll).await;
            poll = (poll * 2).min(POLL_CAP);
        }
    }

    async fn reload(&self) -> DriverResult<()> {
        self.page.reload().await.map_err(backend)?;
        Ok(())
    }

    async fn clear_storage(&self, preserve_cookies: bool) -> DriverResult<()> {
        self.page
            .evaluate("(() => { localStorage.clear(); sessionStorage.clear(); })()")
            .await
            .map_err(backend)?;
        if !preserve_cookies {
            self.page
                .execute(ClearBrowserCookiesParams::default())
                .await
                .map_err(backend)?;
        }
        Ok(())
    }
}

struct CdpElement {
    element: Element,
}

impl CdpElement {
    async fn poll_visibility(
        &self,
        timeout: Duration,
        want_visible: bool,
        what: &str,
    ) -> DriverResult<()> {
        let start = std::time::Instant::now();
        let mut poll = POLL_START;
        loop {
            if self.is_visible().await.unwrap_or(false) == want_visible {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(DriverError::Timeout(timeout, what.to_string()));
            }
            tokio::time::sleep(poll).await;
            poll = (poll * 2).min(POLL_CAP);
        }
    }
}

#[async_trait]
impl DomElement for CdpElement {
    async fn is_visible(&self) -> DriverResult<bool> {
        let ret = self
            .element
            .call_js_fn(IS_VISIBLE_FN, false)
            .await
            .map_err(backend)?;
        Ok(ret
            .result
            .value
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    async fn click(&self, force: bool) -> DriverResult<()> {
        if force {
            // Synthetic click for elements a pointer event cannot reach
            // (covered by overlays, zero-size hit targets).
            self.element
                .call_js_fn("function() { this.click(); }", false)
                .await
                .map_err(backend)?;
            return Ok(());
        }
        self.element.click().await.map_err(backend)?;
        Ok(())
    }

    async fn fill(&self, text: &str) -> DriverResult<()> {
        self.element
            .call_js_fn(
                "function() { if ('value' in this) { this.value = ''; } }",
                false,
            )
            .await
            .map_err(backend)?;
        self.element.click().await.map_err(backend)?;
        self.element.type_str(text).await.map_err(backend)?;
        Ok(())
    }

    async fn wait_visible(&self, timeout: Duration) -> DriverResult<()> {
        self.poll_visibility(timeout, true, "element to become visible").await
    }

    async fn wait_hidden(&self, timeout: Duration) -> DriverResult<()> {
        self.poll_visibility(timeout, false, "element to become hidden").await
    }

    async fn scroll_into_view(&self) -> DriverResult<()> {
        self.element.scroll_into_view().await.map_err(backend)?;
        Ok(())
    }

    async fn highlight(&self) -> DriverResult<()> {
        if let Err(e) = self.element.call_js_fn(HIGHLIGHT_FN, false).await {
            warn!("highlight overlay failed: {e}");
        }
        Ok(())
    }
}

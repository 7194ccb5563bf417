//! Browser abstraction consumed by the engine and resolver.
//!
//! The engine never talks to chromiumoxide directly; it sees a [`Driver`]
//! (page-level operations) and [`DomElement`] handles (per-element
//! operations). The production implementation is [`cdp::CdpDriver`]; tests use
//! in-memory fakes.

pub mod cdp;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("browser call failed: {0}")]
    Backend(String),

    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(Duration, String),

    #[error("invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },
}

pub type DriverResult<T> = Result<T, DriverError>;

/// A concrete lookup the driver can run: CSS or XPath.
///
/// The locator lowers every higher-level strategy (role, label, placeholder,
/// attribute substring, visible text) into one of these two forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementQuery {
    Css(String),
    Xpath(String),
}

impl ElementQuery {
    pub fn as_str(&self) -> &str {
        match self {
            ElementQuery::Css(s) | ElementQuery::Xpath(s) => s,
        }
    }
}

/// Where a lookup runs: the main document or one sub-frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    MainDocument,
    SubFrame(usize),
}

/// One resolved page element.
#[async_trait]
pub trait DomElement: Send + Sync {
    async fn is_visible(&self) -> DriverResult<bool>;

    /// Click the element. `force` dispatches a synthetic click instead of a
    /// pointer event, for elements a normal click cannot reach.
    async fn click(&self, force: bool) -> DriverResult<()>;

    /// Clear and fill an input-like element.
    async fn fill(&self, text: &str) -> DriverResult<()>;

    async fn wait_visible(&self, timeout: Duration) -> DriverResult<()>;

    async fn wait_hidden(&self, timeout: Duration) -> DriverResult<()>;

    async fn scroll_into_view(&self) -> DriverResult<()>;

    /// Best-effort visual debugging aid; failures are the caller's to ignore.
    async fn highlight(&self) -> DriverResult<()>;
}

/// Page-level browser operations.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn current_url(&self) -> DriverResult<String>;

    /// Full page markup.
    async fn page_html(&self) -> DriverResult<String>;

    /// Markup of the first visible match of `css`, or `None` when the
    /// container is absent or not visible.
    async fn container_html(&self, css: &str) -> DriverResult<Option<String>>;

    async fn find(
        &self,
        query: &ElementQuery,
        scope: SearchScope,
    ) -> DriverResult<Vec<Box<dyn DomElement>>>;

    /// Number of sub-frames that can be searched after the main document.
    async fn subframe_count(&self) -> DriverResult<usize>;

    async fn wait_dom_content_loaded(&self, timeout: Duration) -> DriverResult<()>;

    async fn wait_load(&self, timeout: Duration) -> DriverResult<()>;

    /// Wait until the URL contains `literal` or matches `pattern` (a regex).
    /// With neither supplied, degrades to a generic load wait.
    async fn wait_for_url(
        &self,
        literal: Option<&str>,
        pattern: Option<&str>,
        timeout: Duration,
    ) -> DriverResult<()>;

    async fn reload(&self) -> DriverResult<()>;

    /// Clear local and session storage; cookies too unless `preserve_cookies`.
    async fn clear_storage(&self, preserve_cookies: bool) -> DriverResult<()>;
}

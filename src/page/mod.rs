//! Page state: navigation tracking, the time-boxed markup cache, and the
//! bounded HTML excerpt fed into the model prompt.

use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::driver::{Driver, DriverResult};

/// How long a cached excerpt stays usable.
pub const CACHE_FRESHNESS: Duration = Duration::from_millis(5000);

/// Hard ceiling on the excerpt handed to the model.
pub const MAX_EXCERPT_CHARS: usize = 25_000;

const TRUNCATION_MARKER: &str = "\n<!-- truncated -->";

/// Brief pause for rendering to settle before markup extraction.
const SETTLE: Duration = Duration::from_millis(300);

/// Generic "main content" containers tried when no explicit container is
/// given.
const MAIN_CONTENT_CONTAINERS: &[&str] = &["main", "#main", "#content", ".main-content", "#app", "#root"];

/// URL the engine last observed, and how many times it has changed.
#[derive(Debug, Clone, Default)]
pub struct NavigationState {
    pub current_url: String,
    pub navigation_count: u32,
}

impl NavigationState {
    /// Record the observed URL; returns true when it differs from the last
    /// one (navigation detected).
    pub fn observe(&mut self, url: &str) -> bool {
        if self.current_url == url {
            return false;
        }
        let first = self.current_url.is_empty();
        self.current_url = url.to_string();
        if first {
            return false;
        }
        self.navigation_count += 1;
        true
    }
}

/// Cached page excerpt plus the last model exchange.
#[derive(Debug, Default)]
pub struct PageCache {
    html: Option<String>,
    html_at: Option<Instant>,
    url: String,
    pub last_command: Option<String>,
    pub last_response: Option<String>,
}

impl PageCache {
    /// A cached excerpt is valid only while fresh AND taken from the live
    /// URL; a URL mismatch makes it stale even inside the freshness window.
    pub fn fresh_excerpt(&self, live_url: &str) -> Option<&str> {
        let taken_at = self.html_at?;
        if taken_at.elapsed() > CACHE_FRESHNESS || self.url != live_url {
            return None;
        }
        self.html.as_deref()
    }

    pub fn store(&mut self, url: &str, excerpt: String) {
        self.url = url.to_string();
        self.html = Some(excerpt);
        self.html_at = Some(Instant::now());
    }

    pub fn invalidate(&mut self) {
        self.html = None;
        self.html_at = None;
        self.url.clear();
        self.last_command = None;
        self.last_response = None;
    }
}

/// Produce the bounded, sanitized page excerpt for the model prompt.
///
/// Scoped to `container` when that is present and visible; otherwise the
/// first visible generic main-content container; otherwise the whole page.
pub async fn get_optimized_html(
    driver: &dyn Driver,
    container: Option<&str>,
    cache: &mut PageCache,
    use_cache: bool,
) -> DriverResult<String> {
    let url = driver.current_url().await?;

    if use_cache {
        if let Some(cached) = cache.fresh_excerpt(&url) {
            debug!("using cached page excerpt");
            return Ok(cached.to_string());
        }
    }

    // Best-effort settle; a page stuck loading still gets summarized.
    let _ = driver.wait_dom_content_loaded(Duration::from_secs(2)).await;
    tokio::time::sleep(SETTLE).await;

    let mut raw = None;
    if let Some(selector) = container {
        raw = driver.container_html(selector).await.unwrap_or(None);
        if raw.is_none() {
            debug!(selector, "container not visible, falling back to page markup");
        }
    }
    if raw.is_none() {
        for selector in MAIN_CONTENT_CONTAINERS {
            if let Ok(Some(html)) = driver.container_html(selector).await {
                raw = Some(html);
                break;
            }
        }
    }
    let raw = match raw {
        Some(html) => html,
        None => driver.page_html().await?,
    };

    let excerpt = sanitize_html(&raw);
    if use_cache {
        cache.store(&url, excerpt.clone());
    }
    Ok(excerpt)
}

static COMMENTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").expect("static regex"));
static SCRIPTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?si)<script\b.*?</script>").expect("static regex"));
static STYLES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?si)<style\b.*?</style>").expect("static regex"));
// Requires a value: hyphenated words in visible text ("data-driven") must
// not match.
static DATA_ATTRS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\sdata-[\w-]+(?:="[^"]*"|='[^']*')"#).expect("static regex")
});
static LONG_INLINE_ATTRS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(style|class)="([^"]{80})[^"]*""#).expect("static regex")
});
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\r\n]+").expect("static regex"));

/// Strip scripts, styles, comments and `data-*` attributes, truncate long
/// inline style/class values, collapse whitespace, and cap the length.
pub fn sanitize_html(raw: &str) -> String {
    let step = COMMENTS.replace_all(raw, "");
    let step = SCRIPTS.replace_all(&step, "");
    let step = STYLES.replace_all(&step, "");
    let step = DATA_ATTRS.replace_all(&step, "");
    let step = LONG_INLINE_ATTRS.replace_all(&step, "$1=\"$2\"");
    let collapsed = WHITESPACE.replace_all(&step, " ").trim().to_string();

    if collapsed.chars().count() <= MAX_EXCERPT_CHARS {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(MAX_EXCERPT_CHARS).collect();
    format!("{cut}{TRUNCATION_MARKER}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_scripts_styles_comments() {
        let raw = r#"<html><!-- hidden --><head><style>.x{color:red}</style>
            <script src="a.js">var x = 1;</script></head>
            <body><p>Hello</p></body></html>"#;
        let out = sanitize_html(raw);
        assert!(!out.contains("script"));
        assert!(!out.contains("color:red"));
        assert!(!out.contains("hidden"));
        assert!(out.contains("<p>Hello</p>"));
    }

    #[test]
    fn sanitize_strips_data_attributes() {
        let raw = r#"<div data-reactid="42" data-test="x" class="card">hi</div>"#;
        let out = sanitize_html(raw);
        assert!(!out.contains("data-reactid"));
        assert!(!out.contains("data-test"));
        assert!(out.contains(r#"class="card""#));
    }

    #[test]
    fn sanitize_leaves_hyphenated_words_in_text() {
        let raw = r#"<p>We take a data-driven approach</p>"#;
        let out = sanitize_html(raw);
        assert!(out.contains("a data-driven approach"));
    }

    #[test]
    fn sanitize_truncates_long_inline_attributes() {
        let long_class = "c".repeat(300);
        let raw = format!(r#"<div class="{long_class}">hi</div>"#);
        let out = sanitize_html(&raw);
        assert!(out.len() < raw.len());
        assert!(out.contains(&"c".repeat(80)));
        assert!(!out.contains(&"c".repeat(81)));
    }

    #[test]
    fn sanitize_caps_length_with_marker() {
        let raw = "x".repeat(MAX_EXCERPT_CHARS * 2);
        let out = sanitize_html(&raw);
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert_eq!(
            out.chars().count(),
            MAX_EXCERPT_CHARS + TRUNCATION_MARKER.chars().count()
        );
    }

    #[test]
    fn cache_is_stale_on_url_mismatch_even_when_fresh() {
        let mut cache = PageCache::default();
        cache.store("https://a.test/", "<p>a</p>".into());
        assert_eq!(cache.fresh_excerpt("https://a.test/"), Some("<p>a</p>"));
        assert_eq!(cache.fresh_excerpt("https://b.test/"), None);
    }

    #[test]
    fn invalidate_clears_everything() {
        let mut cache = PageCache::default();
        cache.store("https://a.test/", "<p>a</p>".into());
        cache.last_command = Some("prompt".into());
        cache.invalidate();
        assert_eq!(cache.fresh_excerpt("https://a.test/"), None);
        assert!(cache.last_command.is_none());
    }

    #[test]
    fn navigation_observe_counts_changes() {
        let mut nav = NavigationState::default();
        assert!(!nav.observe("https://a.test/"));
        assert!(!nav.observe("https://a.test/"));
        assert!(nav.observe("https://a.test/dashboard"));
        assert_eq!(nav.navigation_count, 1);
    }
}

//! Multi-strategy element resolution.
//!
//! CSS and XPath selectors run as-is. Text selectors are lowered into a
//! ranked list of concrete CSS/XPath candidates — accessible roles first,
//! attribute matches next, bare text containment last — searched in the main
//! document and then in every sub-frame. Resolution failure is a value, not
//! an error: the dispatch layer decides whether `NotFound` is fatal for the
//! action at hand. No site-specific fallback exists here by design.

use tracing::debug;

use crate::driver::{DomElement, Driver, DriverResult, ElementQuery, SearchScope};
use crate::pipeline::{ExecutableAction, SelectorKind};

/// How many matches of each candidate query are examined for visibility.
const MATCHES_PER_CANDIDATE: usize = 5;

pub enum Resolution {
    Found(Box<dyn DomElement>),
    NotFound,
}

impl Resolution {
    pub fn is_found(&self) -> bool {
        matches!(self, Resolution::Found(_))
    }
}

/// Resolve the action's target to a concrete element, if it has one.
pub async fn resolve(driver: &dyn Driver, action: &ExecutableAction) -> DriverResult<Resolution> {
    let target = match action.target() {
        Some(target) => target,
        None => return Ok(Resolution::NotFound),
    };

    match target.kind {
        SelectorKind::None => Ok(Resolution::NotFound),
        SelectorKind::Css => {
            first_match(driver, &ElementQuery::Css(target.selector.clone())).await
        }
        SelectorKind::Xpath => {
            let xpath = target
                .selector
                .strip_prefix("xpath=")
                .unwrap_or(&target.selector);
            first_match(driver, &ElementQuery::Xpath(xpath.to_string())).await
        }
        SelectorKind::Text => resolve_text(driver, action, &target.selector).await,
    }
}

async fn first_match(driver: &dyn Driver, query: &ElementQuery) -> DriverResult<Resolution> {
    let mut elements = driver.find(query, SearchScope::MainDocument).await?;
    if elements.is_empty() {
        return Ok(Resolution::NotFound);
    }
    Ok(Resolution::Found(elements.remove(0)))
}

async fn resolve_text(
    driver: &dyn Driver,
    action: &ExecutableAction,
    text: &str,
) -> DriverResult<Resolution> {
    let typing = matches!(action, ExecutableAction::Type { .. });
    let click_like = matches!(
        action,
        ExecutableAction::Click { .. } | ExecutableAction::Toggle { .. }
    );

    let candidates = if typing {
        input_field_candidates(text)
    } else {
        text_candidates(text, click_like)
    };

    // Main document first: the first visible element among the first five
    // matches of each candidate wins.
    let mut first_any: Option<Box<dyn DomElement>> = None;
    for query in &candidates {
        let elements = driver.find(query, SearchScope::MainDocument).await?;
        for element in elements.into_iter().take(MATCHES_PER_CANDIDATE) {
            if element.is_visible().await.unwrap_or(false) {
                debug!(?query, "resolved in main document");
                return Ok(Resolution::Found(element));
            }
            if typing && first_any.is_none() {
                first_any = Some(element);
            }
        }
    }
    // Input-field resolution degrades to the first candidate at all when
    // nothing is visible yet.
    if let Some(element) = first_any {
        return Ok(Resolution::Found(element));
    }

    // Then every sub-frame in document order; the first frame producing a
    // non-empty match wins.
    let frames = driver.subframe_count().await?;
    for frame in 0..frames {
        for query in &candidates {
            let mut elements = driver.find(query, SearchScope::SubFrame(frame)).await?;
            if elements.is_empty() {
                continue;
            }
            let mut fallback = None;
            for (i, element) in elements.drain(..).take(MATCHES_PER_CANDIDATE).enumerate() {
                if element.is_visible().await.unwrap_or(false) {
                    debug!(?query, frame, "resolved in sub-frame");
                    return Ok(Resolution::Found(element));
                }
                // Only input-field resolution may fall back to a not-yet-visible
                // match; clicks and asserts must never act on invisible elements.
                if typing && i == 0 {
                    fallback = Some(element);
                }
            }
            if let Some(element) = fallback {
                return Ok(Resolution::Found(element));
            }
        }
    }

    Ok(Resolution::NotFound)
}

/// XPath string literal, split into `concat(..)` when both quote kinds occur.
fn xpath_literal(text: &str) -> String {
    if !text.contains('\'') {
        return format!("'{text}'");
    }
    if !text.contains('"') {
        return format!("\"{text}\"");
    }
    let parts: Vec<String> = text.split('\'').map(|p| format!("'{p}'")).collect();
    format!("concat({})", parts.join(r#", "'", "#))
}

/// Attribute value for a double-quoted CSS attribute selector.
fn css_value(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Lowercased hyphenated form used for test-id and id/name substring probes.
fn slug(text: &str) -> String {
    text.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// Ranked candidate queries for a generic text selector.
fn text_candidates(text: &str, click_like: bool) -> Vec<ElementQuery> {
    let t = text.trim();
    let lit = xpath_literal(t);
    let css = css_value(t);
    let slug = slug(t);
    let lower = t.to_lowercase();

    let mut queries = vec![
        // Accessible roles by name: most robust to markup change.
        ElementQuery::Xpath(format!(
            "//button[contains(normalize-space(.), {lit})] \
             | //input[(@type='submit' or @type='button') and contains(@value, {lit})] \
             | //*[@role='button'][contains(normalize-space(.), {lit}) or contains(@aria-label, {lit})]"
        )),
        ElementQuery::Xpath(format!(
            "//a[contains(normalize-space(.), {lit})] | //*[@role='link'][contains(normalize-space(.), {lit})]"
        )),
        ElementQuery::Xpath(format!(
            "//h1[contains(normalize-space(.), {lit})] | //h2[contains(normalize-space(.), {lit})] \
             | //h3[contains(normalize-space(.), {lit})] | //h4[contains(normalize-space(.), {lit})] \
             | //*[@role='heading'][contains(normalize-space(.), {lit})]"
        )),
        ElementQuery::Xpath(format!(
            "//*[@role='checkbox' or @role='radio'][contains(@aria-label, {lit}) or contains(normalize-space(.), {lit})] \
             | //input[@type='checkbox' or @type='radio'][contains(@aria-label, {lit})]"
        )),
        ElementQuery::Xpath(format!(
            "//*[@role='textbox'][contains(@aria-label, {lit})] | //input[contains(@aria-label, {lit})]"
        )),
        // Label / placeholder / descriptive attributes.
        ElementQuery::Xpath(format!("//label[contains(normalize-space(.), {lit})]")),
        ElementQuery::Css(format!(r#"[placeholder*="{css}" i]"#)),
        ElementQuery::Css(format!(
            r#"[alt*="{css}" i], [title*="{css}" i], [aria-label*="{css}" i]"#
        )),
        ElementQuery::Css(format!(
            r#"[data-testid*="{slug}"], [data-test*="{slug}"]"#
        )),
        ElementQuery::Css(format!(r#"[id*="{slug}" i], [name*="{slug}" i]"#)),
        // Visible-text containers, then anything containing the text.
        ElementQuery::Xpath(format!(
            "//*[self::button or self::a or self::span or self::p or self::li or self::td \
             or self::th or self::label or self::legend][contains(normalize-space(.), {lit})]"
        )),
        ElementQuery::Xpath(format!("//*[contains(text(), {lit})]")),
    ];

    if click_like {
        queries.push(ElementQuery::Xpath(format!(
            "//*[contains(normalize-space(text()), {lit})]\
             /ancestor-or-self::*[self::button or self::a or @role='button' or @onclick][1]"
        )));
    }

    // Domain-agnostic hints, never site-specific.
    if ["image", "img", "photo", "picture", "logo", "icon"]
        .iter()
        .any(|w| lower.contains(w))
    {
        queries.push(ElementQuery::Css("img".to_string()));
    }
    if ["price", "cost", "total", "$"].iter().any(|w| lower.contains(w)) {
        queries.push(ElementQuery::Xpath(
            "//*[contains(text(), '$') or contains(text(), '€') or contains(text(), '£')]"
                .to_string(),
        ));
    }

    queries
}

/// Ranked candidates for resolving the input field of a `type` action.
fn input_field_candidates(field: &str) -> Vec<ElementQuery> {
    let f = field.trim();
    let lit = xpath_literal(f);
    let css = css_value(f);
    let slug = slug(f);

    vec![
        ElementQuery::Css(format!(
            r#"input[placeholder*="{css}" i], textarea[placeholder*="{css}" i]"#
        )),
        ElementQuery::Xpath(format!(
            "//label[contains(normalize-space(.), {lit})]/following::input[1] \
             | //label[contains(normalize-space(.), {lit})]/following::textarea[1]"
        )),
        ElementQuery::Xpath(format!(
            "//*[@role='textbox'][contains(@aria-label, {lit})] | //input[contains(@aria-label, {lit})]"
        )),
        ElementQuery::Css(format!(
            r#"input[data-testid*="{slug}"], input[data-test*="{slug}"], textarea[data-testid*="{slug}"]"#
        )),
        ElementQuery::Css(format!(
            r#"input[name*="{slug}" i], input[id*="{slug}" i], textarea[name*="{slug}" i], textarea[id*="{slug}" i]"#
        )),
        ElementQuery::Xpath(format!(
            "//*[contains(normalize-space(text()), {lit})]/following::input[1]"
        )),
        ElementQuery::Xpath(format!(
            "//*[@contenteditable='true'][contains(normalize-space(.), {lit})]"
        )),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Target;
    use std::time::Duration;

    struct HiddenElement;

    #[async_trait::async_trait]
    impl DomElement for HiddenElement {
        async fn is_visible(&self) -> DriverResult<bool> {
            Ok(false)
        }
        async fn click(&self, _force: bool) -> DriverResult<()> {
            Ok(())
        }
        async fn fill(&self, _text: &str) -> DriverResult<()> {
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

    /// One invisible "Login" element, reachable from the main document and
    /// from a reported sub-frame scope (as a flattened-search driver behaves).
    struct HiddenOnlyDriver;

    #[async_trait::async_trait]
    impl Driver for HiddenOnlyDriver {
        async fn current_url(&self) -> DriverResult<String> {
            Ok(String::new())
        }
        async fn page_html(&self) -> DriverResult<String> {
            Ok(String::new())
        }
        async fn container_html(&self, _css: &str) -> DriverResult<Option<String>> {
            Ok(None)
        }
        async fn find(
            &self,
            query: &ElementQuery,
            _scope: SearchScope,
        ) -> DriverResult<Vec<Box<dyn DomElement>>> {
            if query.as_str().contains("Login") {
                Ok(vec![Box::new(HiddenElement)])
            } else {
                Ok(Vec::new())
            }
        }
        async fn subframe_count(&self) -> DriverResult<usize> {
            Ok(1)
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

    #[tokio::test]
    async fn invisible_only_match_never_resolves_for_clicks() {
        let driver = HiddenOnlyDriver;
        let click = ExecutableAction::Click {
            target: Target::new("Login", SelectorKind::Text),
        };
        let resolution = resolve(&driver, &click).await.unwrap();
        assert!(
            !resolution.is_found(),
            "click must not act on an invisible element, in any frame"
        );

        // Input-field resolution may still settle for a not-yet-visible field.
        let typed = ExecutableAction::Type {
            target: Target::new("Login", SelectorKind::Text),
            text: "x".into(),
        };
        let resolution = resolve(&driver, &typed).await.unwrap();
        assert!(resolution.is_found());
    }

    #[test]
    fn xpath_literal_handles_quotes() {
        assert_eq!(xpath_literal("Login"), "'Login'");
        assert_eq!(xpath_literal("it's here"), "\"it's here\"");
        assert_eq!(
            xpath_literal(r#"say "it's""#),
            r#"concat('say "it', "'", 's"')"#
        );
    }

    #[test]
    fn slug_is_lowercase_hyphenated() {
        assert_eq!(slug("First Name"), "first-name");
        assert_eq!(slug("  Email  "), "email");
    }

    #[test]
    fn role_candidates_come_first_for_text() {
        let queries = text_candidates("Login", true);
        match &queries[0] {
            ElementQuery::Xpath(x) => assert!(x.contains("//button")),
            other => panic!("expected role xpath first, got {other:?}"),
        }
        // Clickable-ancestor fallback is present for click-like actions only.
        assert!(queries
            .iter()
            .any(|q| matches!(q, ElementQuery::Xpath(x) if x.contains("ancestor-or-self"))));
        let queries = text_candidates("Login", false);
        assert!(!queries
            .iter()
            .any(|q| matches!(q, ElementQuery::Xpath(x) if x.contains("ancestor-or-self"))));
    }

    #[test]
    fn image_and_price_hints_are_appended() {
        let queries = text_candidates("product image", false);
        assert!(queries.contains(&ElementQuery::Css("img".to_string())));

        let queries = text_candidates("the total price", false);
        assert!(queries
            .iter()
            .any(|q| matches!(q, ElementQuery::Xpath(x) if x.contains('€'))));
    }

    #[test]
    fn input_candidates_prefer_placeholder_then_label() {
        let queries = input_field_candidates("Email");
        assert!(matches!(&queries[0], ElementQuery::Css(c) if c.contains("placeholder")));
        assert!(matches!(&queries[1], ElementQuery::Xpath(x) if x.contains("//label")));
        assert!(queries
            .iter()
            .any(|q| matches!(q, ElementQuery::Xpath(x) if x.contains("contenteditable"))));
    }
}

//! Action data model: the untrusted raw record coming back from the model and
//! the closed tagged union the engine actually executes.

use serde::{Deserialize, Serialize};

/// Interpretation strategy for a selector string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorKind {
    Css,
    Xpath,
    Text,
    None,
}

impl SelectorKind {
    /// Infer the kind from the selector's surface syntax.
    ///
    /// Total and deterministic: empty strings map to `None`, `xpath=`/`//`
    /// prefixes to `Xpath`, CSS-looking prefixes to `Css`, everything else is
    /// treated as visible text.
    pub fn infer(selector: &str) -> Self {
        let s = selector.trim();
        if s.is_empty() {
            return SelectorKind::None;
        }
        if s.starts_with("xpath=") || s.starts_with("//") {
            return SelectorKind::Xpath;
        }
        if s.starts_with('.') || s.starts_with('#') || s.starts_with('[') || s.starts_with(':') {
            return SelectorKind::Css;
        }
        SelectorKind::Text
    }

    pub fn name(&self) -> &'static str {
        match self {
            SelectorKind::Css => "css",
            SelectorKind::Xpath => "xpath",
            SelectorKind::Text => "text",
            SelectorKind::None => "none",
        }
    }
}

/// One untrusted action record parsed from model output.
///
/// Unknown fields are rejected outright so conversational extras never slip
/// through as silently ignored data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RawAction {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector_type: Option<SelectorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl RawAction {
    /// Action kinds that legitimately carry no selector.
    pub fn is_selectorless_kind(action: &str) -> bool {
        matches!(
            action,
            "wait" | "reload" | "clearCache" | "waitForNavigation" | "waitForURL"
        )
    }
}

/// A resolvable target: selector string plus its interpretation strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub selector: String,
    pub kind: SelectorKind,
}

impl Target {
    pub fn new(selector: impl Into<String>, kind: SelectorKind) -> Self {
        Self {
            selector: selector.into(),
            kind,
        }
    }
}

/// A fully validated action, one variant per supported kind, each carrying
/// exactly the fields its dispatch needs.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutableAction {
    Click {
        target: Target,
    },
    Toggle {
        target: Target,
    },
    Type {
        target: Target,
        text: String,
    },
    Wait {
        seconds: u64,
    },
    Reload,
    ClearCache,
    WaitForVisible {
        target: Target,
        timeout_ms: Option<u64>,
    },
    WaitForHidden {
        target: Target,
        timeout_ms: Option<u64>,
    },
    AssertVisible {
        target: Target,
        timeout_ms: Option<u64>,
    },
    AssertNotVisible {
        target: Target,
    },
    WaitForNavigation {
        timeout_ms: Option<u64>,
    },
    WaitForUrl {
        url: Option<String>,
        pattern: Option<String>,
        timeout_ms: Option<u64>,
    },
}

impl ExecutableAction {
    /// Canonical action tag, used for step logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ExecutableAction::Click { .. } => "click",
            ExecutableAction::Toggle { .. } => "toggle",
            ExecutableAction::Type { .. } => "type",
            ExecutableAction::Wait { .. } => "wait",
            ExecutableAction::Reload => "reload",
            ExecutableAction::ClearCache => "clearCache",
            ExecutableAction::WaitForVisible { .. } => "waitForVisible",
            ExecutableAction::WaitForHidden { .. } => "waitForHidden",
            ExecutableAction::AssertVisible { .. } => "assertVisible",
            ExecutableAction::AssertNotVisible { .. } => "assertNotVisible",
            ExecutableAction::WaitForNavigation { .. } => "waitForNavigation",
            ExecutableAction::WaitForUrl { .. } => "waitForURL",
        }
    }

    /// The target this action resolves against, if it has one.
    pub fn target(&self) -> Option<&Target> {
        match self {
            ExecutableAction::Click { target }
            | ExecutableAction::Toggle { target }
            | ExecutableAction::Type { target, .. }
            | ExecutableAction::WaitForVisible { target, .. }
            | ExecutableAction::WaitForHidden { target, .. }
            | ExecutableAction::AssertVisible { target, .. }
            | ExecutableAction::AssertNotVisible { target } => Some(target),
            _ => None,
        }
    }

    /// Text this action will type, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            ExecutableAction::Type { text, .. } => Some(text.as_str()),
            _ => None,
        }
    }
}

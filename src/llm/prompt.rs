//! Prompt assembly: fixed instructional preamble, the action-kind catalogue,
//! the remaining instruction, and the page excerpt.

/// Catalogue of allowed action JSON shapes, one per supported kind. The model
/// must return a JSON array of objects matching these shapes and nothing
/// else.
const ACTION_CATALOGUE: &str = r#"Allowed action shapes:
- {"action":"click","selector":"...","selectorType":"css|xpath|text"}
- {"action":"toggle","selector":"...","selectorType":"css|xpath|text"}
- {"action":"type","selector":"field name or selector","text":"literal text to type"}
- {"action":"wait","duration":2}
- {"action":"reload"}
- {"action":"clearCache"}
- {"action":"waitForVisible","selector":"...","timeout":5000}
- {"action":"waitForHidden","selector":"...","timeout":5000}
- {"action":"assertVisible","selector":"...","timeout":5000}
- {"action":"assertNotVisible","selector":"..."}
- {"action":"waitForNavigation","timeout":10000}
- {"action":"waitForURL","url":"https://...","pattern":"regex","timeout":10000}"#;

const PREAMBLE: &str = "You are given one browser-automation instruction and an excerpt of the \
current page markup. Translate the instruction into the minimal ordered list of actions that \
performs it against this page. Prefer text selectors (visible labels) over CSS unless the \
instruction names a CSS selector. 'selectorType' may be omitted; it is inferred. Timeouts are in \
milliseconds, wait durations in seconds.

Rules:
1. Respond with ONLY a JSON array of action objects. No prose, no markdown fences.
2. Use only the action shapes listed below; unknown fields are rejected.
3. Do not invent actions for parts of the instruction the page cannot satisfy.
4. Only plan for the instruction text given; do not add verification steps of your own.";

/// Build the full prompt for one planning round.
pub fn build_prompt(instruction: &str, page_excerpt: &str) -> String {
    format!(
        "{PREAMBLE}\n\n{ACTION_CATALOGUE}\n\nInstruction:\n{instruction}\n\nPage excerpt:\n{page_excerpt}\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_carries_instruction_catalogue_and_excerpt() {
        let prompt = build_prompt("click Login", "<button>Login</button>");
        assert!(prompt.contains("click Login"));
        assert!(prompt.contains("<button>Login</button>"));
        assert!(prompt.contains(r#""action":"assertVisible""#));
        assert!(prompt.contains("ONLY a JSON array"));
    }
}

//! Instruction text handling: canonicalizes assertion phrasing, strips vague
//! trailing clauses, pre-extracts literal `type` phrases, and removes the
//! fragment attributable to each executed action.
//!
//! Everything here is pure string rewriting; the instruction is only ever
//! shortened or cleared, never grown.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::pipeline::{ExecutableAction, SelectorKind};

/// A literal field/value pair lifted straight out of the instruction.
///
/// Executed without a model call so the exact quoted text is typed instead of
/// a model paraphrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedLiteral {
    pub field: String,
    pub value: String,
}

/// Instruction fragment the engine can execute without consulting the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InlineCommand {
    Wait { seconds: u64 },
    Reload,
    ClearCache,
}

static NEGATED_VISIBILITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:should\s+not|must\s+not|shouldn't|mustn't|do(?:es)?\s+not|don't|doesn't|is\s+not|are\s+not|isn't|aren't)\s+(?:be\s+)?(?:visible|displayed|shown|present)",
    )
    .expect("static regex")
});

static HIDDEN_PHRASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:is|are|should\s+be|must\s+be)\s+(?:hidden|invisible)").expect("static regex")
});

static POSITIVE_VISIBILITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:(?:should|must|will)\s+(?:be\s+)?|(?:is|are)\s+)(?:visible|displayed|shown|present)",
    )
    .expect("static regex")
});

/// Rewrite recognized visibility phrasings into the two canonical predicates
/// `are visible` / `are not visible`, case-insensitively.
pub fn normalize_assertion_phrases(instruction: &str) -> String {
    let step = NEGATED_VISIBILITY.replace_all(instruction, "are not visible");
    let step = HIDDEN_PHRASE.replace_all(&step, "are not visible");
    POSITIVE_VISIBILITY
        .replace_all(&step, "are visible")
        .into_owned()
}

static VAGUE_ENDINGS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        "verify everything looks good",
        "verify everything looks ok",
        "verify the page looks correct",
        "verify it works",
        "check the page is ok",
        "check everything works",
        "check that everything is fine",
        "make sure everything is fine",
        "make sure it looks good",
        "confirm it looks right",
    ]
    .iter()
    .map(|phrase| {
        let words = phrase.replace(' ', r"\s+");
        Regex::new(&format!(
            r"(?i)[\s,;.]*(?:\b(?:and|then)\s+)?{words}[\s.!]*$"
        ))
        .expect("static regex")
    })
    .collect()
});

static ONLY_PUNCTUATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^[\s.,;:!?'"-]*$"#).expect("static regex"));

static PUNCTUATION_RUNS: Lazy<[(Regex, &'static str); 4]> = Lazy::new(|| {
    [
        (Regex::new("\"{2,}").expect("static regex"), "\""),
        (Regex::new("'{2,}").expect("static regex"), "'"),
        (Regex::new(",{2,}").expect("static regex"), ","),
        (Regex::new(r"\.{2,}").expect("static regex"), "."),
    ]
});

/// Remove trailing vague-verification phrases and collapse the punctuation
/// they leave behind. Idempotent.
pub fn strip_vague(instruction: &str) -> String {
    let mut current = instruction.to_string();
    loop {
        let mut changed = false;
        for ending in VAGUE_ENDINGS.iter() {
            let next = ending.replace(&current, "").into_owned();
            if next != current {
                current = next;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Runs collapse whole, so an ellipsis comes out as one dot rather than
    // shrinking by a character per pass.
    for (run, single) in PUNCTUATION_RUNS.iter() {
        current = run.replace_all(&current, *single).into_owned();
    }
    let mut cleaned = current.trim().to_string();

    if ONLY_PUNCTUATION.is_match(&cleaned) {
        cleaned.clear();
    }
    cleaned
}

static TYPE_INTO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(?:type|enter)\s+['"]([^'"]+)['"]\s+(?:in|into)\s+(?:the\s+)?['"]?([A-Za-z0-9 _-]+?)['"]?(?:\s+field)?\s*(?:[.,;]|\bthen\b|\band\b|$)"#,
    )
    .expect("static regex")
});

static SET_TO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\bset\s+(?:the\s+)?['"]?([A-Za-z0-9 _-]+?)['"]?\s+to\s+['"]([^'"]+)['"]"#,
    )
    .expect("static regex")
});

static FILL_WITH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\bfill\s+(?:the\s+)?['"]?([A-Za-z0-9 _-]+?)['"]?\s+with\s+['"]([^'"]+)['"]"#,
    )
    .expect("static regex")
});

/// Scan the instruction for literal typing phrases.
///
/// The instruction itself is left untouched; the caller strips each phrase via
/// [`strip_literal_phrase`] once the corresponding fill has executed.
pub fn pre_extract_type_actions(instruction: &str) -> Vec<TypedLiteral> {
    let mut literals = Vec::new();

    for caps in TYPE_INTO.captures_iter(instruction) {
        literals.push(TypedLiteral {
            value: caps[1].trim().to_string(),
            field: caps[2].trim().to_string(),
        });
    }
    for caps in SET_TO.captures_iter(instruction) {
        literals.push(TypedLiteral {
            field: caps[1].trim().to_string(),
            value: caps[2].trim().to_string(),
        });
    }
    for caps in FILL_WITH.captures_iter(instruction) {
        literals.push(TypedLiteral {
            field: caps[1].trim().to_string(),
            value: caps[2].trim().to_string(),
        });
    }

    literals
}

/// Remove the literal typing phrase for `field` from the instruction.
///
/// The phrase may contain delimiters inside its quoted value (an email
/// address, say), so deletion is by matched span rather than the generic
/// delimiter consumption in [`consume_processed`].
pub fn strip_literal_phrase(instruction: &str, field: &str) -> String {
    for (re, field_group) in [(&*TYPE_INTO, 2usize), (&*SET_TO, 1), (&*FILL_WITH, 1)] {
        for caps in re.captures_iter(instruction) {
            if caps[field_group].trim().eq_ignore_ascii_case(field) {
                let Some(whole) = caps.get(0) else { continue };
                let mut out = String::with_capacity(instruction.len());
                out.push_str(&instruction[..whole.start()]);
                out.push_str(&instruction[whole.end()..]);
                return tidy_connectives(&out);
            }
        }
    }
    instruction.to_string()
}

static LEADING_CONNECTIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[\s.,;]*(?:\b(?:then|and)\b\s+)?").expect("static regex"));

static DOUBLED_CONNECTIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:and\s+and|then\s+then)\b").expect("static regex"));

static MULTI_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{2,}").expect("static regex"));

fn tidy_connectives(text: &str) -> String {
    let text = DOUBLED_CONNECTIVE.replace_all(text, "and");
    let text = LEADING_CONNECTIVE.replace(&text, "");
    let collapsed = MULTI_SPACE.replace_all(&text, " ").trim().to_string();
    if ONLY_PUNCTUATION.is_match(&collapsed) {
        String::new()
    } else {
        collapsed
    }
}

static DELIMITER_CONSUME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?si)^.*?(?:;|\.|,|\n|\bthen\b|\band\b)\s*").expect("static regex"));

static EMPTY_ASSERTION_HEAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^[\s.,;]*(?:\b(?:please|now|then|and)\b\s+)*(?:check|verify|confirm|ensure|assert)?(?:\s+that)?\s*(?:\bthe\b)?\s*(?:is|are)\s+(?:not\s+)?visible\s*[.,;]?\s*",
    )
    .expect("static regex")
});

/// Remove the instruction fragment attributable to an executed action.
///
/// Text-selector visibility assertions get surgical item deletion so sibling
/// items in a list survive; everything else consumes up to and including the
/// first delimiter.
pub fn consume_processed(instruction: &str, action: &ExecutableAction) -> String {
    if let ExecutableAction::AssertVisible { target, .. }
    | ExecutableAction::AssertNotVisible { target } = action
    {
        if target.kind == SelectorKind::Text {
            return consume_asserted_item(instruction, &target.selector);
        }
    }

    match DELIMITER_CONSUME.find(instruction) {
        Some(m) => instruction[m.end()..].trim_start().to_string(),
        None => String::new(),
    }
}

/// Delete the mention of one asserted item, keeping the rest of the list and
/// its visibility predicate intact until the last item goes.
fn consume_asserted_item(instruction: &str, item: &str) -> String {
    let item_pattern = format!(
        r#"(?i)(?:\band\s+)?['"]?{}['"]?\s*,?"#,
        regex::escape(item.trim())
    );
    let re = match Regex::new(&item_pattern) {
        Ok(re) => re,
        Err(_) => return instruction.to_string(),
    };

    let removed = re.replace(instruction, "").into_owned();
    if removed == instruction {
        // Item not mentioned verbatim; fall back to delimiter consumption.
        return match DELIMITER_CONSUME.find(instruction) {
            Some(m) => instruction[m.end()..].trim_start().to_string(),
            None => String::new(),
        };
    }

    let cleaned = tidy_connectives(&removed);
    // Nothing left in front of the predicate means the whole assertion clause
    // is spent.
    let cleaned = EMPTY_ASSERTION_HEAD.replace(&cleaned, "").into_owned();
    let cleaned = cleaned.trim().to_string();
    if ONLY_PUNCTUATION.is_match(&cleaned) {
        String::new()
    } else {
        cleaned
    }
}

static INLINE_WAIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*wait\s+(?:for\s+)?(\d+)\s*(?:seconds?|secs?|s)\b[.,;]?\s*(?:\b(?:then|and)\b\s+)?")
        .expect("static regex")
});

static INLINE_RELOAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:reload|refresh)\s+(?:the\s+)?page\b[.,;]?\s*(?:\b(?:then|and)\b\s+)?")
        .expect("static regex")
});

static INLINE_CLEAR_CACHE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*clear\s+(?:the\s+)?(?:browser\s+)?cache\b[.,;]?\s*(?:\b(?:then|and)\b\s+)?",
    )
    .expect("static regex")
});

/// Recognize a wait/reload/clear-cache phrase at the head of the instruction.
///
/// Returns the command and the remaining instruction with the matched phrase
/// stripped. These bypass the model entirely.
pub fn match_inline_command(instruction: &str) -> Option<(InlineCommand, String)> {
    if let Some(caps) = INLINE_WAIT.captures(instruction) {
        let seconds: u64 = caps[1].parse().ok()?;
        let rest = instruction[caps.get(0)?.end()..].to_string();
        return Some((InlineCommand::Wait { seconds: seconds.max(1) }, rest));
    }
    if let Some(m) = INLINE_RELOAD.find(instruction) {
        return Some((InlineCommand::Reload, instruction[m.end()..].to_string()));
    }
    if let Some(m) = INLINE_CLEAR_CACHE.find(instruction) {
        return Some((InlineCommand::ClearCache, instruction[m.end()..].to_string()));
    }
    None
}

//! Run reporting: the append-only step log, model-call transcripts, and
//! aggregate token usage for one engine run.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
}

/// One executed (or attempted) action, in execution order.
#[derive(Debug, Clone, Serialize)]
pub struct StepLogEntry {
    pub order: usize,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One model exchange: what was asked, what came back, and what it cost.
#[derive(Debug, Clone, Serialize)]
pub struct LlmTranscript {
    pub order: usize,
    pub model: String,
    pub prompt: String,
    pub response_raw: String,
    pub duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, input: u64, output: u64) {
        self.input_tokens += input;
        self.output_tokens += output;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Append-only log of executed steps.
#[derive(Debug, Default)]
pub struct StepLog {
    entries: Vec<StepLogEntry>,
}

impl StepLog {
    pub fn append(
        &mut self,
        action: &str,
        selector: Option<&str>,
        selector_type: Option<&str>,
        text: Option<&str>,
        status: StepStatus,
        error: Option<String>,
    ) {
        self.entries.push(StepLogEntry {
            order: self.entries.len() + 1,
            action: action.to_string(),
            selector: selector.map(str::to_string),
            selector_type: selector_type.map(str::to_string),
            text: text.map(str::to_string),
            status,
            error,
            timestamp: Utc::now(),
        });
    }

    pub fn entries(&self) -> &[StepLogEntry] {
        &self.entries
    }

    pub fn count_with(&self, status: StepStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    /// Render the log as a small standalone HTML table.
    pub fn render_html(&self) -> String {
        let mut out = String::from(
            "<table border=\"1\" cellpadding=\"4\" cellspacing=\"0\">\
             <tr><th>#</th><th>Action</th><th>Selector</th><th>Text</th>\
             <th>Status</th><th>Error</th><th>At (UTC)</th></tr>",
        );
        for entry in &self.entries {
            let status = match entry.status {
                StepStatus::Passed => "passed",
                StepStatus::Failed => "failed",
                StepStatus::Skipped => "skipped",
            };
            out.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td>\
                 <td class=\"{status}\">{status}</td><td>{}</td><td>{}</td></tr>",
                entry.order,
                escape(&entry.action),
                escape(entry.selector.as_deref().unwrap_or("")),
                escape(entry.text.as_deref().unwrap_or("")),
                escape(entry.error.as_deref().unwrap_or("")),
                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            ));
        }
        out.push_str("</table>");
        out
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Everything a finished run reports back to the caller.
#[derive(Debug, Default)]
pub struct RunReport {
    pub steps: StepLog,
    pub transcripts: Vec<LlmTranscript>,
    pub rounds: u32,
    pub usage: TokenUsage,
}

impl RunReport {
    pub fn record_transcript(
        &mut self,
        model: &str,
        prompt: &str,
        response_raw: &str,
        duration_ms: u64,
        input_tokens: u64,
        output_tokens: u64,
    ) {
        self.usage.add(input_tokens, output_tokens);
        self.transcripts.push(LlmTranscript {
            order: self.transcripts.len() + 1,
            model: model.to_string(),
            prompt: prompt.to_string(),
            response_raw: response_raw.to_string(),
            duration_ms,
            input_tokens,
            output_tokens,
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_log_orders_and_counts() {
        let mut log = StepLog::default();
        log.append("click", Some("Login"), Some("text"), None, StepStatus::Passed, None);
        log.append(
            "assertVisible",
            Some("#banner"),
            Some("css"),
            None,
            StepStatus::Skipped,
            Some("not found".into()),
        );
        assert_eq!(log.entries()[0].order, 1);
        assert_eq!(log.entries()[1].order, 2);
        assert_eq!(log.count_with(StepStatus::Passed), 1);
        assert_eq!(log.count_with(StepStatus::Skipped), 1);
        assert_eq!(log.count_with(StepStatus::Failed), 0);
    }

    #[test]
    fn html_render_escapes_markup() {
        let mut log = StepLog::default();
        log.append("click", Some("<button>"), Some("text"), None, StepStatus::Failed, None);
        let html = log.render_html();
        assert!(html.contains("&lt;button&gt;"));
        assert!(!html.contains("<button>"));
        assert!(html.contains("class=\"failed\""));
    }

    #[test]
    fn report_accumulates_usage() {
        let mut report = RunReport::default();
        report.record_transcript("m1", "p", "r", 12, 100, 20);
        report.record_transcript("m2", "p2", "r2", 9, 50, 10);
        assert_eq!(report.usage.input_tokens, 150);
        assert_eq!(report.usage.output_tokens, 30);
        assert_eq!(report.usage.total(), 180);
        assert_eq!(report.transcripts[1].order, 2);
    }
}

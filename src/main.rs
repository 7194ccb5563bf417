// CLI entry point: run one natural-language instruction against a URL.
//
//   pagepilot "<instruction>" <url>
//
// Credentials come from OPENAI_API_KEY / ANTHROPIC_API_KEY; optional settings
// from config.yaml next to the manifest. Set PAGEPILOT_REPORT_HTML to a path
// to also write the step log as an HTML table.

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pagepilot::report::StepStatus;
use pagepilot::{launch_browser, load_yaml_config, CdpDriver, Engine, LlmGateway};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let (instruction, url) = match (args.next(), args.next()) {
        (Some(instruction), Some(url)) => (instruction, url),
        _ => bail!("usage: pagepilot \"<instruction>\" <url>"),
    };

    let config = load_yaml_config()?;
    let gateway = LlmGateway::from_env_with(&config.llm);
    if gateway.is_empty() {
        warn!("no model credentials found; only literal and inline commands will run");
    }

    let handle = launch_browser(
        config.browser.headless,
        config.browser.window.width,
        config.browser.window.height,
    )
    .await?;
    let page = handle
        .browser
        .new_page(url.as_str())
        .await
        .context("opening page")?;
    page.wait_for_navigation().await.context("initial load")?;

    let driver = CdpDriver::new(page);
    let mut engine = Engine::new(Box::new(driver), gateway, config.engine_config());

    let report = engine.run(&instruction).await?;

    for entry in report.steps.entries() {
        let status = match entry.status {
            StepStatus::Passed => "PASS",
            StepStatus::Failed => "FAIL",
            StepStatus::Skipped => "SKIP",
        };
        println!(
            "{:>3}. [{status}] {} {}{}",
            entry.order,
            entry.action,
            entry.selector.as_deref().unwrap_or("-"),
            entry
                .error
                .as_deref()
                .map(|e| format!("  ({e})"))
                .unwrap_or_default(),
        );
    }
    info!(
        rounds = report.rounds,
        model_calls = report.transcripts.len(),
        tokens = report.usage.total(),
        "run finished"
    );

    if let Ok(path) = std::env::var("PAGEPILOT_REPORT_HTML") {
        std::fs::write(&path, report.steps.render_html())
            .with_context(|| format!("writing report to {path}"))?;
        info!(%path, "report written");
    }

    Ok(())
}

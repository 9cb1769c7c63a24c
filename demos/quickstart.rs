use anyhow::Result;
use deskpilot::agent::AutoAcknowledge;
use deskpilot::{
    Agent, AgentConfig, Browser, BrowserConfig, DiskScreenshotStore, JsonFileRecorder, ResponsesClient,
    ResponsesConfig, StdinOperator, Termination,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let task = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let task = if task.trim().is_empty() {
        "Search for 'rust async book' and open the first result.".to_string()
    } else {
        task
    };

    let browser_cfg = BrowserConfig { headless: flag("HEADLESS"), ..Default::default() };
    let browser = match std::env::var("CHROME_WS_URL") {
        Ok(ws) if !ws.trim().is_empty() => Browser::connect(&ws, browser_cfg.viewport).await?,
        _ => Browser::launch(browser_cfg).await?,
    };
    if let Ok(url) = std::env::var("START_URL") {
        browser.goto(&url).await?;
    }

    // the page viewport is the display; the browser is both screen and input
    let browser = Arc::new(browser);
    let cfg = AgentConfig { display: browser.viewport(), ..Default::default() };

    let client = ResponsesClient::new(ResponsesConfig::default())?;
    let sessions_dir = std::env::var("SESSIONS_DIR").map(PathBuf::from).unwrap_or_else(|_| "sessions".into());
    let recorder = JsonFileRecorder::new(&sessions_dir);

    let mut agent = Agent::new(browser.clone(), client, browser, recorder, cfg)
        .with_screenshot_store(Arc::new(DiskScreenshotStore::new(&sessions_dir)));
    if flag("AUTO_ACK") {
        agent = agent.with_safety_policy(Arc::new(AutoAcknowledge));
    }
    if flag("INTERACTIVE") {
        agent = agent.with_operator(Arc::new(StdinOperator::new()));
    }

    let stop = agent.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });

    let report = agent.run(&task).await?;
    let s = &report.summary;
    info!(
        session = %report.session_id,
        state = report.termination.label(),
        total = s.total,
        succeeded = s.succeeded,
        failed = s.failed,
        corrections = s.corrections,
        "run finished"
    );
    match &report.termination {
        Termination::Completed { summary } => println!("Completed: {}", summary),
        Termination::Aborted { reason } => println!("Aborted: {}", reason),
        Termination::MaxIterationsReached => println!("Stopped after {} iterations", report.iterations),
    }
    Ok(())
}

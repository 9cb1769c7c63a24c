use anyhow::{bail, Context, Result};
use deskpilot::analyze::{export_learnings, latest_session, summarize_dir, SessionAnalyzer, SessionReport};
use deskpilot::session::load_session;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

// Usage: review [--all] [--export] [session.json]
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let sessions_dir = std::env::var("SESSIONS_DIR").map(PathBuf::from).unwrap_or_else(|_| "sessions".into());
    let mut all = false;
    let mut export = false;
    let mut target: Option<PathBuf> = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--all" => all = true,
            "--export" => export = true,
            a if a.starts_with("--") => bail!("unknown flag {}", a),
            a => target = Some(PathBuf::from(a)),
        }
    }

    if all {
        let s = summarize_dir(&sessions_dir).await?;
        println!("Sessions: {}", s.sessions);
        println!("Total actions: {}", s.total);
        println!("Successful: {}", s.succeeded);
        println!("Corrections: {}", s.corrections);
        println!("Success rate: {:.1}%", s.success_rate * 100.0);
        return Ok(());
    }

    let path = match target {
        Some(p) => p,
        None => latest_session(&sessions_dir)
            .await?
            .with_context(|| format!("no sessions in {}", sessions_dir.display()))?,
    };
    let session = load_session(&path).await.with_context(|| format!("reading {}", path.display()))?;
    let report = SessionAnalyzer::default().analyze(&session);
    print_report(&path, &report);

    if export {
        let out = export_learnings(&report, &sessions_dir).await?;
        println!("\nLearnings exported to {}", out.display());
    }
    Ok(())
}

fn print_report(path: &Path, r: &SessionReport) {
    println!("Session {} ({})", r.session_id, path.display());
    if let Some(t) = &r.termination {
        println!("Ended: {}", t.label());
    }
    if let Some(d) = r.duration_secs {
        println!("Duration: {}s", d);
    }
    println!("Actions: {}  success rate: {:.1}%", r.total, r.success_rate * 100.0);

    if !r.corrections.is_empty() {
        println!("\nCorrections:");
        for c in &r.corrections {
            println!("  [{}] {} -> {}", c.iteration, c.user_input.lines().next().unwrap_or(""), c.correction);
        }
    }
    if !r.failures.is_empty() {
        println!("\nFailures:");
        for f in &r.failures {
            println!("  [{}] {}", f.iteration, f.error);
        }
    }
    if !r.skipped.is_empty() {
        println!("\nSkipped:");
        for k in &r.skipped {
            println!("  [{}] {}", k.iteration, k.reason);
        }
    }
    if !r.successful_patterns.is_empty() {
        println!("\nWhat worked:");
        for p in &r.successful_patterns {
            println!("  [{}] {} -> {}", p.iteration, p.intent, p.action);
        }
    }
    if !r.coordinate_corrections.is_empty() {
        println!("\nCorrected coordinates:");
        for c in &r.coordinate_corrections {
            let (x, y) = c.proposed;
            println!("  {} proposed ({}, {}): {}", c.element, x, y, c.note.as_deref().unwrap_or("-"));
        }
    }
    if r.needs_review || !r.suggestions.is_empty() {
        println!("\nSuggestions:");
        for s in &r.suggestions {
            println!("  - {}", s);
        }
    }
}

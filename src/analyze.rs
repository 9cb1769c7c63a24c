//! Read-side review of recorded sessions.
//!
//! Nothing here mutates a session; reports are derived from the turns and
//! summary exactly as they were written.

use crate::action::{Action, ActionKind, Proposed};
use crate::session::{load_session, OperatorVerdict, Session, SessionError, Termination, Turn};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs as async_fs;
use tracing::warn;

pub const DEFAULT_REVIEW_THRESHOLD: f64 = 0.7;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub iteration: u32,
    pub user_input: String,
    pub proposed: Option<Proposed>,
    pub correction: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub iteration: u32,
    pub user_input: String,
    pub action: Option<Action>,
    pub error: String,
}

/// A turn that dispatched nothing and carries an error: a nudge or a safety block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Skipped {
    pub iteration: u32,
    pub reason: String,
}

/// An action that worked, keyed by what the model said it was doing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuccessfulPattern {
    pub iteration: u32,
    pub intent: String,
    pub action: Action,
}

/// A coordinate that worked, keyed by the element it was aimed at.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoordinateHint {
    pub element: String,
    pub x: i32,
    pub y: i32,
    pub action_type: String,
}

/// A point the operator corrected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoordinateCorrection {
    pub iteration: u32,
    pub element: String,
    pub proposed: (i32, i32),
    pub note: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PromptSuggestion {
    CoordinateHint {
        element: String,
        proposed_wrong: (i32, i32),
        user_note: Option<String>,
    },
}

impl From<&CoordinateCorrection> for PromptSuggestion {
    fn from(c: &CoordinateCorrection) -> Self {
        PromptSuggestion::CoordinateHint {
            element: c.element.clone(),
            proposed_wrong: c.proposed,
            user_note: c.note.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    pub duration_secs: Option<i64>,
    pub termination: Option<Termination>,
    pub total: u32,
    /// succeeded / total, 0.0 when there are no turns.
    pub success_rate: f64,
    pub corrections: Vec<Correction>,
    pub failures: Vec<Failure>,
    pub skipped: Vec<Skipped>,
    pub successful_patterns: Vec<SuccessfulPattern>,
    pub coordinate_hints: Vec<CoordinateHint>,
    pub coordinate_corrections: Vec<CoordinateCorrection>,
    pub needs_review: bool,
    pub suggestions: Vec<String>,
}

pub struct SessionAnalyzer {
    threshold: f64,
}

impl Default for SessionAnalyzer {
    fn default() -> Self {
        Self { threshold: DEFAULT_REVIEW_THRESHOLD }
    }
}

impl SessionAnalyzer {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn analyze(&self, session: &Session) -> SessionReport {
        let summary = &session.summary;
        let success_rate = if summary.total == 0 {
            0.0
        } else {
            summary.succeeded as f64 / summary.total as f64
        };

        let mut corrections = Vec::new();
        let mut failures = Vec::new();
        let mut skipped = Vec::new();
        let mut successful_patterns = Vec::new();
        let mut coordinate_corrections = Vec::new();

        for turn in &session.turns {
            let intent = intent(turn);
            if let Some(c) = &turn.correction {
                corrections.push(Correction {
                    iteration: turn.iteration,
                    user_input: turn.user_input.clone(),
                    proposed: turn.selected.clone(),
                    correction: c.clone(),
                });
                if let Some(point) = turn.selected.as_ref().and_then(Proposed::action).and_then(Action::point) {
                    coordinate_corrections.push(CoordinateCorrection {
                        iteration: turn.iteration,
                        element: intent.clone(),
                        proposed: point,
                        note: operator_note(turn),
                    });
                }
            }

            match &turn.outcome {
                Some(o) if !o.ok => failures.push(Failure {
                    iteration: turn.iteration,
                    user_input: turn.user_input.clone(),
                    action: turn.executed_action().cloned(),
                    error: o.message.clone(),
                }),
                Some(_) => {
                    if let Some(action) = turn.executed_action().filter(|a| is_pattern(a)) {
                        successful_patterns.push(SuccessfulPattern {
                            iteration: turn.iteration,
                            intent,
                            action: action.clone(),
                        });
                    }
                }
                None => {
                    if let Some(reason) = &turn.error {
                        skipped.push(Skipped { iteration: turn.iteration, reason: reason.clone() });
                    }
                }
            }
        }

        let coordinate_hints: Vec<CoordinateHint> = successful_patterns
            .iter()
            .filter_map(|p| {
                p.action.point().map(|(x, y)| CoordinateHint {
                    element: p.intent.clone(),
                    x,
                    y,
                    action_type: p.action.kind().name().to_string(),
                })
            })
            .collect();

        let needs_review = success_rate < self.threshold;
        let mut suggestions = Vec::new();
        if !corrections.is_empty() {
            suggestions.push(format!(
                "Found {} user corrections - review for prompt updates",
                corrections.len()
            ));
        }
        if !coordinate_corrections.is_empty() {
            suggestions.push(
                "Coordinate accuracy issues detected - consider adding UI location hints to the system prompt"
                    .to_string(),
            );
        }
        if needs_review {
            suggestions.push("Low success rate - review failures for common patterns".to_string());
        }

        SessionReport {
            session_id: session.session_id.clone(),
            duration_secs: session.ended_at.map(|end| (end - session.started_at).num_seconds()),
            termination: session.termination.clone(),
            total: summary.total,
            success_rate,
            corrections,
            failures,
            skipped,
            successful_patterns,
            coordinate_hints,
            coordinate_corrections,
            needs_review,
            suggestions,
        }
    }
}

fn is_pattern(action: &Action) -> bool {
    !matches!(action.kind(), ActionKind::Wait | ActionKind::TaskComplete)
}

/// What the turn was aiming at: the model's own words, else the framing text.
fn intent(turn: &Turn) -> String {
    turn.free_text
        .as_deref()
        .and_then(|t| t.lines().map(str::trim).find(|l| !l.is_empty()))
        .unwrap_or(turn.user_input.as_str())
        .to_string()
}

fn operator_note(turn: &Turn) -> Option<String> {
    match &turn.operator {
        Some(OperatorVerdict::Rejected { note }) => note.clone(),
        _ => turn.correction.clone(),
    }
}

// ========================= Session directory =========================

/// Every `session_*.json` in `dir`, oldest name first.
pub async fn list_sessions(dir: &Path) -> Result<Vec<PathBuf>, SessionError> {
    let mut out = Vec::new();
    let mut entries = match async_fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("session_") && name.ends_with(".json") {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

/// The most recently written session. Files whose name is not a session id are ignored.
pub async fn latest_session(dir: &Path) -> Result<Option<PathBuf>, SessionError> {
    let mut latest: Option<(SystemTime, PathBuf)> = None;
    for path in list_sessions(dir).await? {
        if !has_session_id(&path) {
            continue;
        }
        let modified = async_fs::metadata(&path).await?.modified()?;
        // ties go to the later name
        if latest.as_ref().map_or(true, |(t, _)| modified >= *t) {
            latest = Some((modified, path));
        }
    }
    Ok(latest.map(|(_, p)| p))
}

fn has_session_id(path: &Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_prefix("session_"))
        .is_some_and(|id| NaiveDateTime::parse_from_str(id, "%Y%m%d_%H%M%S_%3f").is_ok())
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectorySummary {
    pub sessions: usize,
    pub total: u32,
    pub succeeded: u32,
    pub corrections: u32,
    pub success_rate: f64,
}

/// Totals across every readable session in `dir`. Unreadable files are skipped.
pub async fn summarize_dir(dir: &Path) -> Result<DirectorySummary, SessionError> {
    let mut out = DirectorySummary::default();
    for path in list_sessions(dir).await? {
        match load_session(&path).await {
            Ok(s) => {
                out.sessions += 1;
                out.total += s.summary.total;
                out.succeeded += s.summary.succeeded;
                out.corrections += s.summary.corrections;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable session"),
        }
    }
    if out.total > 0 {
        out.success_rate = out.succeeded as f64 / out.total as f64;
    }
    Ok(out)
}

// ========================= Learnings export =========================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Learnings {
    pub session_id: String,
    pub exported_at: String,
    pub success_rate: f64,
    pub successful_patterns: Vec<SuccessfulPattern>,
    pub coordinate_mappings: Vec<CoordinateHint>,
    pub user_corrections: Vec<Correction>,
    pub prompt_update_suggestions: Vec<PromptSuggestion>,
    pub suggested_improvements: Vec<String>,
}

impl From<&SessionReport> for Learnings {
    fn from(r: &SessionReport) -> Self {
        Self {
            session_id: r.session_id.clone(),
            exported_at: Local::now().to_rfc3339(),
            success_rate: r.success_rate,
            successful_patterns: r.successful_patterns.clone(),
            coordinate_mappings: r.coordinate_hints.clone(),
            user_corrections: r.corrections.clone(),
            prompt_update_suggestions: r.coordinate_corrections.iter().map(PromptSuggestion::from).collect(),
            suggested_improvements: r.suggestions.clone(),
        }
    }
}

pub async fn export_learnings(report: &SessionReport, dir: &Path) -> Result<PathBuf, SessionError> {
    async_fs::create_dir_all(dir).await?;
    let path = dir.join(format!("learnings_{}.json", report.session_id));
    let body = serde_json::to_vec_pretty(&Learnings::from(report))?;
    async_fs::write(&path, body).await?;
    Ok(path)
}

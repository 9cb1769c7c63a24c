use crate::action::{Action, Proposed, SafetyCheck};
use crate::dispatch::Outcome;
use crate::screen::{EncodedImage, ScreenshotRef};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session encoding error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("session not started")]
    NotStarted,
}

// ========================= Records =========================

/// How the operator handled a proposal in interactive mode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum OperatorVerdict {
    Approved,
    Rejected { note: Option<String> },
    Overridden { action: Action },
}

/// One loop iteration, frozen once logged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub iteration: u32,
    pub timestamp: DateTime<Local>,
    /// Framing text sent to the model with the screenshot.
    pub user_input: String,
    pub screenshot: Option<ScreenshotRef>,
    #[serde(default)]
    pub free_text: Option<String>,
    #[serde(default)]
    pub proposed: Vec<Proposed>,
    pub selected: Option<Proposed>,
    #[serde(default)]
    pub safety_checks: Vec<SafetyCheck>,
    #[serde(default)]
    pub acknowledged_safety_checks: Vec<SafetyCheck>,
    #[serde(default)]
    pub operator: Option<OperatorVerdict>,
    /// `None` when nothing was dispatched (nudge, blocked, rejected).
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub correction: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Turn {
    pub fn new(iteration: u32, user_input: impl Into<String>) -> Self {
        Self {
            iteration,
            timestamp: Local::now(),
            user_input: user_input.into(),
            screenshot: None,
            free_text: None,
            proposed: Vec::new(),
            selected: None,
            safety_checks: Vec::new(),
            acknowledged_safety_checks: Vec::new(),
            operator: None,
            outcome: None,
            correction: None,
            error: None,
        }
    }

    pub fn succeeded(&self) -> Option<bool> {
        self.outcome.as_ref().map(|o| o.ok)
    }

    /// The action that actually ran this turn, if any.
    pub fn executed_action(&self) -> Option<&Action> {
        match &self.operator {
            Some(OperatorVerdict::Overridden { action }) => Some(action),
            Some(OperatorVerdict::Rejected { .. }) => None,
            _ => self.selected.as_ref().and_then(Proposed::action),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub corrections: u32,
}

impl Summary {
    fn count(&mut self, turn: &Turn) {
        self.total += 1;
        match turn.succeeded() {
            Some(true) => self.succeeded += 1,
            Some(false) => self.failed += 1,
            None => {}
        }
        if turn.correction.is_some() {
            self.corrections += 1;
        }
    }
}

/// Why a run ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Termination {
    Completed { summary: String },
    Aborted { reason: String },
    MaxIterationsReached,
}

impl Termination {
    pub fn label(&self) -> &'static str {
        match self {
            Termination::Completed { .. } => "completed",
            Termination::Aborted { .. } => "aborted",
            Termination::MaxIterationsReached => "max_iterations_reached",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub started_at: DateTime<Local>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Local>>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub turns: Vec<Turn>,
    #[serde(default)]
    pub summary: Summary,
    #[serde(default)]
    pub termination: Option<Termination>,
    #[serde(default)]
    pub final_notes: Option<String>,
}

impl Session {
    pub fn new(task: Option<String>, model: Option<String>) -> Self {
        let started_at = Local::now();
        Self {
            session_id: started_at.format("%Y%m%d_%H%M%S_%3f").to_string(),
            started_at,
            ended_at: None,
            model,
            task,
            turns: Vec::new(),
            summary: Summary::default(),
            termination: None,
            final_notes: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Append a turn and update the counters. Ignored once finalized.
    pub fn push(&mut self, turn: Turn) -> bool {
        if self.is_finalized() {
            return false;
        }
        self.summary.count(&turn);
        self.turns.push(turn);
        true
    }

    pub fn finalize(&mut self, termination: Termination, notes: Option<String>) {
        if self.is_finalized() {
            return;
        }
        self.ended_at = Some(Local::now());
        self.termination = Some(termination);
        self.final_notes = notes;
    }

    pub fn file_name(&self) -> String {
        format!("session_{}.json", self.session_id)
    }
}

// ========================= Recorder =========================

#[async_trait]
pub trait SessionRecorder: Send + Sync {
    async fn start(&self, session: Session) -> Result<(), SessionError>;
    /// Durable before returning.
    async fn log(&self, turn: Turn) -> Result<Summary, SessionError>;
    async fn finalize(&self, termination: Termination, notes: Option<String>) -> Result<Session, SessionError>;
    async fn snapshot(&self) -> Option<Session>;
}

/// Keeps the session in memory only.
#[derive(Default)]
pub struct MemoryRecorder {
    session: Mutex<Option<Session>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRecorder for MemoryRecorder {
    async fn start(&self, session: Session) -> Result<(), SessionError> {
        *self.session.lock().await = Some(session);
        Ok(())
    }

    async fn log(&self, turn: Turn) -> Result<Summary, SessionError> {
        let mut guard = self.session.lock().await;
        let s = guard.as_mut().ok_or(SessionError::NotStarted)?;
        s.push(turn);
        Ok(s.summary.clone())
    }

    async fn finalize(&self, termination: Termination, notes: Option<String>) -> Result<Session, SessionError> {
        let mut guard = self.session.lock().await;
        let s = guard.as_mut().ok_or(SessionError::NotStarted)?;
        s.finalize(termination, notes);
        Ok(s.clone())
    }

    async fn snapshot(&self) -> Option<Session> {
        self.session.lock().await.clone()
    }
}

/// Writes `session_<id>.json` under `base_dir`, atomically replacing it on
/// every change so the file always parses.
pub struct JsonFileRecorder {
    base_dir: PathBuf,
    session: Mutex<Option<Session>>,
}

impl JsonFileRecorder {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base_dir: base.as_ref().to_path_buf(), session: Mutex::new(None) }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub async fn path(&self) -> Option<PathBuf> {
        self.session.lock().await.as_ref().map(|s| self.base_dir.join(s.file_name()))
    }

    async fn persist(&self, session: &Session) -> Result<(), SessionError> {
        async_fs::create_dir_all(&self.base_dir).await?;
        let path = self.base_dir.join(session.file_name());
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(session)?;
        let mut f = async_fs::File::create(&tmp).await?;
        f.write_all(&body).await?;
        f.sync_all().await?;
        drop(f);
        async_fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), turns = session.turns.len(), "session persisted");
        Ok(())
    }
}

#[async_trait]
impl SessionRecorder for JsonFileRecorder {
    async fn start(&self, session: Session) -> Result<(), SessionError> {
        let mut guard = self.session.lock().await;
        self.persist(&session).await?;
        info!("session logging to {}", self.base_dir.join(session.file_name()).display());
        *guard = Some(session);
        Ok(())
    }

    async fn log(&self, turn: Turn) -> Result<Summary, SessionError> {
        let mut guard = self.session.lock().await;
        let s = guard.as_mut().ok_or(SessionError::NotStarted)?;
        s.push(turn);
        self.persist(s).await?;
        Ok(s.summary.clone())
    }

    async fn finalize(&self, termination: Termination, notes: Option<String>) -> Result<Session, SessionError> {
        let mut guard = self.session.lock().await;
        let s = guard.as_mut().ok_or(SessionError::NotStarted)?;
        s.finalize(termination, notes);
        self.persist(s).await?;
        Ok(s.clone())
    }

    async fn snapshot(&self) -> Option<Session> {
        self.session.lock().await.clone()
    }
}

pub async fn load_session(path: &Path) -> Result<Session, SessionError> {
    let bytes = async_fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

// ========================= Screenshots =========================

#[async_trait]
pub trait ScreenshotStore: Send + Sync {
    async fn save(&self, session_id: &str, iteration: u32, image: &EncodedImage) -> Result<(), SessionError>;
}

pub struct DiskScreenshotStore {
    base_dir: PathBuf,
}

impl DiskScreenshotStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base_dir: base.as_ref().to_path_buf() }
    }
}

#[async_trait]
impl ScreenshotStore for DiskScreenshotStore {
    async fn save(&self, session_id: &str, iteration: u32, image: &EncodedImage) -> Result<(), SessionError> {
        let dir = self.base_dir.join(format!("session_{}", session_id));
        async_fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("step_{:03}.{}", iteration, image.format.extension()));
        async_fs::write(&path, &image.bytes).await?;
        Ok(())
    }
}

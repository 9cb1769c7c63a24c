use crate::action::{Action, ActionVocabulary, Proposed, SafetyCheck};
use crate::conversation::{Conversation, ImageAttachment, Message};
use crate::cua::{ModelClient, ModelError};
use crate::dispatch::{ActionDispatcher, ErrorKind, InputDriver, Outcome};
use crate::operator::{Decision, Operator};
use crate::screen::ScreenCapture;
use crate::session::{
    OperatorVerdict, ScreenshotStore, Session, SessionError, SessionRecorder, Summary, Termination, Turn,
};
use async_trait::async_trait;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a computer automation agent that controls the \
computer only through function calls. Each user turn carries a screenshot of the current screen. \
Respond with exactly one function call per turn. Coordinates are integer pixels from the top-left \
corner of the screenshot. When the task is finished, call task_complete with a short summary.";

pub const NUDGE_TEXT: &str =
    "No action was proposed. Respond with exactly one function call from the available actions.";

// ========================= Core Types =========================

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_iterations: u32,
    /// Pause after a turn so the UI can reflect the action before the next capture.
    pub settle_delay: Duration,
    pub display: (u32, u32),
    pub system_prompt: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let num = |key: &str, default: u32| {
            env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        };
        Self {
            max_iterations: num("MAX_ITERATIONS", 10),
            settle_delay: Duration::from_millis(150),
            display: (num("DISPLAY_WIDTH", 1920), num("DISPLAY_HEIGHT", 1080)),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    AwaitingCapture,
    AwaitingModelResponse,
    ActionSelected,
    Executing,
    Recording,
    Terminated,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("session recorder error: {0}")]
    Recorder(#[from] SessionError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

#[derive(Clone, Debug)]
pub struct RunReport {
    pub session_id: String,
    pub termination: Termination,
    pub iterations: u32,
    pub summary: Summary,
    pub session: Session,
}

/// Cooperative stop flag, checked between steps. An in-flight action always
/// finishes first.
#[derive(Clone, Debug, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ========================= Pluggable Subsystems =========================

#[async_trait]
pub trait SafetyPolicy: Send + Sync {
    /// Return the subset of `checks` acknowledged for `action`.
    async fn acknowledge(&self, checks: &[SafetyCheck], action: &Action) -> Vec<SafetyCheck>;
}

#[derive(Clone, Copy, Default)]
pub struct AutoAcknowledge;

#[async_trait]
impl SafetyPolicy for AutoAcknowledge {
    async fn acknowledge(&self, checks: &[SafetyCheck], action: &Action) -> Vec<SafetyCheck> {
        for c in checks {
            info!(check = %c, action = %action, "safety check auto-acknowledged");
        }
        checks.to_vec()
    }
}

#[derive(Clone, Copy, Default)]
pub struct NeverAcknowledge;

#[async_trait]
impl SafetyPolicy for NeverAcknowledge {
    async fn acknowledge(&self, _checks: &[SafetyCheck], _action: &Action) -> Vec<SafetyCheck> {
        Vec::new()
    }
}

// ========================= Agent Core =========================

enum Step {
    Continue,
    Stop(Termination),
}

/// Per-run mutable state threaded through iterations.
#[derive(Default)]
struct RunState {
    conversation: Conversation,
    pending: Option<PendingChecks>,
    last_result: Option<String>,
}

/// Checks that blocked an action. They gate only a re-proposal of that same action.
struct PendingChecks {
    action: Action,
    checks: Vec<SafetyCheck>,
}

pub struct Agent<S, M, I, R>
where
    S: ScreenCapture,
    M: ModelClient,
    I: InputDriver,
    R: SessionRecorder,
{
    screen: S,
    model: M,
    dispatcher: ActionDispatcher<I>,
    recorder: R,
    cfg: AgentConfig,
    vocabulary: ActionVocabulary,
    safety: Arc<dyn SafetyPolicy>,
    operator: Option<Arc<dyn Operator>>, // interactive mode when set
    screenshots: Option<Arc<dyn ScreenshotStore>>,
    stop: StopHandle,
    state: Mutex<LoopState>,
}

impl<S, M, I, R> Agent<S, M, I, R>
where
    S: ScreenCapture,
    M: ModelClient,
    I: InputDriver,
    R: SessionRecorder,
{
    pub fn new(screen: S, model: M, input: I, recorder: R, cfg: AgentConfig) -> Self {
        let dispatcher = ActionDispatcher::new(input, cfg.display.0, cfg.display.1);
        Self {
            screen,
            model,
            dispatcher,
            recorder,
            cfg,
            vocabulary: ActionVocabulary::standard(),
            safety: Arc::new(NeverAcknowledge),
            operator: None,
            screenshots: None,
            stop: StopHandle::default(),
            state: Mutex::new(LoopState::AwaitingCapture),
        }
    }

    pub fn with_safety_policy(mut self, policy: Arc<dyn SafetyPolicy>) -> Self {
        self.safety = policy;
        self
    }

    pub fn with_operator(mut self, operator: Arc<dyn Operator>) -> Self {
        self.operator = Some(operator);
        self
    }

    pub fn with_screenshot_store(mut self, store: Arc<dyn ScreenshotStore>) -> Self {
        self.screenshots = Some(store);
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> LoopState {
        self.state.lock().map(|s| *s).unwrap_or(LoopState::Terminated)
    }

    pub fn recorder(&self) -> &R {
        &self.recorder
    }

    pub fn dispatcher(&self) -> &ActionDispatcher<I> {
        &self.dispatcher
    }

    fn enter(&self, iteration: u32, next: LoopState) {
        if let Ok(mut s) = self.state.lock() {
            debug!(iteration, from = ?*s, to = ?next, "loop state");
            *s = next;
        }
    }

    pub async fn run(&self, task: &str) -> Result<RunReport, AgentError> {
        if self.cfg.max_iterations == 0 {
            return Err(AgentError::Config("max_iterations must be at least 1".into()));
        }
        let session = Session::new(Some(task.to_string()), Some(self.model.model_name().to_string()));
        let session_id = session.session_id.clone();
        self.recorder.start(session).await?;
        self.enter(0, LoopState::AwaitingCapture);
        info!(session = %session_id, max_iterations = self.cfg.max_iterations, "run started: {}", task);

        let mut run = RunState {
            conversation: Conversation::with_system(&self.cfg.system_prompt),
            ..Default::default()
        };
        let mut iterations = 0u32;

        let termination = loop {
            if self.stop.is_stopped() {
                break Termination::Aborted { reason: "stopped by caller".into() };
            }
            if iterations >= self.cfg.max_iterations {
                break Termination::MaxIterationsReached;
            }
            iterations += 1;
            match self.iterate(iterations, task, &session_id, &mut run).await? {
                Step::Stop(t) => break t,
                Step::Continue => {
                    if iterations < self.cfg.max_iterations && !self.cfg.settle_delay.is_zero() {
                        tokio::time::sleep(self.cfg.settle_delay).await;
                    }
                }
            }
        };

        self.finish(session_id, iterations, termination).await
    }

    async fn iterate(
        &self,
        iteration: u32,
        task: &str,
        session_id: &str,
        run: &mut RunState,
    ) -> Result<Step, AgentError> {
        self.enter(iteration, LoopState::AwaitingCapture);
        let framing = framing_text(
            iteration,
            task,
            run.last_result.as_deref(),
            run.pending.as_ref().map_or(&[][..], |p| &p.checks[..]),
        );
        let mut turn = Turn::new(iteration, framing.clone());

        // capture and frame
        let image = match self.screen.capture().await {
            Ok(img) => img,
            Err(e) => {
                warn!(iteration, error = %e, "capture failed, aborting run");
                turn.error = Some(e.to_string());
                turn.outcome = Some(Outcome::failure(ErrorKind::Capture, e.to_string()));
                self.record(iteration, turn).await?;
                return Ok(Step::Stop(Termination::Aborted { reason: e.to_string() }));
            }
        };
        if let Some(store) = &self.screenshots {
            if let Err(e) = store.save(session_id, iteration, &image).await {
                warn!(iteration, error = %e, "screenshot not saved");
            }
        }
        let attachment = ImageAttachment::new(image);
        turn.screenshot = Some(attachment.reference.clone());
        run.conversation.push(Message::User { text: framing, image: Some(attachment) });

        // ask the model
        self.enter(iteration, LoopState::AwaitingModelResponse);
        let proposal = match self.model.propose(&run.conversation, &self.vocabulary).await {
            Ok(p) => p,
            Err(e) => {
                warn!(iteration, error = %e, "model call failed, aborting run");
                let kind = match e {
                    ModelError::Protocol(_) => ErrorKind::Protocol,
                    ModelError::Transport(_) | ModelError::Config(_) => ErrorKind::Transport,
                };
                turn.error = Some(e.to_string());
                turn.outcome = Some(Outcome::failure(kind, e.to_string()));
                self.record(iteration, turn).await?;
                return Ok(Step::Stop(Termination::Aborted { reason: e.to_string() }));
            }
        };
        info!(
            iteration,
            proposals = proposal.actions.len(),
            safety_checks = proposal.safety_checks.len(),
            "model responded"
        );
        turn.free_text = proposal.free_text.clone();
        turn.proposed = proposal.actions.clone();
        if let Some(text) = &proposal.free_text {
            run.conversation.push(Message::Assistant { text: text.clone() });
        }

        if self.stop.is_stopped() {
            self.record(iteration, turn).await?;
            return Ok(Step::Stop(Termination::Aborted { reason: "stopped by caller".into() }));
        }

        // nothing to do: nudge and spend the iteration
        let Some(selected) = proposal.actions.first().cloned() else {
            info!(iteration, "no actionable proposal, nudging");
            run.conversation.push(Message::User { text: NUDGE_TEXT.to_string(), image: None });
            run.last_result = None;
            turn.error = Some("no actionable proposal".into());
            self.record(iteration, turn).await?;
            return Ok(Step::Continue);
        };
        if proposal.actions.len() > 1 {
            debug!(iteration, discarded = proposal.actions.len() - 1, "extra proposals discarded");
        }

        self.enter(iteration, LoopState::ActionSelected);
        turn.selected = Some(selected.clone());
        let arguments = match &selected {
            Proposed::Known { action, .. } => action.arguments(),
            Proposed::Unknown { arguments, .. } => arguments.clone(),
        };
        let call_id = selected.call_id().to_string();
        run.conversation.push(Message::ToolCall {
            call_id: call_id.clone(),
            name: selected.name().to_string(),
            arguments,
        });

        let action = match &selected {
            Proposed::Unknown { .. } => {
                let outcome = self.dispatcher.dispatch(&selected).await;
                self.feed_back(run, &call_id, outcome.message.clone(), Vec::new());
                turn.outcome = Some(outcome);
                self.record(iteration, turn).await?;
                return Ok(Step::Continue);
            }
            Proposed::Known { action, .. } => action.clone(),
        };

        // completion
        if let Action::TaskComplete { summary } = &action {
            info!(iteration, "task complete: {}", summary);
            let outcome = Outcome::success(format!("Complete: {}", summary));
            self.feed_back(run, &call_id, outcome.message.clone(), Vec::new());
            turn.outcome = Some(outcome);
            self.record(iteration, turn).await?;
            return Ok(Step::Stop(Termination::Completed { summary: summary.clone() }));
        }

        // safety checks; earlier pending ones only apply if the same action comes back
        let mut checks = match run.pending.take() {
            Some(p) if p.action == action => p.checks,
            Some(p) => {
                debug!(iteration, dropped = p.checks.len(), "different action proposed, pending checks dropped");
                Vec::new()
            }
            None => Vec::new(),
        };
        for c in &proposal.safety_checks {
            if !checks.iter().any(|p| p.id == c.id) {
                checks.push(c.clone());
            }
        }
        let mut acknowledged = Vec::new();
        if !checks.is_empty() {
            acknowledged = self.safety.acknowledge(&checks, &action).await;
            let outstanding: Vec<SafetyCheck> = checks
                .iter()
                .filter(|c| !acknowledged.iter().any(|a| a.id == c.id))
                .cloned()
                .collect();
            turn.safety_checks = checks;
            turn.acknowledged_safety_checks = acknowledged.clone();
            if !outstanding.is_empty() {
                warn!(iteration, pending = outstanding.len(), "action blocked by unacknowledged safety checks");
                let msg = format!(
                    "Action not executed: {} safety check(s) awaiting acknowledgement",
                    outstanding.len()
                );
                turn.error = Some(msg.clone());
                run.pending = Some(PendingChecks { action: action.clone(), checks: outstanding });
                self.feed_back(run, &call_id, msg, acknowledged);
                self.record(iteration, turn).await?;
                return Ok(Step::Continue);
            }
        }

        // interactive confirmation
        let mut to_run = action;
        let mut replaced: Option<String> = None;
        if let Some(op) = &self.operator {
            match op.review(iteration, &to_run, proposal.free_text.as_deref()).await {
                Decision::Approve => turn.operator = Some(OperatorVerdict::Approved),
                Decision::Reject { note } => {
                    info!(iteration, "operator rejected proposal");
                    let msg = match &note {
                        Some(n) => format!("Operator rejected this action: {}", n),
                        None => "Operator rejected this action".to_string(),
                    };
                    turn.correction = Some(note.clone().unwrap_or_else(|| "rejected".into()));
                    turn.operator = Some(OperatorVerdict::Rejected { note });
                    self.feed_back(run, &call_id, msg, acknowledged);
                    self.record(iteration, turn).await?;
                    return Ok(Step::Continue);
                }
                Decision::Override(replacement) => {
                    info!(iteration, action = %replacement, "operator override");
                    turn.correction = Some(format!("override: {}", replacement));
                    turn.operator = Some(OperatorVerdict::Overridden { action: replacement.clone() });
                    replaced = Some(to_run.to_string());
                    to_run = replacement;
                }
            }
        }

        // dispatch failures feed back and the loop continues
        self.enter(iteration, LoopState::Executing);
        let outcome = self.dispatcher.execute(&to_run).await;
        if !outcome.ok {
            warn!(iteration, message = %outcome.message, "dispatch failed");
        }
        let result = match &replaced {
            Some(original) => format!(
                "Operator replaced your {} with {}. {}",
                original, to_run, outcome.message
            ),
            None => outcome.message.clone(),
        };
        self.feed_back(run, &call_id, result, acknowledged);
        turn.outcome = Some(outcome);

        // record
        self.record(iteration, turn).await?;

        if self.stop.is_stopped() {
            return Ok(Step::Stop(Termination::Aborted { reason: "stopped by caller".into() }));
        }
        Ok(Step::Continue)
    }

    fn feed_back(&self, run: &mut RunState, call_id: &str, output: String, acknowledged: Vec<SafetyCheck>) {
        run.last_result = Some(output.clone());
        run.conversation.push(Message::ToolResult {
            call_id: call_id.to_string(),
            output,
            acknowledged_safety_checks: acknowledged,
        });
    }

    async fn record(&self, iteration: u32, turn: Turn) -> Result<(), AgentError> {
        self.enter(iteration, LoopState::Recording);
        let summary = self.recorder.log(turn).await?;
        debug!(iteration, total = summary.total, succeeded = summary.succeeded, failed = summary.failed, "turn recorded");
        Ok(())
    }

    async fn finish(&self, session_id: String, iterations: u32, termination: Termination) -> Result<RunReport, AgentError> {
        self.enter(iterations, LoopState::Terminated);
        let notes = match &termination {
            Termination::Completed { .. } => "Goal met".to_string(),
            Termination::Aborted { reason } => format!("Aborted: {}", reason),
            Termination::MaxIterationsReached => "Iteration budget exhausted".to_string(),
        };
        let session = self.recorder.finalize(termination.clone(), Some(notes)).await?;
        info!(
            session = %session_id,
            state = termination.label(),
            iterations,
            total = session.summary.total,
            "run finished"
        );
        Ok(RunReport {
            session_id,
            termination,
            iterations,
            summary: session.summary.clone(),
            session,
        })
    }
}

/// Text sent alongside each screenshot.
pub fn framing_text(iteration: u32, task: &str, last_result: Option<&str>, pending: &[SafetyCheck]) -> String {
    let mut s = if iteration <= 1 {
        format!("Task: {}\n\nThis is the current screen. Choose the next action.", task)
    } else {
        match last_result {
            Some(r) => format!("Done: {}. This is the current screen. Next action?", r),
            None => "This is the current screen. Next action?".to_string(),
        }
    };
    if !pending.is_empty() {
        s.push_str("\n\nSafety checks still pending acknowledgement:");
        for c in pending {
            s.push_str("\n- ");
            s.push_str(&c.to_string());
        }
    }
    s
}

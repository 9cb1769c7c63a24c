use async_trait::async_trait;
use deskpilot::agent::{framing_text, NUDGE_TEXT};
use deskpilot::conversation::Message;
use deskpilot::session::OperatorVerdict;
use deskpilot::{
    Action, ActionVocabulary, Agent, AgentConfig, AgentError, AutoAcknowledge, CaptureError, Conversation,
    Decision, EncodedImage, ErrorKind, ImageFormat, InputDriver, InputError, LoopState, MemoryRecorder,
    ModelClient, ModelError, MouseButton, Operator, Proposal, Proposed, SafetyCheck, ScreenCapture, SessionAnalyzer,
    StopHandle, Termination,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ===== Fakes =====

struct FixedScreen {
    fail: bool,
}

#[async_trait]
impl ScreenCapture for FixedScreen {
    async fn capture(&self) -> Result<EncodedImage, CaptureError> {
        if self.fail {
            return Err(CaptureError("display gone".into()));
        }
        Ok(EncodedImage { bytes: vec![0x89, b'P', b'N', b'G'], format: ImageFormat::Png, width: 1920, height: 1080 })
    }
}

#[derive(Default)]
struct ScriptedModel {
    replies: Mutex<VecDeque<Result<Proposal, ModelError>>>,
    seen: Arc<Mutex<Vec<Conversation>>>,
    stop_after_first: Arc<Mutex<Option<StopHandle>>>,
}

impl ScriptedModel {
    fn new(replies: Vec<Result<Proposal, ModelError>>) -> Self {
        Self { replies: Mutex::new(replies.into()), ..Default::default() }
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn propose(&self, conversation: &Conversation, _v: &ActionVocabulary) -> Result<Proposal, ModelError> {
        self.seen.lock().unwrap().push(conversation.clone());
        if let Some(stop) = self.stop_after_first.lock().unwrap().take() {
            stop.stop();
        }
        // an exhausted script keeps answering with nothing actionable
        self.replies.lock().unwrap().pop_front().unwrap_or_else(|| Ok(Proposal::default()))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

#[derive(Default)]
struct RecordingDriver {
    events: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl RecordingDriver {
    fn push(&self, ev: String) -> Result<(), InputError> {
        if self.fail {
            return Err(InputError("no input device".into()));
        }
        self.events.lock().unwrap().push(ev);
        Ok(())
    }
}

#[async_trait]
impl InputDriver for RecordingDriver {
    async fn move_to(&self, x: i32, y: i32) -> Result<(), InputError> {
        self.push(format!("move {} {}", x, y))
    }
    async fn click(&self, x: i32, y: i32, button: MouseButton, count: u32) -> Result<(), InputError> {
        self.push(format!("click {} {} {} x{}", x, y, button, count))
    }
    async fn scroll(&self, x: i32, y: i32, clicks: i32) -> Result<(), InputError> {
        self.push(format!("scroll {} {} {}", x, y, clicks))
    }
    async fn drag(&self, from: (i32, i32), to: (i32, i32)) -> Result<(), InputError> {
        self.push(format!("drag {:?} {:?}", from, to))
    }
    async fn type_text(&self, text: &str) -> Result<(), InputError> {
        self.push(format!("type {}", text))
    }
    async fn key_chord(&self, keys: &[String]) -> Result<(), InputError> {
        self.push(format!("keys {}", keys.join("+")))
    }
}

struct ScriptedOperator(Mutex<VecDeque<Decision>>);

#[async_trait]
impl Operator for ScriptedOperator {
    async fn review(&self, _i: u32, _a: &Action, _r: Option<&str>) -> Decision {
        self.0.lock().unwrap().pop_front().unwrap_or(Decision::Approve)
    }
}

// ===== Helpers =====

type TestAgent = Agent<FixedScreen, ScriptedModel, RecordingDriver, MemoryRecorder>;

fn cfg(max_iterations: u32) -> AgentConfig {
    AgentConfig {
        max_iterations,
        settle_delay: Duration::ZERO,
        display: (1920, 1080),
        system_prompt: "drive the desktop".into(),
    }
}

fn agent_with(model: ScriptedModel, driver: RecordingDriver, max_iterations: u32) -> TestAgent {
    Agent::new(FixedScreen { fail: false }, model, driver, MemoryRecorder::new(), cfg(max_iterations))
}

fn known(call_id: &str, action: Action) -> Proposed {
    Proposed::Known { call_id: call_id.into(), action }
}

fn click(x: i32, y: i32) -> Action {
    Action::Click { x, y, button: MouseButton::Left, click_count: 1 }
}

fn propose(actions: Vec<Proposed>) -> Result<Proposal, ModelError> {
    Ok(Proposal { actions, ..Default::default() })
}

fn done(summary: &str) -> Result<Proposal, ModelError> {
    propose(vec![known("done", Action::TaskComplete { summary: summary.into() })])
}

fn check(id: &str) -> SafetyCheck {
    SafetyCheck { id: id.into(), code: "sensitive_domain".into(), message: "Confirm before submitting".into() }
}

// ===== Termination =====

#[tokio::test]
async fn nudges_consume_the_budget() {
    let agent = agent_with(ScriptedModel::default(), RecordingDriver::default(), 4);
    let report = agent.run("open notepad").await.unwrap();

    assert_eq!(report.termination, Termination::MaxIterationsReached);
    assert_eq!(report.iterations, 4);
    assert_eq!(report.summary.total, 4);
    assert_eq!((report.summary.succeeded, report.summary.failed), (0, 0));
    assert!(report.session.turns.iter().all(|t| t.outcome.is_none()));
    assert_eq!(agent.state(), LoopState::Terminated);
}

#[tokio::test]
async fn nudge_is_appended_to_the_conversation() {
    let model = ScriptedModel::default();
    let seen = model.seen.clone();
    let agent = agent_with(model, RecordingDriver::default(), 2);
    agent.run("open notepad").await.unwrap();

    let seen = seen.lock().unwrap();
    let second = &seen[1];
    let nudged = second
        .messages()
        .iter()
        .any(|m| matches!(m, Message::User { text, image: None } if text == NUDGE_TEXT));
    assert!(nudged);
}

#[tokio::test]
async fn task_complete_stops_at_the_third_iteration() {
    let model = ScriptedModel::new(vec![
        propose(vec![known("c1", click(100, 100))]),
        propose(vec![known("c2", Action::TypeText { text: "hello".into() })]),
        done("note written"),
    ]);
    let driver = RecordingDriver::default();
    let events = driver.events.clone();
    let agent = agent_with(model, driver, 10);
    let report = agent.run("write a note").await.unwrap();

    assert_eq!(report.termination, Termination::Completed { summary: "note written".into() });
    assert_eq!(report.iterations, 3);
    assert_eq!(report.summary.total, 3);
    assert_eq!(report.summary.succeeded, 3);
    assert_eq!(*events.lock().unwrap(), vec!["click 100 100 left x1".to_string(), "type hello".to_string()]);
    assert_eq!(report.session.model.as_deref(), Some("scripted"));
    assert!(report.session.ended_at.is_some());
}

#[tokio::test]
async fn transport_error_on_first_iteration_aborts() {
    let model = ScriptedModel::new(vec![Err(ModelError::Transport("timed out".into()))]);
    let driver = RecordingDriver::default();
    let events = driver.events.clone();
    let agent = agent_with(model, driver, 10);
    let report = agent.run("anything").await.unwrap();

    assert!(matches!(report.termination, Termination::Aborted { .. }));
    assert_eq!(report.iterations, 1);
    assert_eq!(report.summary.total, 1);
    assert_eq!(report.summary.failed, 1);
    assert!(events.lock().unwrap().is_empty());
    let outcome = report.session.turns[0].outcome.clone().unwrap();
    assert_eq!(outcome.error, Some(ErrorKind::Transport));
}

#[tokio::test]
async fn protocol_error_is_recorded_as_such() {
    let model = ScriptedModel::new(vec![Err(ModelError::Protocol("bad json".into()))]);
    let agent = agent_with(model, RecordingDriver::default(), 3);
    let report = agent.run("anything").await.unwrap();

    let outcome = report.session.turns[0].outcome.clone().unwrap();
    assert_eq!(outcome.error, Some(ErrorKind::Protocol));
    assert_eq!(report.summary.failed, 1);
}

#[tokio::test]
async fn capture_failure_aborts() {
    let agent = Agent::new(
        FixedScreen { fail: true },
        ScriptedModel::default(),
        RecordingDriver::default(),
        MemoryRecorder::new(),
        cfg(5),
    );
    let report = agent.run("anything").await.unwrap();

    assert!(matches!(report.termination, Termination::Aborted { .. }));
    assert_eq!(report.summary.total, 1);
    assert_eq!(report.session.turns[0].outcome.as_ref().and_then(|o| o.error), Some(ErrorKind::Capture));
}

#[tokio::test]
async fn zero_budget_is_a_config_error() {
    let agent = agent_with(ScriptedModel::default(), RecordingDriver::default(), 0);
    assert!(matches!(agent.run("x").await, Err(AgentError::Config(_))));
}

// ===== Dispatch =====

#[tokio::test]
async fn out_of_bounds_click_is_clamped_and_succeeds() {
    let model = ScriptedModel::new(vec![propose(vec![known("c1", click(2500, -30))]), done("ok")]);
    let driver = RecordingDriver::default();
    let events = driver.events.clone();
    let agent = agent_with(model, driver, 5);
    let report = agent.run("click the corner").await.unwrap();

    assert_eq!(events.lock().unwrap()[0], "click 1919 0 left x1");
    let first = report.session.turns[0].outcome.clone().unwrap();
    assert!(first.ok);
    assert_eq!(report.summary.failed, 0);
}

#[tokio::test]
async fn only_the_first_proposal_runs() {
    let model = ScriptedModel::new(vec![
        propose(vec![
            known("a", click(10, 10)),
            known("b", Action::TypeText { text: "ignored".into() }),
        ]),
        done("ok"),
    ]);
    let driver = RecordingDriver::default();
    let events = driver.events.clone();
    let seen_model = model.seen.clone();
    let agent = agent_with(model, driver, 5);
    let report = agent.run("x").await.unwrap();

    assert_eq!(*events.lock().unwrap(), vec!["click 10 10 left x1".to_string()]);
    let turn = &report.session.turns[0];
    assert_eq!(turn.proposed.len(), 2);
    assert_eq!(turn.selected.as_ref().map(|p| p.call_id()), Some("a"));

    // only the selected call and its result are fed back
    let seen = seen_model.lock().unwrap();
    let calls: Vec<&str> = seen[1]
        .messages()
        .iter()
        .filter_map(|m| match m {
            Message::ToolCall { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(calls, vec!["a"]);
}

#[tokio::test]
async fn dispatch_failure_continues_the_loop() {
    let model = ScriptedModel::new(vec![propose(vec![known("c1", click(5, 5))]), done("gave up")]);
    let driver = RecordingDriver { fail: true, ..Default::default() };
    let agent = agent_with(model, driver, 5);
    let report = agent.run("x").await.unwrap();

    assert!(matches!(report.termination, Termination::Completed { .. }));
    assert_eq!(report.summary.total, 2);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.summary.succeeded, 1);
    let failed = report.session.turns[0].outcome.clone().unwrap();
    assert_eq!(failed.error, Some(ErrorKind::Input));
}

#[tokio::test]
async fn unknown_action_is_fed_back_not_raised() {
    let model = ScriptedModel::new(vec![
        propose(vec![Proposed::Unknown { call_id: "u".into(), kind: "teleport".into(), arguments: json!({"x": 1}) }]),
        done("ok"),
    ]);
    let seen = model.seen.clone();
    let agent = agent_with(model, RecordingDriver::default(), 5);
    let report = agent.run("x").await.unwrap();

    let outcome = report.session.turns[0].outcome.clone().unwrap();
    assert_eq!(outcome.error, Some(ErrorKind::UnknownAction));
    let seen = seen.lock().unwrap();
    let fed_back = seen[1].messages().iter().any(|m| {
        matches!(m, Message::ToolResult { call_id, output, .. } if call_id == "u" && output.contains("teleport"))
    });
    assert!(fed_back);
}

// ===== Safety checks =====

#[tokio::test]
async fn unacknowledged_checks_block_and_are_reoffered() {
    let model = ScriptedModel::new(vec![
        Ok(Proposal {
            actions: vec![known("c1", click(40, 40))],
            safety_checks: vec![check("sc_1")],
            ..Default::default()
        }),
        propose(vec![known("c2", click(40, 40))]),
    ]);
    let driver = RecordingDriver::default();
    let events = driver.events.clone();
    let agent = agent_with(model, driver, 2);
    let report = agent.run("submit the form").await.unwrap();

    assert!(events.lock().unwrap().is_empty());
    let second = &report.session.turns[1];
    assert_eq!(second.safety_checks, vec![check("sc_1")]);
    assert!(second.acknowledged_safety_checks.is_empty());
    assert!(second.user_input.contains("sc_1"));
}

#[tokio::test]
async fn blocked_checks_do_not_gate_a_different_action() {
    let model = ScriptedModel::new(vec![
        Ok(Proposal {
            actions: vec![known("c1", click(40, 40))],
            safety_checks: vec![check("sc_1")],
            ..Default::default()
        }),
        propose(vec![known("c2", Action::TypeText { text: "hello".into() })]),
        propose(vec![known("c3", click(40, 40))]),
    ]);
    let driver = RecordingDriver::default();
    let events = driver.events.clone();
    let agent = agent_with(model, driver, 3);
    let report = agent.run("submit the form").await.unwrap();

    assert_eq!(*events.lock().unwrap(), vec!["type hello".to_string(), "click 40 40 left x1".to_string()]);
    let turns = &report.session.turns;
    assert!(turns[0].outcome.is_none());
    // still reported to the model, but no longer gating
    assert!(turns[1].user_input.contains("sc_1"));
    assert!(turns[1].safety_checks.is_empty());
    assert!(turns[1].error.is_none());
    assert_eq!(report.summary.succeeded, 2);
}

#[tokio::test]
async fn acknowledged_checks_travel_with_the_result() {
    let model = ScriptedModel::new(vec![
        Ok(Proposal {
            actions: vec![known("c1", click(40, 40))],
            safety_checks: vec![check("sc_1")],
            ..Default::default()
        }),
        done("submitted"),
    ]);
    let seen = model.seen.clone();
    let driver = RecordingDriver::default();
    let events = driver.events.clone();
    let agent = agent_with(model, driver, 3).with_safety_policy(Arc::new(AutoAcknowledge));
    let report = agent.run("submit the form").await.unwrap();

    assert_eq!(events.lock().unwrap().len(), 1);
    assert_eq!(report.session.turns[0].acknowledged_safety_checks, vec![check("sc_1")]);
    let seen = seen.lock().unwrap();
    let acked = seen[1].messages().iter().any(|m| {
        matches!(m, Message::ToolResult { acknowledged_safety_checks, .. } if acknowledged_safety_checks.len() == 1)
    });
    assert!(acked);
}

// ===== Interactive mode =====

#[tokio::test]
async fn operator_reject_and_override_are_corrections() {
    let model = ScriptedModel::new(vec![
        propose(vec![known("c1", click(1, 1))]),
        propose(vec![known("c2", click(2, 2))]),
        done("ok"),
    ]);
    let driver = RecordingDriver::default();
    let events = driver.events.clone();
    let operator = ScriptedOperator(Mutex::new(
        vec![
            Decision::Reject { note: Some("wrong window".into()) },
            Decision::Override(Action::DoubleClick { x: 160, y: 677 }),
        ]
        .into(),
    ));
    let agent = agent_with(model, driver, 5).with_operator(Arc::new(operator));
    let report = agent.run("x").await.unwrap();

    assert_eq!(*events.lock().unwrap(), vec!["click 160 677 left x2".to_string()]);
    assert_eq!(report.summary.corrections, 2);
    let turns = &report.session.turns;
    assert_eq!(turns[0].operator, Some(OperatorVerdict::Rejected { note: Some("wrong window".into()) }));
    assert!(turns[0].outcome.is_none());
    assert_eq!(turns[1].executed_action(), Some(&Action::DoubleClick { x: 160, y: 677 }));
    assert_eq!(turns[2].operator, None);
}

#[tokio::test]
async fn override_result_names_the_substitution() {
    let model = ScriptedModel::new(vec![propose(vec![known("c1", click(1, 1))]), done("ok")]);
    let seen = model.seen.clone();
    let operator = ScriptedOperator(Mutex::new(vec![Decision::Override(Action::DoubleClick { x: 160, y: 677 })].into()));
    let agent = agent_with(model, RecordingDriver::default(), 3).with_operator(Arc::new(operator));
    agent.run("x").await.unwrap();

    let seen = seen.lock().unwrap();
    let output = seen[1]
        .messages()
        .iter()
        .find_map(|m| match m {
            Message::ToolResult { call_id, output, .. } if call_id == "c1" => Some(output.clone()),
            _ => None,
        })
        .unwrap();
    assert!(output.starts_with("Operator replaced your click left at (1, 1) x1 with double_click at (160, 677)."));
}

#[tokio::test]
async fn recorded_hints_name_what_the_model_aimed_at() {
    let model = ScriptedModel::new(vec![
        Ok(Proposal {
            actions: vec![known("c1", click(160, 677))],
            free_text: Some("Click the New Note button".into()),
            ..Default::default()
        }),
        done("note opened"),
    ]);
    let agent = agent_with(model, RecordingDriver::default(), 3);
    let report = agent.run("open a new note").await.unwrap();

    let review = SessionAnalyzer::default().analyze(&report.session);
    assert_eq!(review.coordinate_hints.len(), 1);
    let hint = &review.coordinate_hints[0];
    assert_eq!(hint.element, "Click the New Note button");
    assert_ne!(hint.element, report.session.turns[0].user_input);
    assert_eq!((hint.x, hint.y), (160, 677));
}

// ===== Stop =====

#[tokio::test]
async fn stop_handle_aborts_after_current_step() {
    let model = ScriptedModel::new(vec![propose(vec![known("c1", click(3, 3))])]);
    let stop_slot = model.stop_after_first.clone();
    let driver = RecordingDriver::default();
    let events = driver.events.clone();
    let agent = agent_with(model, driver, 10);
    *stop_slot.lock().unwrap() = Some(agent.stop_handle());
    let report = agent.run("x").await.unwrap();

    assert_eq!(report.termination, Termination::Aborted { reason: "stopped by caller".into() });
    assert_eq!(report.iterations, 1);
    assert!(events.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn settle_delay_only_between_iterations() {
    let mut c = cfg(3);
    c.settle_delay = Duration::from_millis(150);
    let agent = Agent::new(
        FixedScreen { fail: false },
        ScriptedModel::default(),
        RecordingDriver::default(),
        MemoryRecorder::new(),
        c,
    );
    let start = tokio::time::Instant::now();
    agent.run("x").await.unwrap();
    assert_eq!(start.elapsed(), Duration::from_millis(300));
}

#[test]
fn framing_mentions_task_then_last_result() {
    assert!(framing_text(1, "open notepad", None, &[]).contains("open notepad"));
    let later = framing_text(2, "open notepad", Some("Clicked at (1, 2)"), &[check("sc_9")]);
    assert!(later.starts_with("Done: Clicked at (1, 2)."));
    assert!(later.contains("[sc_9]"));
}

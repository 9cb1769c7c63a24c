use deskpilot::analyze::{export_learnings, latest_session, list_sessions, summarize_dir, SessionAnalyzer};
use deskpilot::session::{load_session, OperatorVerdict};
use deskpilot::{
    Action, DiskScreenshotStore, EncodedImage, ErrorKind, ImageFormat, JsonFileRecorder, MouseButton, Outcome,
    Proposed, Session, SessionRecorder, Termination, Turn,
};
use std::path::Path;

fn executed(iteration: u32, input: &str, action: Action, ok: bool) -> Turn {
    let mut t = Turn::new(iteration, input);
    t.selected = Some(Proposed::Known { call_id: format!("call_{}", iteration), action });
    t.outcome = Some(if ok {
        Outcome::success("done")
    } else {
        Outcome::failure(ErrorKind::Input, "Error: no device")
    });
    t
}

async fn reread(recorder: &JsonFileRecorder) -> Session {
    let path = recorder.path().await.unwrap();
    load_session(&path).await.unwrap()
}

#[tokio::test]
async fn file_is_complete_after_every_log() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = JsonFileRecorder::new(dir.path());
    recorder.start(Session::new(Some("open notepad".into()), Some("gpt-5".into()))).await.unwrap();
    assert_eq!(reread(&recorder).await.turns.len(), 0);

    let click = Action::Click { x: 160, y: 677, button: MouseButton::Left, click_count: 1 };
    recorder.log(executed(1, "click New Note", click, true)).await.unwrap();
    let on_disk = reread(&recorder).await;
    assert_eq!(on_disk.turns.len(), 1);
    assert_eq!(on_disk.summary.succeeded, 1);
    assert!(on_disk.termination.is_none());

    recorder.log(executed(2, "type", Action::TypeText { text: "hi".into() }, false)).await.unwrap();
    let on_disk = reread(&recorder).await;
    assert_eq!((on_disk.summary.total, on_disk.summary.failed), (2, 1));

    // no temp file left behind
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn finalize_freezes_the_record() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = JsonFileRecorder::new(dir.path());
    recorder.start(Session::new(None, None)).await.unwrap();
    recorder.log(Turn::new(1, "look")).await.unwrap();
    let done = recorder.finalize(Termination::MaxIterationsReached, Some("budget".into())).await.unwrap();
    assert!(done.ended_at.is_some());

    recorder.log(Turn::new(2, "late")).await.unwrap();
    let on_disk = reread(&recorder).await;
    assert_eq!(on_disk.turns.len(), 1);
    assert_eq!(on_disk.termination, Some(Termination::MaxIterationsReached));
    assert_eq!(on_disk.final_notes.as_deref(), Some("budget"));
}

#[tokio::test]
async fn analyzer_reads_a_recorded_session() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = JsonFileRecorder::new(dir.path());
    recorder.start(Session::new(Some("write a note".into()), None)).await.unwrap();

    let click = Action::Click { x: 160, y: 677, button: MouseButton::Left, click_count: 1 };
    recorder.log(executed(1, "click New Note", click.clone(), true)).await.unwrap();
    recorder.log(executed(2, "wait", Action::Wait { duration_ms: 500 }, true)).await.unwrap();
    let mut rejected = Turn::new(3, "click Save");
    rejected.selected = Some(Proposed::Known { call_id: "c3".into(), action: click });
    rejected.operator = Some(OperatorVerdict::Rejected { note: Some("Save is at 900,40".into()) });
    rejected.correction = Some("Save is at 900,40".into());
    recorder.log(rejected).await.unwrap();
    recorder.log(executed(4, "type", Action::TypeText { text: "x".into() }, false)).await.unwrap();
    recorder.finalize(Termination::Aborted { reason: "operator quit".into() }, None).await.unwrap();

    let path = latest_session(dir.path()).await.unwrap().unwrap();
    let session = load_session(&path).await.unwrap();
    let report = SessionAnalyzer::default().analyze(&session);

    assert_eq!(report.total, 4);
    assert!((report.success_rate - 0.5).abs() < f64::EPSILON);
    assert!(report.needs_review);
    assert_eq!(report.corrections.len(), 1);
    assert_eq!(report.failures.len(), 1);
    // the wait is not a coordinate hint
    assert_eq!(report.coordinate_hints.len(), 1);
    assert_eq!((report.coordinate_hints[0].x, report.coordinate_hints[0].y), (160, 677));
    assert!(report.suggestions.iter().any(|s| s.contains("corrections")));

    // the failed type_text is not a pattern, the successful click is
    assert_eq!(report.successful_patterns.len(), 1);
    assert_eq!(report.coordinate_corrections.len(), 1);
    assert_eq!(report.coordinate_corrections[0].proposed, (160, 677));

    let exported = export_learnings(&report, dir.path()).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&std::fs::read(&exported).unwrap()).unwrap();
    assert_eq!(body["coordinate_mappings"].as_array().map(Vec::len), Some(1));
    assert_eq!(body["successful_patterns"][0]["action"]["type"], "click");
    assert_eq!(body["prompt_update_suggestions"][0]["type"], "coordinate_hint");
    assert_eq!(body["prompt_update_suggestions"][0]["proposed_wrong"], serde_json::json!([160, 677]));
    assert_eq!(body["prompt_update_suggestions"][0]["user_note"], "Save is at 900,40");
    // learnings files are not sessions
    assert_eq!(list_sessions(dir.path()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn directory_summary_spans_sessions() {
    let dir = tempfile::tempdir().unwrap();
    for ok in [true, false] {
        let recorder = JsonFileRecorder::new(dir.path());
        let mut s = Session::new(None, None);
        s.session_id = if ok { "20260101_000000_000" } else { "20260101_000001_000" }.to_string();
        recorder.start(s).await.unwrap();
        recorder.log(executed(1, "x", Action::PressKey { key: "enter".into() }, ok)).await.unwrap();
    }
    std::fs::write(dir.path().join("session_broken.json"), b"{").unwrap();

    let summary = summarize_dir(dir.path()).await.unwrap();
    assert_eq!(summary.sessions, 2);
    assert_eq!(summary.total, 2);
    assert!((summary.success_rate - 0.5).abs() < f64::EPSILON);
    assert_eq!(summarize_dir(Path::new("/definitely/missing")).await.unwrap().sessions, 0);
}

#[tokio::test]
async fn screenshots_land_beside_sessions() {
    use deskpilot::session::ScreenshotStore;
    let dir = tempfile::tempdir().unwrap();
    let store = DiskScreenshotStore::new(dir.path());
    let img = EncodedImage { bytes: vec![1, 2, 3], format: ImageFormat::Png, width: 1, height: 1 };
    store.save("abc", 7, &img).await.unwrap();
    assert_eq!(std::fs::read(dir.path().join("session_abc").join("step_007.png")).unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn keystroke_patterns_survive_export() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = JsonFileRecorder::new(dir.path());
    recorder.start(Session::new(Some("save the note".into()), None)).await.unwrap();
    let mut typed = executed(1, "Next action?", Action::TypeText { text: "groceries".into() }, true);
    typed.free_text = Some("Typing the note title".into());
    recorder.log(typed).await.unwrap();
    let save = Action::Hotkey { keys: vec!["ctrl".into(), "s".into()] };
    recorder.log(executed(2, "save", save, true)).await.unwrap();
    recorder.log(executed(3, "settle", Action::Wait { duration_ms: 1000 }, true)).await.unwrap();

    let session = reread(&recorder).await;
    let report = SessionAnalyzer::default().analyze(&session);
    let kinds: Vec<_> = report.successful_patterns.iter().map(|p| p.action.kind().name()).collect();
    assert_eq!(kinds, vec!["type_text", "hotkey"]);
    assert_eq!(report.successful_patterns[0].intent, "Typing the note title");
    assert!(report.coordinate_hints.is_empty());

    let exported = export_learnings(&report, dir.path()).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&std::fs::read(&exported).unwrap()).unwrap();
    assert_eq!(body["successful_patterns"].as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn latest_is_the_newest_write_not_the_last_name() {
    use std::time::{Duration, SystemTime};
    let dir = tempfile::tempdir().unwrap();
    let mut paths = Vec::new();
    for id in ["20260101_000009_000", "20260101_000001_000"] {
        let recorder = JsonFileRecorder::new(dir.path());
        let mut s = Session::new(None, None);
        s.session_id = id.to_string();
        recorder.start(s).await.unwrap();
        paths.push(recorder.path().await.unwrap());
    }
    let an_hour_ago = SystemTime::now() - Duration::from_secs(3600);
    std::fs::File::options().write(true).open(&paths[0]).unwrap().set_modified(an_hour_ago).unwrap();
    // newer on disk, but not named like a session id
    std::fs::write(dir.path().join("session_broken.json"), b"{").unwrap();

    let latest = latest_session(dir.path()).await.unwrap().unwrap();
    assert_eq!(latest, paths[1]);
    assert!(latest_session(Path::new("/definitely/missing")).await.unwrap().is_none());
}

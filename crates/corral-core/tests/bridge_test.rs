//! Bridge tests: line decoding, routing to the stream, terminal signals.

use futures::stream;
use tokio::sync::mpsc;

use corral_core::bridge::{AgentSignal, BridgeBindings, ContainerBridge};
use corral_core::events::CompleteStatus;
use corral_core::session::SessionService;
use corral_core::streams::{StreamOptions, StreamService};

use corral_db::config::DbConfig;
use corral_db::pool;

const TASK: &str = "task-1";
const SESSION: &str = "sess-1";
const PROJECT: &str = "proj-1";

struct BridgeHarness {
    streams: StreamService,
    signals: mpsc::Receiver<AgentSignal>,
    _dir: tempfile::TempDir,
}

/// Run a bridge over a scripted set of stdout lines and collect the
/// resulting stream + signals.
async fn run_bridge(lines: Vec<String>) -> BridgeHarness {
    let dir = tempfile::tempdir().unwrap();
    let db = pool::open(&DbConfig::new(dir.path().join("bridge.db")))
        .await
        .unwrap();

    let streams = StreamService::new();
    streams.create_stream(SESSION, StreamOptions::default()).unwrap();
    let sessions = SessionService::new(db, streams.clone());

    let (tx, rx) = mpsc::channel(64);
    let bridge = ContainerBridge::new(
        BridgeBindings {
            task_id: TASK.to_string(),
            session_id: SESSION.to_string(),
            project_id: PROJECT.to_string(),
        },
        sessions,
        tx,
        None,
    );

    let owned: Vec<std::io::Result<String>> = lines.into_iter().map(Ok).collect();
    bridge.run(Box::pin(stream::iter(owned))).await;

    BridgeHarness {
        streams,
        signals: rx,
        _dir: dir,
    }
}

fn event_line(kind: &str, data: serde_json::Value) -> String {
    serde_json::json!({
        "type": kind,
        "timestamp": 1712345678901_i64,
        "taskId": TASK,
        "sessionId": SESSION,
        "data": data,
    })
    .to_string()
}

fn drain_signals(rx: &mut mpsc::Receiver<AgentSignal>) -> Vec<AgentSignal> {
    let mut signals = Vec::new();
    while let Ok(signal) = rx.try_recv() {
        signals.push(signal);
    }
    signals
}

#[tokio::test]
async fn plan_flow_publishes_stream_events_but_not_plan_ready() {
    let started = event_line("agent:started", serde_json::json!({"model": "m", "maxTurns": 50}));
    let turn = event_line(
        "agent:turn",
        serde_json::json!({"turn": 1, "maxTurns": 50, "remaining": 49}),
    );
    let plan = event_line(
        "agent:plan_ready",
        serde_json::json!({"plan": "P", "turnCount": 1, "sdkSessionId": "sdk-1"}),
    );

    let mut harness = run_bridge(vec![started, turn, plan]).await;

    let events = harness.streams.get_events(SESSION).unwrap();
    let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(kinds, vec!["container-agent:started", "container-agent:turn"]);
    assert!(!kinds.iter().any(|k| k.contains("plan_ready")));
    assert!(!kinds.iter().any(|k| k.contains("error")));

    // Published payloads carry the run identity.
    assert_eq!(events[0].data["taskId"], TASK);
    assert_eq!(events[0].data["sessionId"], SESSION);
    assert_eq!(events[0].data["projectId"], PROJECT);
    assert_eq!(events[0].data["model"], "m");

    let signals = drain_signals(&mut harness.signals);
    let plan_ready: Vec<_> = signals
        .iter()
        .filter(|s| matches!(s, AgentSignal::PlanReady(_)))
        .collect();
    assert_eq!(plan_ready.len(), 1, "onPlanReady fires exactly once");
    let AgentSignal::PlanReady(data) = plan_ready[0] else {
        unreachable!()
    };
    assert_eq!(data.plan, "P");
    assert_eq!(data.sdk_session_id, "sdk-1");

    // Clean exit after plan_ready: EOF is expected, no synthesized error.
    assert!(matches!(
        signals.last(),
        Some(AgentSignal::Eof { expected: true })
    ));
}

#[tokio::test]
async fn non_json_lines_are_skipped_and_parsing_continues() {
    let token = event_line("agent:token", serde_json::json!({"text": "hi"}));
    let mut harness = run_bridge(vec![
        "compiling corral v0.1.0 (/workspace)".to_string(),
        String::new(),
        "warning: unused variable".to_string(),
        token,
        "{broken json".to_string(),
    ])
    .await;

    let events = harness.streams.get_events(SESSION).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, "container-agent:token");

    let signals = drain_signals(&mut harness.signals);
    assert!(matches!(
        signals.last(),
        Some(AgentSignal::Eof { expected: false })
    ));
}

#[tokio::test]
async fn mismatched_ids_are_dropped_without_publish() {
    let foreign = serde_json::json!({
        "type": "agent:token",
        "timestamp": 1_i64,
        "taskId": "other-task",
        "sessionId": SESSION,
        "data": {"text": "stolen"},
    })
    .to_string();
    let wrong_session = serde_json::json!({
        "type": "agent:token",
        "timestamp": 1_i64,
        "taskId": TASK,
        "sessionId": "other-session",
        "data": {"text": "also stolen"},
    })
    .to_string();
    let ours = event_line("agent:token", serde_json::json!({"text": "mine"}));

    let harness = run_bridge(vec![foreign, wrong_session, ours]).await;

    let events = harness.streams.get_events(SESSION).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data["text"], "mine");
}

#[tokio::test]
async fn complete_event_publishes_and_signals() {
    let complete = event_line(
        "agent:complete",
        serde_json::json!({"status": "completed", "turnCount": 7}),
    );
    let mut harness = run_bridge(vec![complete]).await;

    let events = harness.streams.get_events(SESSION).unwrap();
    assert_eq!(events[0].kind, "container-agent:complete");

    let signals = drain_signals(&mut harness.signals);
    assert!(signals.contains(&AgentSignal::Complete {
        status: CompleteStatus::Completed,
        turn_count: 7,
    }));
    assert!(matches!(
        signals.last(),
        Some(AgentSignal::Eof { expected: true })
    ));
}

#[tokio::test]
async fn cancelled_event_maps_to_cancelled_completion() {
    let cancelled = event_line("agent:cancelled", serde_json::json!({"turnCount": 3}));
    let mut harness = run_bridge(vec![cancelled]).await;

    let events = harness.streams.get_events(SESSION).unwrap();
    assert_eq!(events[0].kind, "container-agent:cancelled");

    let signals = drain_signals(&mut harness.signals);
    assert!(signals.contains(&AgentSignal::Complete {
        status: CompleteStatus::Cancelled,
        turn_count: 3,
    }));
}

#[tokio::test]
async fn error_event_publishes_and_signals() {
    let error = event_line(
        "agent:error",
        serde_json::json!({"error": "Rate limit exceeded", "turnCount": 3}),
    );
    let mut harness = run_bridge(vec![error]).await;

    let events = harness.streams.get_events(SESSION).unwrap();
    assert_eq!(events[0].kind, "container-agent:error");

    let signals = drain_signals(&mut harness.signals);
    assert!(signals.contains(&AgentSignal::Error {
        message: "Rate limit exceeded".to_string(),
        turn_count: 3,
    }));
}

#[tokio::test]
async fn file_changed_is_forwarded_as_is() {
    let changed = event_line(
        "agent:file_changed",
        serde_json::json!({
            "path": "src/lib.rs",
            "action": "modify",
            "toolName": "Edit",
            "additions": 4,
        }),
    );
    let harness = run_bridge(vec![changed]).await;

    let events = harness.streams.get_events(SESSION).unwrap();
    assert_eq!(events[0].kind, "container-agent:file_changed");
    assert_eq!(events[0].data["path"], "src/lib.rs");
    assert_eq!(events[0].data["additions"], 4);
}

#[tokio::test]
async fn publish_failure_does_not_stop_the_bridge() {
    // No stream is created for the session: every publish fails, but the
    // terminal signal still arrives.
    let dir = tempfile::tempdir().unwrap();
    let db = pool::open(&DbConfig::new(dir.path().join("bridge.db")))
        .await
        .unwrap();
    let streams = StreamService::new();
    let sessions = SessionService::new(db, streams.clone());

    let (tx, mut rx) = mpsc::channel(8);
    let bridge = ContainerBridge::new(
        BridgeBindings {
            task_id: TASK.to_string(),
            session_id: SESSION.to_string(),
            project_id: PROJECT.to_string(),
        },
        sessions,
        tx,
        None,
    );

    let complete = event_line(
        "agent:complete",
        serde_json::json!({"status": "completed", "turnCount": 1}),
    );
    let lines: Vec<std::io::Result<String>> = vec![Ok(complete)];
    bridge.run(Box::pin(stream::iter(lines))).await;

    let signal = rx.recv().await.unwrap();
    assert!(matches!(signal, AgentSignal::Complete { .. }));
}

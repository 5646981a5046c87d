// crates/relaycore/tests/model_test.rs

use chrono::Utc;
use relaycore::{
    EventBus, ExecutionContext, RiskLevel, RunEvent, SessionHandle, SessionKey, StepKind,
    StepResult, WorkerRef, WorkflowDefinition,
};
use uuid::Uuid;

fn aborted(thread_id: &str) -> RunEvent {
    RunEvent::RunAborted {
        run_id: Uuid::new_v4(),
        thread_id: thread_id.to_string(),
        reason: None,
        timestamp: Utc::now(),
    }
}

#[test]
fn test_definition_from_json_applies_defaults() {
    let raw = r#"{
        "name": "brief",
        "steps": [
            { "id": "draft", "task": "write it", "role": "writer" },
            {
                "id": "merge",
                "task": "join",
                "worker_id": "editor-1",
                "depends_on": ["draft"],
                "kind": "scripted_operator",
                "config": { "operation": "concat", "separator": " | " },
                "approval": { "prompt": "Ship?", "risk_level": "high" }
            }
        ]
    }"#;

    let def: WorkflowDefinition = serde_json::from_str(raw).unwrap();
    assert_eq!(def.version, "1.0");
    assert_eq!(def.steps.len(), 2);

    let draft = def.find_step("draft").unwrap();
    assert_eq!(draft.kind, None);
    assert_eq!(draft.worker_ref(), Some(WorkerRef::Role("writer".to_string())));

    let merge = def.find_step("merge").unwrap();
    assert_eq!(merge.kind, Some(StepKind::ScriptedOperator));
    assert_eq!(merge.config.get_str("separator"), Some(" | "));
    assert_eq!(merge.worker_ref(), Some(WorkerRef::Id("editor-1".to_string())));
    let approval = merge.approval.as_ref().unwrap();
    assert_eq!(approval.risk_level, Some(RiskLevel::High));
    assert_eq!(approval.timeout_seconds, None);
}

#[test]
fn test_worker_ref_requires_exactly_one_reference() {
    let raw = r#"{ "id": "x", "task": "t", "worker_id": "w", "role": "r" }"#;
    let both: relaycore::WorkflowStep = serde_json::from_str(raw).unwrap();
    assert!(both.has_worker_ref());
    assert_eq!(both.worker_ref(), None);

    let neither = relaycore::WorkflowStep::new("y", "t");
    assert!(!neither.has_worker_ref());
    assert_eq!(neither.worker_ref(), None);
}

#[test]
fn test_step_kind_parsing_is_lenient() {
    assert_eq!("Sandboxed-Script".parse::<StepKind>(), Ok(StepKind::SandboxedScript));
    assert_eq!(" mock ".parse::<StepKind>(), Ok(StepKind::Mock));
    assert!("teleport".parse::<StepKind>().is_err());
}

#[tokio::test]
async fn test_context_exposes_only_completed_outputs() {
    let ctx = ExecutionContext::new(Uuid::new_v4(), "thread-1", None, Uuid::new_v4());

    ctx.record(StepResult::completed("a", "alpha")).await;
    ctx.record(StepResult::failed("b", "boom")).await;
    ctx.record(StepResult::completed("c", "gamma")).await;

    assert_eq!(ctx.output("a").await.as_deref(), Some("alpha"));
    assert_eq!(ctx.output("b").await, None);
    assert_eq!(ctx.results().await.len(), 3);

    let upstream = ctx
        .upstream(&["c".to_string(), "b".to_string(), "a".to_string()])
        .await;
    let ids: Vec<&str> = upstream.iter().map(|u| u.step_id.as_str()).collect();
    assert_eq!(ids, vec!["c", "a"]);
}

#[tokio::test]
async fn test_sessions_are_keyed_by_project_and_worker() {
    let ctx = ExecutionContext::new(Uuid::new_v4(), "thread-1", Some("acme".into()), Uuid::new_v4());
    let key = SessionKey::new(Some("acme".into()), "writer-1");

    assert!(ctx.session(&key).await.is_none());
    let handle = SessionHandle::open(key.clone());
    ctx.bind_session(handle.clone()).await;

    assert_eq!(ctx.session(&key).await, Some(handle));
    assert!(ctx.session(&SessionKey::new(None, "writer-1")).await.is_none());
    assert_eq!(ctx.session_count().await, 1);
    assert_eq!(key.to_string(), "acme/writer-1");
}

#[tokio::test]
async fn test_cancellation_is_shared() {
    let ctx = ExecutionContext::new(Uuid::new_v4(), "thread-1", None, Uuid::new_v4());
    let token = ctx.cancellation_token();
    assert!(!token.is_cancelled());

    ctx.cancel();
    assert!(ctx.is_cancelled());
    assert!(token.is_cancelled());
}

#[tokio::test]
async fn test_thread_subscription_skips_other_threads() {
    let bus = EventBus::new(16);
    let mut sub = bus.subscribe_thread("t-2");

    bus.emit(aborted("t-1"));
    bus.emit(aborted("t-2"));

    let event = sub.recv().await.unwrap();
    assert_eq!(event.thread_id(), "t-2");
}

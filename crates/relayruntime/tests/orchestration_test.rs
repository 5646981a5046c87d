// crates/relayruntime/tests/orchestration_test.rs

use async_trait::async_trait;
use relaycore::{
    ApprovalError, ApprovalSpec, ApprovalState, Decision, DispatchError, OverdueSeverity,
    RelayError, RoleAssignment, RunEvent, RunStatus, StepContext, StepError, StepExecutor,
    StepKind, StepResult, StepStatus, ThreadSubscription, ValidationError, WorkerConfig,
    WorkflowDefinition, WorkflowStep,
};
use relayruntime::{ExecutorRegistry, RelayRuntime, RuntimeConfig, StaticWorkerSource, WorkerDirectory};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Journal = Arc<Mutex<Vec<String>>>;

/// Test executor: sleeps for `delay_ms`, fails when `fail` is set, and
/// reports which worker ran it and which upstream outputs it saw.
struct ScriptedExecutor {
    kind: StepKind,
    journal: Journal,
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    fn kind(&self) -> StepKind {
        self.kind
    }

    async fn execute(&self, step: &WorkflowStep, ctx: StepContext) -> Result<StepResult, StepError> {
        self.journal.lock().unwrap().push(format!("start:{}", step.id));

        if let Some(ms) = step.config.get_u64("delay_ms") {
            tokio::select! {
                _ = ctx.cancellation.cancelled() => {
                    self.journal.lock().unwrap().push(format!("cancelled:{}", step.id));
                    return Err(StepError::Cancelled);
                }
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
            }
        }

        self.journal.lock().unwrap().push(format!("end:{}", step.id));

        if step.config.get_bool("fail") == Some(true) {
            return Err(StepError::ExecutionFailed(format!("{} exploded", step.id)));
        }

        let worker = ctx.worker.as_ref().map(|w| w.worker_id().to_string());
        let upstream: Vec<String> = ctx.upstream.iter().map(|u| u.step_id.clone()).collect();
        Ok(ctx
            .completed(format!("{} done", step.id))
            .with_structured(json!({ "worker": worker, "upstream": upstream })))
    }
}

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

fn build_runtime(
    source: Arc<StaticWorkerSource>,
    config: RuntimeConfig,
) -> (RelayRuntime, Journal) {
    init_tracing();
    let journal: Journal = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ExecutorRegistry::new();
    for kind in [StepKind::DelegatedAgent, StepKind::Mock] {
        registry.register(Arc::new(ScriptedExecutor {
            kind,
            journal: journal.clone(),
        }));
    }
    let directory = Arc::new(WorkerDirectory::new(source));
    (RelayRuntime::new(config, registry, directory), journal)
}

/// One worker per step id, so steps never share a session.
fn runtime_for(step_ids: &[&str]) -> (RelayRuntime, Journal) {
    let workers = step_ids
        .iter()
        .map(|id| WorkerConfig::new(format!("w-{}", id), format!("role-{}", id)))
        .collect();
    build_runtime(
        Arc::new(StaticWorkerSource::from_workers(workers)),
        RuntimeConfig::default(),
    )
}

fn step(id: &str, deps: &[&str]) -> WorkflowStep {
    let mut step = WorkflowStep::new(id, format!("do {}", id)).with_worker(format!("w-{}", id));
    for dep in deps {
        step = step.depends_on(*dep);
    }
    step
}

fn position(journal: &Journal, entry: &str) -> usize {
    journal
        .lock()
        .unwrap()
        .iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("journal has no '{}'", entry))
}

async fn wait_for<F>(subscription: &mut ThreadSubscription, mut matches: F) -> RunEvent
where
    F: FnMut(&RunEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = subscription.recv().await.expect("event bus closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_diamond_runs_in_dependency_order() {
    let (runtime, journal) = runtime_for(&["a", "b", "c", "d"]);
    let workflow = WorkflowDefinition::new("diamond")
        .with_step(step("a", &[]))
        .with_step(step("b", &["a"]).with_config("delay_ms", 100))
        .with_step(step("c", &["a"]).with_config("delay_ms", 100))
        .with_step(step("d", &["b", "c"]));

    let outcome = runtime.execute(&workflow, None).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.completed_steps(), 4);

    assert!(position(&journal, "end:a") < position(&journal, "start:b"));
    assert!(position(&journal, "end:a") < position(&journal, "start:c"));
    assert!(position(&journal, "end:b") < position(&journal, "start:d"));
    assert!(position(&journal, "end:c") < position(&journal, "start:d"));

    // b and c run side by side
    assert!(position(&journal, "start:c") < position(&journal, "end:b"));
    assert!(position(&journal, "start:b") < position(&journal, "end:c"));

    let d = outcome.result("d").unwrap();
    assert_eq!(d.output.as_deref(), Some("d done"));
    assert_eq!(d.structured.as_ref().unwrap()["upstream"], json!(["b", "c"]));
}

#[tokio::test]
async fn test_failure_blocks_only_dependents() {
    let (runtime, _journal) = runtime_for(&["a", "b", "c", "d"]);
    let workflow = WorkflowDefinition::new("isolation")
        .with_step(step("a", &[]).with_config("fail", true))
        .with_step(step("b", &["a"]))
        .with_step(step("c", &["b"]))
        .with_step(step("d", &[]).with_config("delay_ms", 50));

    let mut events = runtime.subscribe_events();
    let outcome = runtime.execute(&workflow, None).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.status_of("a"), Some(StepStatus::Failed));
    assert_eq!(outcome.status_of("b"), Some(StepStatus::BlockedByFailure));
    assert_eq!(outcome.status_of("c"), Some(StepStatus::BlockedByFailure));
    assert_eq!(outcome.status_of("d"), Some(StepStatus::Completed));
    assert!(outcome.result("a").unwrap().error.as_deref().unwrap().contains("a exploded"));

    let mut blocked = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RunEvent::StepBlocked { step_id, failed_dependency, .. } = event {
            assert_eq!(failed_dependency, "a");
            blocked.push(step_id);
        }
    }
    blocked.sort();
    assert_eq!(blocked, vec!["b", "c"]);
}

#[tokio::test]
async fn test_same_worker_steps_do_not_overlap() {
    let source = Arc::new(StaticWorkerSource::from_workers(vec![WorkerConfig::new(
        "shared", "writer",
    )]));
    let (runtime, journal) = build_runtime(source, RuntimeConfig::default());
    let workflow = WorkflowDefinition::new("single-flight")
        .with_step(WorkflowStep::new("x", "x").with_role("writer").with_config("delay_ms", 80))
        .with_step(WorkflowStep::new("y", "y").with_role("writer").with_config("delay_ms", 80));

    let outcome = runtime.execute(&workflow, None).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);

    let entries = journal.lock().unwrap().clone();
    assert_eq!(entries.len(), 4);
    // Whichever ran first finished before the other started
    assert!(entries[0].starts_with("start:"));
    assert!(entries[1].starts_with("end:"));
    assert_eq!(entries[0][6..], entries[1][4..]);
}

#[tokio::test]
async fn test_suspended_step_releases_its_worker() {
    let source = Arc::new(StaticWorkerSource::from_workers(vec![
        WorkerConfig::new("shared", "writer"),
        WorkerConfig::new("other", "lead"),
    ]));
    let (runtime, journal) = build_runtime(source, RuntimeConfig::default());
    // "free" only asks for the shared worker after "gated" has suspended
    let workflow = WorkflowDefinition::new("gated-shared")
        .with_step(
            WorkflowStep::new("gated", "g")
                .with_role("writer")
                .with_approval(ApprovalSpec::new("Go?").with_timeout(60)),
        )
        .with_step(WorkflowStep::new("lead", "l").with_role("lead").with_config("delay_ms", 100))
        .with_step(WorkflowStep::new("free", "f").with_role("writer").depends_on("lead"));

    let mut subscription = runtime.subscribe_thread("thread-shared");
    let handle = runtime
        .submit(&workflow, None, Some("thread-shared".into()))
        .await
        .unwrap();

    wait_for(&mut subscription, |e| {
        matches!(e, RunEvent::StepCompleted { step_id, .. } if step_id == "free")
    })
    .await;

    let approval = runtime.gate().get("thread-shared", "gated").await.unwrap();
    assert_eq!(approval.state, ApprovalState::Pending);
    assert!(position(&journal, "end:gated") < position(&journal, "start:free"));

    runtime
        .decide("thread-shared", "gated", Decision::Approve, None)
        .await
        .unwrap();
    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.completed_steps(), 3);
}

#[tokio::test]
async fn test_cycle_is_rejected_before_anything_runs() {
    let (runtime, journal) = runtime_for(&["a", "b", "c"]);
    let workflow = WorkflowDefinition::new("cycle")
        .with_step(step("a", &["c"]))
        .with_step(step("b", &["a"]))
        .with_step(step("c", &["b"]));

    let err = runtime.submit(&workflow, None, None).await.err().unwrap();
    match err {
        RelayError::Validation(errors) => {
            assert_eq!(errors.len(), 1);
            match errors.iter().next().unwrap() {
                ValidationError::CyclicDependency { step_id } => {
                    assert!(["a", "b", "c"].contains(&step_id.as_str()));
                }
                other => panic!("unexpected error: {}", other),
            }
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(journal.lock().unwrap().is_empty());
    assert!(runtime.list_runs().await.is_empty());
}

#[tokio::test]
async fn test_unknown_dependency_names_the_missing_step() {
    let (runtime, _journal) = runtime_for(&["a"]);
    let workflow = WorkflowDefinition::new("dangling").with_step(step("a", &["ghost"]));

    let errors = runtime.validate(&workflow, None).await.unwrap();
    assert_eq!(
        errors,
        vec![ValidationError::UnknownDependency {
            step_id: "a".to_string(),
            missing: "ghost".to_string(),
        }]
    );
}

#[tokio::test]
async fn test_worker_reference_problems_are_all_reported() {
    let (runtime, journal) = runtime_for(&["a"]);
    let workflow = WorkflowDefinition::new("refs")
        .with_step(step("a", &[]))
        .with_step(WorkflowStep::new("bare", "no worker"))
        .with_step(WorkflowStep::new("both", "two refs").with_worker("w-a").with_role("role-a"))
        .with_step(WorkflowStep::new("lost", "nobody").with_role("astronaut"));

    let errors = runtime.validate(&workflow, None).await.unwrap();
    assert_eq!(errors.len(), 3);
    assert!(errors.contains(&ValidationError::MissingWorkerReference {
        step_id: "bare".to_string()
    }));
    assert!(errors.contains(&ValidationError::ConflictingWorkerReference {
        step_id: "both".to_string()
    }));
    assert!(errors.iter().any(|e| matches!(
        e,
        ValidationError::UnresolvedWorkerReference { step_id, .. } if step_id == "lost"
    )));

    assert!(runtime.submit(&workflow, None, None).await.is_err());
    assert!(journal.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unregistered_kind_is_a_dispatch_error() {
    let (runtime, _journal) = runtime_for(&["a"]);
    let workflow = WorkflowDefinition::new("callback")
        .with_step(step("a", &[]).with_kind(StepKind::ExternalCallback));

    match runtime.submit(&workflow, None, None).await.err().unwrap() {
        RelayError::Dispatch(DispatchError::UnsupportedStepKind { kind, registered, .. }) => {
            assert_eq!(kind, "external_callback");
            assert_eq!(registered, vec!["delegated_agent", "mock"]);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_project_role_falls_back_to_global_after_invalidate() {
    let source = Arc::new(StaticWorkerSource::from_workers(vec![
        WorkerConfig::new("global-writer", "writer"),
        WorkerConfig::new("acme-writer", "writer"),
    ]));
    source
        .assign("acme", RoleAssignment::new("writer", "acme-writer"))
        .await;
    let (runtime, _journal) = build_runtime(source.clone(), RuntimeConfig::default());
    let workflow = WorkflowDefinition::new("roles")
        .with_step(WorkflowStep::new("draft", "write it").with_role("Writer"));

    let worker_of = |outcome: &relayruntime::RunOutcome| {
        outcome.result("draft").unwrap().structured.as_ref().unwrap()["worker"].clone()
    };

    let outcome = runtime.execute(&workflow, Some("acme".into())).await.unwrap();
    assert_eq!(worker_of(&outcome), json!("acme-writer"));

    let outcome = runtime.execute(&workflow, None).await.unwrap();
    assert_eq!(worker_of(&outcome), json!("global-writer"));

    assert!(source.unassign("acme", "writer").await);

    // Still the cached snapshot until the directory is invalidated
    let outcome = runtime.execute(&workflow, Some("acme".into())).await.unwrap();
    assert_eq!(worker_of(&outcome), json!("acme-writer"));

    runtime.directory().invalidate().await;
    let outcome = runtime.execute(&workflow, Some("acme".into())).await.unwrap();
    assert_eq!(worker_of(&outcome), json!("global-writer"));
}

#[tokio::test]
async fn test_step_timeout_fails_the_step() {
    let (runtime, journal) = runtime_for(&["slow", "next"]);
    let workflow = WorkflowDefinition::new("timeout")
        .with_step(step("slow", &[]).with_config("delay_ms", 5_000).with_timeout(1))
        .with_step(step("next", &["slow"]));

    let outcome = runtime.execute(&workflow, None).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    let slow = outcome.result("slow").unwrap();
    assert_eq!(slow.status, StepStatus::Failed);
    assert_eq!(slow.error.as_deref(), Some("Timeout after 1s"));
    assert_eq!(outcome.status_of("next"), Some(StepStatus::BlockedByFailure));
    assert!(!journal.lock().unwrap().contains(&"end:slow".to_string()));
}

#[tokio::test]
async fn test_approval_expires_without_deciding() {
    let (runtime, journal) = runtime_for(&["draft", "publish"]);
    let workflow = WorkflowDefinition::new("gated")
        .with_step(
            step("draft", &[])
                .with_approval(ApprovalSpec::new("Publish this draft?").with_timeout(1)),
        )
        .with_step(step("publish", &["draft"]));

    let mut subscription = runtime.subscribe_thread("thread-expiry");
    let handle = runtime
        .submit(&workflow, None, Some("thread-expiry".into()))
        .await
        .unwrap();

    let overdue = wait_for(&mut subscription, |e| matches!(e, RunEvent::ApprovalOverdue { .. })).await;
    match overdue {
        RunEvent::ApprovalOverdue { approval, severity, .. } => {
            assert_eq!(approval.step_id, "draft");
            assert!(severity >= OverdueSeverity::Warning);
        }
        _ => unreachable!(),
    }

    let approval = runtime.gate().get("thread-expiry", "draft").await.unwrap();
    assert_eq!(approval.state, ApprovalState::Expired);
    assert!(approval.decision.is_none());

    let alerts = runtime.overdue_approvals().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].approval.step_id, "draft");

    // Dependents stay blocked while the approval is outstanding
    let summary = runtime.run_summary(handle.run_id).await.unwrap();
    assert_eq!(summary.status, RunStatus::Running);
    assert_eq!(summary.results["draft"].status, StepStatus::WaitingForApproval);
    assert!(!journal.lock().unwrap().contains(&"start:publish".to_string()));

    // Expired approvals remain decidable
    runtime
        .decide("thread-expiry", "draft", Decision::Approve, None)
        .await
        .unwrap();

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(
        outcome.result("draft").unwrap().output.as_deref(),
        Some("draft done")
    );
    assert_eq!(outcome.status_of("publish"), Some(StepStatus::Completed));
}

#[tokio::test]
async fn test_second_decision_is_rejected() {
    let (runtime, _journal) = runtime_for(&["review", "ship"]);
    let workflow = WorkflowDefinition::new("review")
        .with_step(step("review", &[]).with_approval(ApprovalSpec::new("Ship?").with_timeout(60)))
        .with_step(step("ship", &["review"]));

    let mut subscription = runtime.subscribe_thread("thread-decide");
    let handle = runtime
        .submit(&workflow, None, Some("thread-decide".into()))
        .await
        .unwrap();
    wait_for(&mut subscription, |e| matches!(e, RunEvent::ApprovalRequested { .. })).await;

    runtime
        .decide("thread-decide", "review", Decision::Reject, Some("not yet".into()))
        .await
        .unwrap();

    let err = runtime
        .decide("thread-decide", "review", Decision::Approve, None)
        .await
        .unwrap_err();
    match err {
        RelayError::Approval(ApprovalError::AlreadyDecided { decision, .. }) => {
            assert_eq!(decision, "rejected");
        }
        other => panic!("unexpected error: {}", other),
    }

    let stored = runtime.gate().get("thread-decide", "review").await.unwrap();
    assert_eq!(stored.decision, Some(Decision::Reject));
    assert_eq!(stored.comment.as_deref(), Some("not yet"));

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    let review = outcome.result("review").unwrap();
    assert_eq!(review.status, StepStatus::Failed);
    assert_eq!(review.error.as_deref(), Some("approval rejected: not yet"));
    assert_eq!(outcome.status_of("ship"), Some(StepStatus::BlockedByFailure));
}

#[tokio::test]
async fn test_abort_with_running_step_and_pending_approval() {
    let (runtime, journal) = runtime_for(&["slow", "gated", "after"]);
    let workflow = WorkflowDefinition::new("abort")
        .with_step(step("slow", &[]).with_config("delay_ms", 30_000))
        .with_step(step("gated", &[]).with_approval(ApprovalSpec::new("Continue?").with_timeout(60)))
        .with_step(step("after", &["gated"]));

    let mut subscription = runtime.subscribe_thread("thread-abort");
    let handle = runtime
        .submit(&workflow, None, Some("thread-abort".into()))
        .await
        .unwrap();
    let run_id = handle.run_id;

    let mut slow_started = false;
    let mut approval_requested = false;
    while !(slow_started && approval_requested) {
        match wait_for(&mut subscription, |_| true).await {
            RunEvent::StepStarted { step_id, .. } if step_id == "slow" => slow_started = true,
            RunEvent::ApprovalRequested { .. } => approval_requested = true,
            _ => {}
        }
    }

    runtime.abort(run_id).await.unwrap();
    let outcome = handle.wait().await.unwrap();

    assert_eq!(outcome.status, RunStatus::Aborted);
    assert_eq!(outcome.status_of("slow"), Some(StepStatus::Aborted));
    assert_eq!(outcome.status_of("gated"), Some(StepStatus::Expired));
    assert_eq!(outcome.status_of("after"), Some(StepStatus::Aborted));
    assert!(!journal.lock().unwrap().contains(&"end:slow".to_string()));

    let approval = runtime.gate().get("thread-abort", "gated").await.unwrap();
    assert_eq!(approval.state, ApprovalState::Expired);
    assert!(runtime.pending_approvals().await.is_empty());

    let err = runtime
        .decide("thread-abort", "gated", Decision::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Approval(ApprovalError::Closed { .. })));

    wait_for(&mut subscription, |e| matches!(e, RunEvent::RunAborted { .. })).await;

    // Aborting a finished run does nothing
    runtime.abort(run_id).await.unwrap();
}

#[tokio::test]
async fn test_thread_runs_one_at_a_time() {
    let (runtime, _journal) = runtime_for(&["a"]);
    let workflow = WorkflowDefinition::new("busy").with_step(step("a", &[]).with_config("delay_ms", 200));

    let first = runtime
        .submit(&workflow, None, Some("thread-busy".into()))
        .await
        .unwrap();
    let second = runtime
        .submit(&workflow, None, Some("thread-busy".into()))
        .await;
    assert!(matches!(second, Err(RelayError::ThreadBusy { ref thread_id }) if thread_id == "thread-busy"));

    first.wait().await.unwrap();
    let third = runtime
        .submit(&workflow, None, Some("thread-busy".into()))
        .await
        .unwrap();
    assert_eq!(third.wait().await.unwrap().status, RunStatus::Completed);
}

#[tokio::test]
async fn test_finished_runs_are_evicted_with_their_approvals() {
    let (runtime, _journal) = build_runtime(
        Arc::new(StaticWorkerSource::from_workers(vec![WorkerConfig::new(
            "w-review",
            "role-review",
        )])),
        RuntimeConfig::default().with_max_retained_runs(1),
    );
    let gated = WorkflowDefinition::new("retained")
        .with_step(step("review", &[]).with_approval(ApprovalSpec::new("Ship?").with_timeout(60)));

    let mut subscription = runtime.subscribe_thread("thread-old");
    let first = runtime
        .submit(&gated, None, Some("thread-old".into()))
        .await
        .unwrap();
    let first_id = first.run_id;
    wait_for(&mut subscription, |e| matches!(e, RunEvent::ApprovalRequested { .. })).await;
    runtime
        .decide("thread-old", "review", Decision::Approve, None)
        .await
        .unwrap();
    first.wait().await.unwrap();

    let summary = runtime.run_summary(first_id).await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.results["review"].status, StepStatus::Completed);
    let err = runtime
        .decide("thread-old", "review", Decision::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Approval(ApprovalError::AlreadyDecided { .. })));

    // A newer finished run pushes the first one out
    let plain = WorkflowDefinition::new("plain").with_step(step("review", &[]));
    runtime.execute(&plain, None).await.unwrap();

    assert!(runtime.run_summary(first_id).await.is_none());
    assert_eq!(runtime.list_runs().await.len(), 1);
    let err = runtime
        .decide("thread-old", "review", Decision::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Approval(ApprovalError::NotFound { .. })));
}

#[tokio::test]
async fn test_forgetting_a_thread_waits_for_its_run() {
    let (runtime, _journal) = runtime_for(&["a"]);
    let workflow =
        WorkflowDefinition::new("forget").with_step(step("a", &[]).with_config("delay_ms", 200));

    let handle = runtime
        .submit(&workflow, None, Some("thread-forget".into()))
        .await
        .unwrap();
    let run_id = handle.run_id;
    assert!(matches!(
        runtime.forget_thread("thread-forget").await,
        Err(RelayError::ThreadBusy { .. })
    ));

    handle.wait().await.unwrap();
    assert_eq!(runtime.forget_thread("thread-forget").await.unwrap(), 1);
    assert!(runtime.run_summary(run_id).await.is_none());
    assert_eq!(runtime.forget_thread("thread-forget").await.unwrap(), 0);
}

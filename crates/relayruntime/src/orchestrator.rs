use crate::gate::{ApprovalGate, ApprovalOutcome, Suspension};
use crate::registry::ExecutorRegistry;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use relaycore::{
    EventBus, ExecutionContext, ResolvedWorker, RunEvent, RunId, RunStatus, SessionKey,
    StepContext, StepError, StepGraph, StepId, StepIndex, StepResult, StepStatus,
    WorkflowDefinition, WorkflowStep,
};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

/// A validated submission, ready to run.
pub struct RunPlan {
    pub definition: Arc<WorkflowDefinition>,
    pub graph: StepGraph,
    pub workers: HashMap<StepId, ResolvedWorker>,
}

impl RunPlan {
    /// The graph is built from `definition.steps` in order, so node
    /// indices and step positions coincide.
    fn step(&self, idx: StepIndex) -> &WorkflowStep {
        &self.definition.steps[idx.index()]
    }
}

/// Final state of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub thread_id: String,
    pub status: RunStatus,
    pub results: HashMap<StepId, StepResult>,
    pub duration_ms: u64,
}

impl RunOutcome {
    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.results.get(step_id)
    }

    pub fn status_of(&self, step_id: &str) -> Option<StepStatus> {
        self.results.get(step_id).map(|r| r.status)
    }

    pub fn completed_steps(&self) -> usize {
        self.results.values().filter(|r| r.is_success()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    Running,
    Suspended,
    Done(StepStatus),
}

enum TaskOutput {
    /// The executor returned; gated steps come back with a suspension.
    Finished {
        idx: StepIndex,
        result: StepResult,
        suspension: Option<Suspension>,
    },
    /// A suspended step received its decision.
    Resumed { idx: StepIndex, result: StepResult },
}

/// Drives one run's dependency graph to completion with bounded parallelism
pub struct Orchestrator {
    registry: Arc<ExecutorRegistry>,
    gate: Arc<ApprovalGate>,
    event_bus: Arc<EventBus>,
    max_parallel: usize,
    default_step_timeout: Option<u64>,
    default_approval_timeout: u64,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        gate: Arc<ApprovalGate>,
        event_bus: Arc<EventBus>,
        max_parallel: usize,
    ) -> Self {
        Self {
            registry,
            gate,
            event_bus,
            max_parallel: max_parallel.max(1),
            default_step_timeout: None,
            default_approval_timeout: 3600,
        }
    }

    pub fn with_default_step_timeout(mut self, seconds: Option<u64>) -> Self {
        self.default_step_timeout = seconds;
        self
    }

    pub fn with_default_approval_timeout(mut self, seconds: u64) -> Self {
        self.default_approval_timeout = seconds;
        self
    }

    /// Execute a validated plan until every step is terminal or the run is aborted
    pub async fn run(&self, plan: RunPlan, ctx: Arc<ExecutionContext>) -> RunOutcome {
        let start_time = Instant::now();
        let graph = &plan.graph;

        self.event_bus.emit(RunEvent::RunStarted {
            run_id: ctx.run_id,
            thread_id: ctx.thread_id.clone(),
            workflow_id: plan.definition.id,
            workflow_name: plan.definition.name.clone(),
            step_count: graph.len(),
            timestamp: Utc::now(),
        });
        tracing::info!(
            run_id = %ctx.run_id,
            thread_id = %ctx.thread_id,
            "Starting workflow run: {}",
            plan.definition.name
        );

        let mut slots = vec![Slot::Pending; graph.len()];
        let mut running: FuturesUnordered<BoxFuture<'static, TaskOutput>> = FuturesUnordered::new();
        let mut in_flight = 0usize;
        let mut worker_locks: HashMap<SessionKey, Arc<Mutex<()>>> = HashMap::new();
        let cancel = ctx.cancellation_token();
        let mut aborted = false;

        loop {
            if !aborted && cancel.is_cancelled() {
                aborted = true;
                tracing::warn!(run_id = %ctx.run_id, "run aborted");
                self.gate.abort_run(ctx.run_id).await;
            }

            if !aborted {
                for idx in Self::find_ready_steps(graph, &slots) {
                    if in_flight >= self.max_parallel {
                        break;
                    }
                    slots[idx.index()] = Slot::Running;
                    in_flight += 1;
                    running.push(self.spawn_step(idx, &plan, &ctx, &mut worker_locks));
                }
            }

            // If nothing is running or suspended, we're done
            if running.is_empty() {
                break;
            }

            let output = tokio::select! {
                Some(output) = running.next() => output,
                _ = cancel.cancelled(), if !aborted => continue,
                else => break,
            };

            match output {
                TaskOutput::Finished {
                    idx,
                    result,
                    suspension: Some(suspension),
                } if result.status == StepStatus::WaitingForApproval => {
                    in_flight -= 1;
                    slots[idx.index()] = Slot::Suspended;
                    tracing::info!(step_id = %result.step_id, "Step waiting for approval");
                    ctx.record(result.clone()).await;
                    running.push(wait_for_decision(idx, result, suspension, cancel.clone()).boxed());
                }
                TaskOutput::Finished { idx, result, .. } => {
                    in_flight -= 1;
                    self.settle(idx, result, graph, &ctx, &mut slots).await;
                }
                TaskOutput::Resumed { idx, result } => {
                    self.settle(idx, result, graph, &ctx, &mut slots).await;
                }
            }
        }

        // Anything never dispatched was cut off by the abort
        for idx in graph.indices() {
            if slots[idx.index()] == Slot::Pending {
                let step_id = graph.step_id(idx).to_string();
                self.event_bus.emit(RunEvent::StepAborted {
                    run_id: ctx.run_id,
                    thread_id: ctx.thread_id.clone(),
                    step_id: step_id.clone(),
                    timestamp: Utc::now(),
                });
                ctx.record(StepResult::aborted(step_id)).await;
                slots[idx.index()] = Slot::Done(StepStatus::Aborted);
            }
        }

        if aborted {
            // Approvals requested after the abort signal still need closing
            self.gate.abort_run(ctx.run_id).await;
        } else {
            self.gate.release_run(ctx.run_id).await;
        }

        let status = if aborted {
            RunStatus::Aborted
        } else if slots.iter().all(|s| *s == Slot::Done(StepStatus::Completed)) {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        let duration_ms = start_time.elapsed().as_millis() as u64;

        if aborted {
            self.event_bus.emit(RunEvent::RunAborted {
                run_id: ctx.run_id,
                thread_id: ctx.thread_id.clone(),
                reason: Some("abort requested".to_string()),
                timestamp: Utc::now(),
            });
        } else {
            self.event_bus.emit(RunEvent::RunCompleted {
                run_id: ctx.run_id,
                thread_id: ctx.thread_id.clone(),
                status,
                duration_ms,
                timestamp: Utc::now(),
            });
        }
        tracing::info!(run_id = %ctx.run_id, %status, duration_ms, "Workflow run finished");

        RunOutcome {
            run_id: ctx.run_id,
            thread_id: ctx.thread_id.clone(),
            status,
            results: ctx.results().await,
            duration_ms,
        }
    }

    /// Pending steps whose dependencies all completed
    fn find_ready_steps(graph: &StepGraph, slots: &[Slot]) -> Vec<StepIndex> {
        graph
            .indices()
            .filter(|idx| slots[idx.index()] == Slot::Pending)
            .filter(|idx| {
                graph
                    .dependencies(*idx)
                    .iter()
                    .all(|dep| slots[dep.index()] == Slot::Done(StepStatus::Completed))
            })
            .collect()
    }

    fn spawn_step(
        &self,
        idx: StepIndex,
        plan: &RunPlan,
        ctx: &Arc<ExecutionContext>,
        worker_locks: &mut HashMap<SessionKey, Arc<Mutex<()>>>,
    ) -> BoxFuture<'static, TaskOutput> {
        let step = plan.step(idx).clone();
        let step_id = step.id.clone();
        let worker = plan.workers.get(&step.id).cloned();
        let lock = worker.as_ref().map(|w| {
            let key = SessionKey::new(ctx.project_id.clone(), w.worker_id());
            Arc::clone(worker_locks.entry(key).or_default())
        });

        let step_timeout = step.timeout_secs.or(self.default_step_timeout);

        let task = StepTask {
            idx,
            step,
            worker,
            registry: Arc::clone(&self.registry),
            gate: Arc::clone(&self.gate),
            event_bus: Arc::clone(&self.event_bus),
            ctx: Arc::clone(ctx),
            step_timeout,
            approval_timeout: self.default_approval_timeout,
        };

        let handle = tokio::spawn(async move {
            // One session per worker: steps sharing it run one at a time
            let _guard = match lock {
                Some(lock) => Some(lock.lock_owned().await),
                None => None,
            };
            task.execute().await
        });

        async move {
            match handle.await {
                Ok(output) => output,
                Err(e) => TaskOutput::Finished {
                    idx,
                    result: StepResult::failed(step_id, format!("Task join error: {}", e)),
                    suspension: None,
                },
            }
        }
        .boxed()
    }

    /// Merge a terminal step result into the run and propagate failures.
    async fn settle(
        &self,
        idx: StepIndex,
        result: StepResult,
        graph: &StepGraph,
        ctx: &ExecutionContext,
        slots: &mut [Slot],
    ) {
        let result = match result.status {
            StepStatus::WaitingForApproval => result
                .with_status(StepStatus::Failed)
                .with_error("approval continuation lost"),
            _ => result,
        };
        let step_id = result.step_id.clone();

        match result.status {
            StepStatus::Completed => {
                let duration_ms = result.duration_ms().unwrap_or(0);
                tracing::info!("Step {} completed in {}ms", step_id, duration_ms);
                self.event_bus.emit(RunEvent::StepCompleted {
                    run_id: ctx.run_id,
                    thread_id: ctx.thread_id.clone(),
                    step_id: step_id.clone(),
                    output: result.output.clone(),
                    duration_ms,
                    timestamp: Utc::now(),
                });
            }
            StepStatus::Aborted | StepStatus::Expired => {
                tracing::warn!("Step {} aborted", step_id);
                self.event_bus.emit(RunEvent::StepAborted {
                    run_id: ctx.run_id,
                    thread_id: ctx.thread_id.clone(),
                    step_id: step_id.clone(),
                    timestamp: Utc::now(),
                });
            }
            StepStatus::Failed | StepStatus::BlockedByFailure | StepStatus::WaitingForApproval => {
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("step ended as {}", result.status));
                tracing::error!("Step {} failed: {}", step_id, error);
                self.event_bus.emit(RunEvent::StepFailed {
                    run_id: ctx.run_id,
                    thread_id: ctx.thread_id.clone(),
                    step_id: step_id.clone(),
                    error,
                    timestamp: Utc::now(),
                });

                for dependent in graph.transitive_dependents(idx) {
                    if slots[dependent.index()] != Slot::Pending {
                        continue;
                    }
                    slots[dependent.index()] = Slot::Done(StepStatus::BlockedByFailure);
                    let dependent_id = graph.step_id(dependent).to_string();
                    tracing::warn!("Step {} blocked by failed step {}", dependent_id, step_id);
                    self.event_bus.emit(RunEvent::StepBlocked {
                        run_id: ctx.run_id,
                        thread_id: ctx.thread_id.clone(),
                        step_id: dependent_id.clone(),
                        failed_dependency: step_id.clone(),
                        timestamp: Utc::now(),
                    });
                    ctx.record(StepResult::blocked(dependent_id, &step_id)).await;
                }
            }
        }

        slots[idx.index()] = Slot::Done(result.status);
        ctx.record(result).await;
    }
}

/// Everything one spawned step needs, owned.
struct StepTask {
    idx: StepIndex,
    step: WorkflowStep,
    worker: Option<ResolvedWorker>,
    registry: Arc<ExecutorRegistry>,
    gate: Arc<ApprovalGate>,
    event_bus: Arc<EventBus>,
    ctx: Arc<ExecutionContext>,
    step_timeout: Option<u64>,
    approval_timeout: u64,
}

impl StepTask {
    fn finished(&self, result: StepResult) -> TaskOutput {
        TaskOutput::Finished {
            idx: self.idx,
            result,
            suspension: None,
        }
    }

    async fn execute(self) -> TaskOutput {
        let step = &self.step;
        let ctx = &self.ctx;

        if ctx.is_cancelled() {
            return self.finished(StepResult::aborted(step.id.clone()));
        }

        let executor = match self.registry.resolve(step) {
            Ok(executor) => executor,
            Err(e) => return self.finished(StepResult::failed(step.id.clone(), e.to_string())),
        };
        let kind = self.registry.effective_kind(step);

        let upstream = ctx.upstream(&step.depends_on).await;
        let step_ctx = StepContext::new(
            step.id.clone(),
            Arc::clone(ctx),
            self.event_bus
                .create_emitter(ctx.run_id, ctx.thread_id.clone(), step.id.clone()),
        )
        .with_worker(self.worker.clone())
        .with_upstream(upstream);
        let started_at = step_ctx.started_at;

        self.event_bus.emit(RunEvent::StepStarted {
            run_id: ctx.run_id,
            thread_id: ctx.thread_id.clone(),
            step_id: step.id.clone(),
            kind,
            worker_id: self.worker.as_ref().map(|w| w.worker_id().to_string()),
            timestamp: started_at,
        });
        tracing::debug!(step_id = %step.id, %kind, "dispatching step");

        let cancel = ctx.cancellation_token();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(StepError::Cancelled),
            outcome = with_timeout(executor.execute(step, step_ctx), self.step_timeout) => outcome,
        };

        let result = match outcome {
            Ok(result) => result,
            Err(StepError::Cancelled) => StepResult::aborted(step.id.clone()),
            Err(e) => StepResult::failed(step.id.clone(), e.to_string()),
        };
        let result = match result.started_at {
            Some(_) => result,
            None => result.with_started_at(started_at),
        };

        if let (StepStatus::Completed, Some(spec)) = (result.status, &step.approval) {
            if !ctx.is_cancelled() {
                let prompt = spec
                    .prompt
                    .clone()
                    .unwrap_or_else(|| format!("Approve the output of step '{}'?", step.display_name()));
                let suspension = self
                    .gate
                    .request(
                        ctx.run_id,
                        &ctx.thread_id,
                        &step.id,
                        prompt,
                        spec.timeout_seconds.unwrap_or(self.approval_timeout),
                        spec.risk_level,
                    )
                    .await;
                return TaskOutput::Finished {
                    idx: self.idx,
                    result: result.into_waiting(),
                    suspension: Some(suspension),
                };
            }
        }

        self.finished(result)
    }
}

async fn with_timeout<F>(execution: F, seconds: Option<u64>) -> Result<StepResult, StepError>
where
    F: Future<Output = Result<StepResult, StepError>>,
{
    match seconds {
        Some(seconds) => match timeout(Duration::from_secs(seconds), execution).await {
            Ok(outcome) => outcome,
            Err(_) => Err(StepError::Timeout { seconds }),
        },
        None => execution.await,
    }
}

/// Hold a gated step's output until its approval is decided or the run aborts.
async fn wait_for_decision(
    idx: StepIndex,
    held: StepResult,
    suspension: Suspension,
    cancel: tokio_util::sync::CancellationToken,
) -> TaskOutput {
    let outcome = tokio::select! {
        outcome = suspension.resume => outcome.unwrap_or(ApprovalOutcome::Aborted),
        _ = cancel.cancelled() => ApprovalOutcome::Aborted,
    };

    let result = match outcome {
        ApprovalOutcome::Approved { .. } => held.with_status(StepStatus::Completed),
        ApprovalOutcome::Rejected { comment } => {
            let reason = match comment {
                Some(comment) => format!("approval rejected: {}", comment),
                None => "approval rejected".to_string(),
            };
            held.with_status(StepStatus::Failed).with_error(reason)
        }
        ApprovalOutcome::Aborted => held
            .with_status(StepStatus::Expired)
            .with_error("approval expired: run aborted"),
    };

    TaskOutput::Resumed { idx, result }
}

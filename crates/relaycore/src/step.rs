use crate::{
    events::StepEmitter, ExecutionContext, ResolvedWorker, SessionKey, StepError, StepId, StepKind,
    StepResult, UpstreamOutput, WorkflowStep,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Core trait that all step executors implement
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// The step kind this executor is registered under
    fn kind(&self) -> StepKind;

    /// Whether this executor accepts the given step
    fn can_handle(&self, _step: &WorkflowStep) -> bool {
        true
    }

    /// Short human description, for listings
    fn description(&self) -> &str {
        ""
    }

    /// Execute the step. Returning `Err` marks the step failed; executors
    /// that capture a failure themselves may also return a failed result.
    async fn execute(&self, step: &WorkflowStep, ctx: StepContext) -> Result<StepResult, StepError>;
}

/// Execution context passed to each executor
#[derive(Clone)]
pub struct StepContext {
    pub step_id: StepId,

    /// The run this step belongs to
    pub run: Arc<ExecutionContext>,

    /// Resolved worker, when the step carries a worker reference
    pub worker: Option<ResolvedWorker>,

    /// Outputs of the step's dependencies, in declaration order
    pub upstream: Vec<UpstreamOutput>,

    /// Event emitter for real-time updates
    pub events: StepEmitter,

    /// Cancellation token of the run
    pub cancellation: CancellationToken,

    pub started_at: DateTime<Utc>,
}

impl StepContext {
    pub fn new(step_id: impl Into<String>, run: Arc<ExecutionContext>, events: StepEmitter) -> Self {
        let cancellation = run.cancellation_token();
        Self {
            step_id: step_id.into(),
            run,
            worker: None,
            upstream: Vec::new(),
            events,
            cancellation,
            started_at: Utc::now(),
        }
    }

    pub fn with_worker(mut self, worker: Option<ResolvedWorker>) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_upstream(mut self, upstream: Vec<UpstreamOutput>) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Return `Cancelled` if the run has been aborted.
    pub fn check_cancelled(&self) -> Result<(), StepError> {
        if self.is_cancelled() {
            Err(StepError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn require_worker(&self) -> Result<&ResolvedWorker, StepError> {
        self.worker
            .as_ref()
            .ok_or_else(|| StepError::Configuration(format!("step '{}' has no resolved worker", self.step_id)))
    }

    pub fn session_key(&self) -> Option<SessionKey> {
        self.worker
            .as_ref()
            .map(|w| SessionKey::new(self.run.project_id.clone(), w.worker_id()))
    }

    /// Upstream outputs joined into one text block.
    pub fn upstream_text(&self) -> String {
        self.upstream
            .iter()
            .map(|u| u.output.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// A completed result stamped with this step's start time.
    pub fn completed(&self, output: impl Into<String>) -> StepResult {
        StepResult::completed(self.step_id.clone(), output).with_started_at(self.started_at)
    }

    pub fn failed(&self, error: impl Into<String>) -> StepResult {
        StepResult::failed(self.step_id.clone(), error).with_started_at(self.started_at)
    }
}

use crate::{SessionHandle, SessionKey, StepId, StepResult, StepStatus, UpstreamOutput, WorkflowId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type RunId = Uuid;

/// Mutable state of one workflow run, shared by all of its steps.
///
/// Each step only ever writes under its own step id, so concurrent steps
/// never contend for the same key.
pub struct ExecutionContext {
    pub run_id: RunId,
    pub thread_id: String,
    pub project_id: Option<String>,
    pub workflow_id: WorkflowId,
    pub started_at: DateTime<Utc>,
    outputs: RwLock<HashMap<StepId, String>>,
    results: RwLock<HashMap<StepId, StepResult>>,
    sessions: RwLock<HashMap<SessionKey, SessionHandle>>,
    cancellation: CancellationToken,
}

impl ExecutionContext {
    pub fn new(
        run_id: RunId,
        thread_id: impl Into<String>,
        project_id: Option<String>,
        workflow_id: WorkflowId,
    ) -> Self {
        Self {
            run_id,
            thread_id: thread_id.into(),
            project_id,
            workflow_id,
            started_at: Utc::now(),
            outputs: RwLock::new(HashMap::new()),
            results: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            cancellation: CancellationToken::new(),
        }
    }

    /// Store a step's result; completed outputs become visible to dependents.
    pub async fn record(&self, result: StepResult) {
        if result.status == StepStatus::Completed {
            if let Some(output) = &result.output {
                self.outputs
                    .write()
                    .await
                    .insert(result.step_id.clone(), output.clone());
            }
        }
        self.results
            .write()
            .await
            .insert(result.step_id.clone(), result);
    }

    pub async fn output(&self, step_id: &str) -> Option<String> {
        self.outputs.read().await.get(step_id).cloned()
    }

    pub async fn result(&self, step_id: &str) -> Option<StepResult> {
        self.results.read().await.get(step_id).cloned()
    }

    pub async fn results(&self) -> HashMap<StepId, StepResult> {
        self.results.read().await.clone()
    }

    pub async fn outputs(&self) -> HashMap<StepId, String> {
        self.outputs.read().await.clone()
    }

    /// Completed outputs of the given steps, in the given order.
    pub async fn upstream(&self, step_ids: &[StepId]) -> Vec<UpstreamOutput> {
        let results = self.results.read().await;
        step_ids
            .iter()
            .filter_map(|id| results.get(id))
            .filter(|r| r.status == StepStatus::Completed)
            .map(|r| UpstreamOutput {
                step_id: r.step_id.clone(),
                output: r.output.clone().unwrap_or_default(),
                structured: r.structured.clone(),
            })
            .collect()
    }

    pub async fn session(&self, key: &SessionKey) -> Option<SessionHandle> {
        self.sessions.read().await.get(key).cloned()
    }

    pub async fn bind_session(&self, handle: SessionHandle) {
        self.sessions.write().await.insert(handle.key.clone(), handle);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Signal cancellation to every step of the run.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}

use crate::config::RuntimeConfig;
use crate::directory::WorkerDirectory;
use crate::gate::ApprovalGate;
use crate::orchestrator::{Orchestrator, RunOutcome, RunPlan};
use crate::registry::{ExecutorInfo, ExecutorRegistry};
use crate::resolver::AgentResolver;
use relaycore::{
    Decision, EventBus, ExecutionContext, OverdueAlert, PendingApproval, RelayError, RunEvent,
    RunId, RunStatus, StepGraph, StepId, StepResult, ThreadSubscription, ValidationError,
    ValidationErrors, WorkflowDefinition, WorkflowId,
};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Handle to a submitted run
pub struct RunHandle {
    pub run_id: RunId,
    pub thread_id: String,
    join: JoinHandle<RunOutcome>,
}

impl RunHandle {
    /// Wait for the run to finish
    pub async fn wait(self) -> Result<RunOutcome, RelayError> {
        self.join
            .await
            .map_err(|e| RelayError::Execution(format!("Run task failed: {}", e)))
    }
}

/// Point-in-time view of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub thread_id: String,
    pub project_id: Option<String>,
    pub workflow_id: WorkflowId,
    pub workflow_name: String,
    pub status: RunStatus,
    pub results: HashMap<StepId, StepResult>,
}

enum RunEntry {
    Active {
        context: Arc<ExecutionContext>,
        workflow_name: String,
    },
    /// The context is gone once a run terminates; only its summary stays.
    Finished(RunSummary),
}

impl RunEntry {
    fn thread_id(&self) -> &str {
        match self {
            RunEntry::Active { context, .. } => &context.thread_id,
            RunEntry::Finished(summary) => &summary.thread_id,
        }
    }

    fn is_active(&self) -> bool {
        matches!(self, RunEntry::Active { .. })
    }
}

#[derive(Default)]
struct RunTable {
    entries: HashMap<RunId, RunEntry>,
    /// Finished runs, oldest first
    finished: VecDeque<RunId>,
}

impl RunTable {
    fn thread_busy(&self, thread_id: &str) -> bool {
        self.entries
            .values()
            .any(|e| e.is_active() && e.thread_id() == thread_id)
    }

    fn has_thread(&self, thread_id: &str) -> bool {
        self.entries.values().any(|e| e.thread_id() == thread_id)
    }

    /// Swap a run's context for its summary and evict the oldest finished
    /// runs past `retain`. Returns the threads left with no runs.
    fn finish(&mut self, summary: RunSummary, retain: usize) -> Vec<String> {
        let run_id = summary.run_id;
        self.entries.insert(run_id, RunEntry::Finished(summary));
        self.finished.push_back(run_id);

        let mut orphaned = Vec::new();
        while self.finished.len() > retain {
            let Some(evicted) = self.finished.pop_front() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&evicted) {
                let thread_id = entry.thread_id().to_string();
                if !self.has_thread(&thread_id) && !orphaned.contains(&thread_id) {
                    orphaned.push(thread_id);
                }
            }
        }
        orphaned
    }

    /// Drop the finished runs of a thread.
    fn remove_thread(&mut self, thread_id: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.is_active() || e.thread_id() != thread_id);
        let entries = &self.entries;
        self.finished.retain(|id| entries.contains_key(id));
        before - self.entries.len()
    }
}

/// Main runtime for executing workflows
pub struct RelayRuntime {
    config: RuntimeConfig,
    registry: Arc<ExecutorRegistry>,
    resolver: AgentResolver,
    gate: Arc<ApprovalGate>,
    event_bus: Arc<EventBus>,
    orchestrator: Arc<Orchestrator>,
    runs: Arc<RwLock<RunTable>>,
}

impl RelayRuntime {
    /// Create a runtime from explicitly built parts. The registry's mock
    /// routing follows `config.use_mock`.
    pub fn new(
        config: RuntimeConfig,
        mut registry: ExecutorRegistry,
        directory: Arc<WorkerDirectory>,
    ) -> Self {
        registry.set_use_mock(config.use_mock);
        let registry = Arc::new(registry);
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let gate = Arc::new(ApprovalGate::new(Arc::clone(&event_bus), config.overdue));
        let orchestrator = Arc::new(
            Orchestrator::new(
                Arc::clone(&registry),
                Arc::clone(&gate),
                Arc::clone(&event_bus),
                config.max_parallel_steps,
            )
            .with_default_step_timeout(config.default_step_timeout_secs)
            .with_default_approval_timeout(config.default_approval_timeout_secs),
        );

        Self {
            config,
            registry,
            resolver: AgentResolver::new(directory),
            gate,
            event_bus,
            orchestrator,
            runs: Arc::new(RwLock::new(RunTable::default())),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    pub fn directory(&self) -> &Arc<WorkerDirectory> {
        self.resolver.directory()
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    /// Get the event bus for direct access
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Subscribe to events of every run
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.event_bus.subscribe()
    }

    pub fn subscribe_thread(&self, thread_id: impl Into<String>) -> ThreadSubscription {
        self.event_bus.subscribe_thread(thread_id)
    }

    pub fn kinds(&self) -> Vec<ExecutorInfo> {
        self.registry.list_executors()
    }

    /// Check a definition without running it. Graph and worker problems
    /// are all reported; an empty list means the definition would run.
    pub async fn validate(
        &self,
        definition: &WorkflowDefinition,
        project_id: Option<&str>,
    ) -> Result<Vec<ValidationError>, RelayError> {
        match self.plan(definition, project_id).await {
            Ok(_) => Ok(Vec::new()),
            Err(RelayError::Validation(errors)) => Ok(errors.0),
            Err(other) => Err(other),
        }
    }

    async fn plan(
        &self,
        definition: &WorkflowDefinition,
        project_id: Option<&str>,
    ) -> Result<RunPlan, RelayError> {
        let mut errors = ValidationErrors::default();

        let graph = match StepGraph::build(definition) {
            Ok(graph) => Some(graph),
            Err(e) => {
                errors.push(e);
                None
            }
        };

        let workers = match self.resolver.resolve_all(definition, project_id).await {
            Ok(workers) => workers,
            Err(RelayError::Validation(worker_errors)) => {
                errors.extend(worker_errors);
                HashMap::new()
            }
            Err(other) => return Err(other),
        };

        let graph = match graph {
            Some(graph) if errors.is_empty() => graph,
            _ => return Err(errors.into()),
        };

        for step in &definition.steps {
            self.registry.resolve(step)?;
        }

        Ok(RunPlan {
            definition: Arc::new(definition.clone()),
            graph,
            workers,
        })
    }

    /// Validate and start a run. The thread id defaults to the run id.
    pub async fn submit(
        &self,
        definition: &WorkflowDefinition,
        project_id: Option<String>,
        thread_id: Option<String>,
    ) -> Result<RunHandle, RelayError> {
        let plan = self.plan(definition, project_id.as_deref()).await?;

        let run_id = Uuid::new_v4();
        let thread_id = thread_id.unwrap_or_else(|| run_id.to_string());

        let mut runs = self.runs.write().await;
        if runs.thread_busy(&thread_id) {
            return Err(RelayError::ThreadBusy { thread_id });
        }

        let context = Arc::new(ExecutionContext::new(
            run_id,
            thread_id.clone(),
            project_id,
            definition.id,
        ));
        runs.entries.insert(
            run_id,
            RunEntry::Active {
                context: Arc::clone(&context),
                workflow_name: definition.name.clone(),
            },
        );
        drop(runs);

        let orchestrator = Arc::clone(&self.orchestrator);
        let runs = Arc::clone(&self.runs);
        let gate = Arc::clone(&self.gate);
        let retain = self.config.max_retained_runs;
        let workflow_name = definition.name.clone();
        let join = tokio::spawn(async move {
            let outcome = orchestrator.run(plan, Arc::clone(&context)).await;
            let summary = RunSummary {
                run_id,
                thread_id: context.thread_id.clone(),
                project_id: context.project_id.clone(),
                workflow_id: context.workflow_id,
                workflow_name,
                status: outcome.status,
                results: outcome.results.clone(),
            };
            drop(context);

            let orphaned = runs.write().await.finish(summary, retain);
            for thread_id in orphaned {
                let forgotten = gate.forget_thread(&thread_id).await;
                tracing::debug!(%thread_id, forgotten, "evicted thread history");
            }
            outcome
        });

        Ok(RunHandle {
            run_id,
            thread_id,
            join,
        })
    }

    /// Submit a run and wait for it to finish
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        project_id: Option<String>,
    ) -> Result<RunOutcome, RelayError> {
        self.submit(definition, project_id, None).await?.wait().await
    }

    /// Abort a run. Aborting a finished run is a no-op.
    pub async fn abort(&self, run_id: RunId) -> Result<(), RelayError> {
        let runs = self.runs.read().await;
        match runs.entries.get(&run_id) {
            None => Err(RelayError::RunNotFound(run_id)),
            Some(RunEntry::Finished(_)) => Ok(()),
            Some(RunEntry::Active { context, .. }) => {
                tracing::info!(%run_id, "abort requested");
                context.cancel();
                Ok(())
            }
        }
    }

    /// Drop the finished runs and settled approvals of a thread. A thread
    /// with an active run is left alone.
    pub async fn forget_thread(&self, thread_id: &str) -> Result<usize, RelayError> {
        let mut runs = self.runs.write().await;
        if runs.thread_busy(thread_id) {
            return Err(RelayError::ThreadBusy {
                thread_id: thread_id.to_string(),
            });
        }
        let removed = runs.remove_thread(thread_id);
        drop(runs);

        let approvals = self.gate.forget_thread(thread_id).await;
        tracing::info!(thread_id, removed, approvals, "thread forgotten");
        Ok(removed)
    }

    pub async fn decide(
        &self,
        thread_id: &str,
        step_id: &str,
        decision: Decision,
        comment: Option<String>,
    ) -> Result<PendingApproval, RelayError> {
        Ok(self.gate.decide(thread_id, step_id, decision, comment).await?)
    }

    pub async fn pending_approvals(&self) -> Vec<PendingApproval> {
        self.gate.pending().await
    }

    pub async fn overdue_approvals(&self) -> Vec<OverdueAlert> {
        self.gate.overdue().await
    }

    pub async fn run_summary(&self, run_id: RunId) -> Option<RunSummary> {
        let runs = self.runs.read().await;
        let entry = runs.entries.get(&run_id)?;
        Some(Self::summarize(entry).await)
    }

    pub async fn list_runs(&self) -> Vec<RunSummary> {
        let runs = self.runs.read().await;
        let mut summaries = Vec::with_capacity(runs.entries.len());
        for entry in runs.entries.values() {
            summaries.push(Self::summarize(entry).await);
        }
        summaries
    }

    async fn summarize(entry: &RunEntry) -> RunSummary {
        match entry {
            RunEntry::Finished(summary) => summary.clone(),
            RunEntry::Active {
                context,
                workflow_name,
            } => RunSummary {
                run_id: context.run_id,
                thread_id: context.thread_id.clone(),
                project_id: context.project_id.clone(),
                workflow_id: context.workflow_id,
                workflow_name: workflow_name.clone(),
                status: RunStatus::Running,
                results: context.results().await,
            },
        }
    }
}

use crate::process::{parse_structured, run_process};
use async_trait::async_trait;
use relaycore::{
    SessionHandle, StepContext, StepError, StepExecutor, StepKind, StepResult, WorkerConfig,
    WorkerReply, WorkerTask, WorkerTransport, WorkflowStep,
};
use std::sync::Arc;
use tokio::process::Command;

/// Hands a step to its resolved worker through a session transport.
///
/// Sessions are keyed by (project, worker) and live for the whole run, so
/// every step routed to the same worker continues the same conversation.
pub struct DelegatedAgentExecutor {
    transport: Arc<dyn WorkerTransport>,
}

impl DelegatedAgentExecutor {
    pub fn new(transport: Arc<dyn WorkerTransport>) -> Self {
        Self { transport }
    }

    async fn session_for(&self, ctx: &StepContext, worker: &WorkerConfig) -> Result<SessionHandle, StepError> {
        let key = ctx
            .session_key()
            .ok_or_else(|| StepError::Configuration(format!("step '{}' has no resolved worker", ctx.step_id)))?;

        if let Some(session) = ctx.run.session(&key).await {
            return Ok(session);
        }

        let session = self.transport.open_session(&key, worker).await?;
        tracing::debug!(session = %key, session_id = %session.session_id, "opened worker session");
        ctx.events.info(format!("Opened session with {}", key));
        ctx.run.bind_session(session.clone()).await;
        Ok(session)
    }
}

#[async_trait]
impl StepExecutor for DelegatedAgentExecutor {
    fn kind(&self) -> StepKind {
        StepKind::DelegatedAgent
    }

    fn can_handle(&self, step: &WorkflowStep) -> bool {
        step.has_worker_ref()
    }

    fn description(&self) -> &str {
        "Delegate the task to a worker agent session"
    }

    async fn execute(&self, step: &WorkflowStep, ctx: StepContext) -> Result<StepResult, StepError> {
        let worker = Arc::clone(&ctx.require_worker()?.config);
        ctx.check_cancelled()?;

        let session = self.session_for(&ctx, &worker).await?;

        let task = WorkerTask {
            run_id: ctx.run.run_id,
            thread_id: ctx.run.thread_id.clone(),
            step_id: step.id.clone(),
            task: step.task.clone(),
            model: step
                .config
                .get_str("model")
                .map(str::to_string)
                .or_else(|| worker.model.clone()),
            instructions: worker.instructions.clone(),
            upstream: ctx.upstream.clone(),
        };

        ctx.check_cancelled()?;
        ctx.events.info(format!("Delegating to worker {}", worker.id));
        let reply = self.transport.deliver(&session, &worker, &task).await?;

        let structured = reply
            .structured
            .clone()
            .or_else(|| parse_structured(&reply.output));
        let result = ctx.completed(reply.output);
        Ok(match structured {
            Some(value) => result.with_structured(value),
            None => result,
        })
    }
}

/// Transport that runs the worker's configured command once per delivery.
///
/// The task is written to stdin as JSON; the session id is passed in the
/// `RELAY_SESSION_ID` environment variable. A JSON reply object with an
/// `output` field is taken as a [`WorkerReply`], anything else as plain text.
pub struct CommandTransport {
    timeout_secs: Option<u64>,
}

impl CommandTransport {
    pub fn new() -> Self {
        Self { timeout_secs: None }
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_secs = Some(seconds);
        self
    }
}

impl Default for CommandTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerTransport for CommandTransport {
    async fn deliver(
        &self,
        session: &SessionHandle,
        worker: &WorkerConfig,
        task: &WorkerTask,
    ) -> Result<WorkerReply, StepError> {
        let command = worker.command.as_ref().ok_or_else(|| {
            StepError::Configuration(format!("worker '{}' has no command configured", worker.id))
        })?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .env("RELAY_SESSION_ID", session.session_id.to_string())
            .env("RELAY_WORKER_ID", &worker.id);

        let input = serde_json::to_vec(task)
            .map_err(|e| StepError::Transport(format!("Failed to encode task: {}", e)))?;

        let output = run_process(cmd, &input, self.timeout_secs)
            .await
            .map_err(|e| match e {
                StepError::Timeout { .. } => e,
                other => StepError::Transport(other.to_string()),
            })?;

        if !output.success {
            return Err(StepError::Transport(format!(
                "worker '{}' exited with code {}: {}",
                worker.id,
                output.exit_code.unwrap_or(-1),
                output.stderr.trim()
            )));
        }
        if !output.stderr.trim().is_empty() {
            tracing::warn!(worker_id = %worker.id, "worker stderr: {}", output.stderr.trim());
        }

        let stdout = output.stdout.trim();
        match serde_json::from_str::<WorkerReply>(stdout) {
            Ok(reply) => Ok(reply),
            Err(_) => Ok(WorkerReply::text(stdout)),
        }
    }
}

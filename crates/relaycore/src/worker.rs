use crate::{RelayError, RunId, StepError, StepId, UpstreamOutput};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// A worker the engine can delegate steps to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    pub role: String,
    /// Model or backend identifier
    #[serde(default)]
    pub model: Option<String>,
    /// Behavior instructions handed to the worker with every task
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// How to spawn the worker process, for process-backed transports
    #[serde(default)]
    pub command: Option<WorkerCommand>,
}

impl WorkerConfig {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            model: None,
            instructions: None,
            capabilities: BTreeSet::new(),
            command: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_command(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.command = Some(WorkerCommand {
            program: program.into(),
            args,
        });
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.role.eq_ignore_ascii_case(role)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Project-scoped binding of a logical role to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub role: String,
    pub worker_config_id: String,
}

impl RoleAssignment {
    pub fn new(role: impl Into<String>, worker_config_id: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            worker_config_id: worker_config_id.into(),
        }
    }
}

/// Lookup boundary to wherever worker configurations are stored.
#[async_trait]
pub trait WorkerSource: Send + Sync {
    async fn get_config(&self, id: &str) -> Result<Option<WorkerConfig>, RelayError>;

    async fn get_all_configs(&self) -> Result<Vec<WorkerConfig>, RelayError>;

    async fn get_project_role_assignments(
        &self,
        project_id: &str,
    ) -> Result<Vec<RoleAssignment>, RelayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionScope {
    Project,
    Global,
}

/// A step's worker reference after resolution. Immutable for the run.
#[derive(Debug, Clone)]
pub struct ResolvedWorker {
    pub config: Arc<WorkerConfig>,
    pub scope: ResolutionScope,
}

impl ResolvedWorker {
    pub fn worker_id(&self) -> &str {
        &self.config.id
    }
}

/// Identity of a worker session: one per (project, worker).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub project_id: Option<String>,
    pub worker_id: String,
}

impl SessionKey {
    pub fn new(project_id: Option<String>, worker_id: impl Into<String>) -> Self {
        Self {
            project_id,
            worker_id: worker_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.project_id {
            Some(project) => write!(f, "{}/{}", project, self.worker_id),
            None => write!(f, "global/{}", self.worker_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub key: SessionKey,
    pub opened_at: DateTime<Utc>,
}

impl SessionHandle {
    pub fn open(key: SessionKey) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            key,
            opened_at: Utc::now(),
        }
    }
}

/// What a worker receives for one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTask {
    pub run_id: RunId,
    pub thread_id: String,
    pub step_id: StepId,
    pub task: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub upstream: Vec<UpstreamOutput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReply {
    pub output: String,
    #[serde(default)]
    pub structured: Option<serde_json::Value>,
}

impl WorkerReply {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            structured: None,
        }
    }
}

/// Delivers tasks to agent processes.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Open a new session for a worker. The default is a purely logical
    /// session with no process behind it until the first delivery.
    async fn open_session(
        &self,
        key: &SessionKey,
        _worker: &WorkerConfig,
    ) -> Result<SessionHandle, StepError> {
        Ok(SessionHandle::open(key.clone()))
    }

    async fn deliver(
        &self,
        session: &SessionHandle,
        worker: &WorkerConfig,
        task: &WorkerTask,
    ) -> Result<WorkerReply, StepError>;
}

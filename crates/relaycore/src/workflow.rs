use crate::{RiskLevel, StepError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type WorkflowId = Uuid;
pub type StepId = String;

/// Complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default = "Uuid::new_v4")]
    pub id: WorkflowId,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: WorkflowMetadata,
    pub steps: Vec<WorkflowStep>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            version: default_version(),
            description: None,
            metadata: WorkflowMetadata::default(),
            steps: Vec::new(),
        }
    }

    pub fn add_step(&mut self, step: WorkflowStep) -> StepId {
        let id = step.id.clone();
        self.steps.push(step);
        id
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn find_step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A single step of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: StepId,
    #[serde(default)]
    pub name: Option<String>,
    /// Human description of the work, handed to the executor.
    pub task: String,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    /// Untagged steps are defaulted by the executor registry.
    #[serde(default)]
    pub kind: Option<StepKind>,
    #[serde(default)]
    pub config: StepConfig,
    #[serde(default)]
    pub approval: Option<ApprovalSpec>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            task: task.into(),
            worker_id: None,
            role: None,
            depends_on: Vec::new(),
            kind: None,
            config: StepConfig::default(),
            approval: None,
            timeout_secs: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn with_kind(mut self, kind: StepKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.config.insert(key, value);
        self
    }

    pub fn with_approval(mut self, approval: ApprovalSpec) -> Self {
        self.approval = Some(approval);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_secs = Some(seconds);
        self
    }

    /// The declared worker reference, if exactly one of id / role is set.
    pub fn worker_ref(&self) -> Option<WorkerRef> {
        match (&self.worker_id, &self.role) {
            (Some(id), None) => Some(WorkerRef::Id(id.clone())),
            (None, Some(role)) => Some(WorkerRef::Role(role.clone())),
            _ => None,
        }
    }

    pub fn has_worker_ref(&self) -> bool {
        self.worker_id.is_some() || self.role.is_some()
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// How a step names the worker it is delegated to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkerRef {
    Id(String),
    Role(String),
}

impl fmt::Display for WorkerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerRef::Id(id) => write!(f, "id '{}'", id),
            WorkerRef::Role(role) => write!(f, "role '{}'", role),
        }
    }
}

/// Closed set of step kinds; each one maps to exactly one executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    DelegatedAgent,
    Mock,
    ScriptedOperator,
    SandboxedScript,
    ExternalCallback,
}

impl StepKind {
    pub const ALL: [StepKind; 5] = [
        StepKind::DelegatedAgent,
        StepKind::Mock,
        StepKind::ScriptedOperator,
        StepKind::SandboxedScript,
        StepKind::ExternalCallback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::DelegatedAgent => "delegated_agent",
            StepKind::Mock => "mock",
            StepKind::ScriptedOperator => "scripted_operator",
            StepKind::SandboxedScript => "sandboxed_script",
            StepKind::ExternalCallback => "external_callback",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        StepKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| format!("unknown step kind: {}", s))
    }
}

/// Marks a step as approval-gated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalSpec {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub risk_level: Option<RiskLevel>,
}

impl ApprovalSpec {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            timeout_seconds: None,
            risk_level: None,
        }
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk_level = Some(risk);
        self
    }
}

/// Kind-specific configuration bag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepConfig(HashMap<String, serde_json::Value>);

impl StepConfig {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(|v| v.as_u64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(|v| v.as_bool())
    }

    /// String array, or a single string treated as a one-element list.
    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    /// Get required string config or return error
    pub fn require_str(&self, key: &str) -> Result<&str, StepError> {
        self.get_str(key)
            .ok_or_else(|| StepError::Configuration(format!("Missing config: {}", key)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

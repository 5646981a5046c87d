use crate::StepId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    WaitingForApproval,
    Expired,
    Aborted,
    BlockedByFailure,
}

impl StepStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, StepStatus::Completed)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::WaitingForApproval)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::WaitingForApproval => "waiting_for_approval",
            StepStatus::Expired => "expired",
            StepStatus::Aborted => "aborted",
            StepStatus::BlockedByFailure => "blocked_by_failure",
        };
        f.write_str(s)
    }
}

/// Outcome of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: StepId,
    pub status: StepStatus,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub structured: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepResult {
    fn new(step_id: impl Into<String>, status: StepStatus) -> Self {
        Self {
            step_id: step_id.into(),
            status,
            output: None,
            structured: None,
            error: None,
            started_at: None,
            finished_at: Some(Utc::now()),
        }
    }

    pub fn completed(step_id: impl Into<String>, output: impl Into<String>) -> Self {
        let mut result = Self::new(step_id, StepStatus::Completed);
        result.output = Some(output.into());
        result
    }

    pub fn failed(step_id: impl Into<String>, error: impl Into<String>) -> Self {
        let mut result = Self::new(step_id, StepStatus::Failed);
        result.error = Some(error.into());
        result
    }

    pub fn aborted(step_id: impl Into<String>) -> Self {
        let mut result = Self::new(step_id, StepStatus::Aborted);
        result.error = Some("run aborted".to_string());
        result
    }

    pub fn blocked(step_id: impl Into<String>, failed_dependency: &str) -> Self {
        let mut result = Self::new(step_id, StepStatus::BlockedByFailure);
        result.error = Some(format!("blocked by failed step '{}'", failed_dependency));
        result.finished_at = None;
        result
    }

    pub fn with_structured(mut self, value: serde_json::Value) -> Self {
        self.structured = Some(value);
        self
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self
    }

    /// Hold a finished result while its approval is outstanding.
    pub fn into_waiting(mut self) -> Self {
        self.status = StepStatus::WaitingForApproval;
        self.finished_at = None;
        self
    }

    pub fn with_status(mut self, status: StepStatus) -> Self {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

/// Output of a completed dependency, as seen by a downstream step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamOutput {
    pub step_id: StepId,
    pub output: String,
    #[serde(default)]
    pub structured: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

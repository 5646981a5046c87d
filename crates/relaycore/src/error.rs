use std::fmt;

use thiserror::Error;

use crate::RunId;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Step error: {0}")]
    Step(#[from] StepError),

    #[error("Approval error: {0}")]
    Approval(#[from] ApprovalError),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Thread '{thread_id}' already has an active run")]
    ThreadBusy { thread_id: String },

    #[error("Worker registry error: {0}")]
    Registry(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Problems found before a run starts. Any one of these rejects the whole
/// submission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Workflow has no steps")]
    EmptyWorkflow,

    #[error("Duplicate step id: {step_id}")]
    DuplicateStepId { step_id: String },

    #[error("Step '{step_id}' depends on unknown step '{missing}'")]
    UnknownDependency { step_id: String, missing: String },

    #[error("Cyclic dependency detected at step '{step_id}'")]
    CyclicDependency { step_id: String },

    #[error("Step '{step_id}' declares neither a worker id nor a role")]
    MissingWorkerReference { step_id: String },

    #[error("Step '{step_id}' declares both a worker id and a role")]
    ConflictingWorkerReference { step_id: String },

    #[error("Step '{step_id}' references unknown worker {reference}")]
    UnresolvedWorkerReference { step_id: String, reference: String },
}

impl ValidationError {
    /// The step the error is about, when there is one.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            ValidationError::EmptyWorkflow => None,
            ValidationError::DuplicateStepId { step_id }
            | ValidationError::UnknownDependency { step_id, .. }
            | ValidationError::CyclicDependency { step_id }
            | ValidationError::MissingWorkerReference { step_id }
            | ValidationError::ConflictingWorkerReference { step_id }
            | ValidationError::UnresolvedWorkerReference { step_id, .. } => Some(step_id),
        }
    }
}

/// Every validation problem of one submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }

    pub fn push(&mut self, error: ValidationError) {
        self.0.push(error);
    }

    pub fn extend(&mut self, other: ValidationErrors) {
        self.0.extend(other.0);
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

impl From<ValidationError> for ValidationErrors {
    fn from(error: ValidationError) -> Self {
        ValidationErrors(vec![error])
    }
}

impl From<ValidationError> for RelayError {
    fn from(error: ValidationError) -> Self {
        RelayError::Validation(error.into())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Unsupported step kind '{kind}' for step '{step_id}' (registered: {})", registered.join(", "))]
    UnsupportedStepKind {
        step_id: String,
        kind: String,
        registered: Vec<String>,
    },
}

/// Failure of a single step's executor.
#[derive(Error, Debug, Clone)]
pub enum StepError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Worker transport failed: {0}")]
    Transport(String),

    #[error("Timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Cancelled")]
    Cancelled,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("No approval for step '{step_id}' on thread '{thread_id}'")]
    NotFound { thread_id: String, step_id: String },

    #[error("Approval for step '{step_id}' on thread '{thread_id}' was already {decision}")]
    AlreadyDecided {
        thread_id: String,
        step_id: String,
        decision: String,
    },

    #[error("Approval for step '{step_id}' on thread '{thread_id}' expired with its aborted run")]
    Closed { thread_id: String, step_id: String },
}

//! Core abstractions for the relay orchestration engine
//!
//! This crate provides the workflow model, dependency graph validation,
//! step executor contract, execution context, approval records and the
//! event bus that every other crate builds on.

mod approval;
mod context;
mod error;
pub mod events;
mod graph;
mod result;
mod step;
mod worker;
mod workflow;

pub use approval::{
    rank_overdue, ApprovalState, Decision, OverdueAlert, OverduePolicy, OverdueSeverity,
    PendingApproval, RiskLevel,
};
pub use context::{ExecutionContext, RunId};
pub use error::{
    ApprovalError, DispatchError, RelayError, StepError, ValidationError, ValidationErrors,
};
pub use events::*;
pub use graph::{StepGraph, StepIndex};
pub use result::{RunStatus, StepResult, StepStatus, UpstreamOutput};
pub use step::{StepContext, StepExecutor};
pub use worker::{
    ResolutionScope, ResolvedWorker, RoleAssignment, SessionHandle, SessionKey, WorkerCommand,
    WorkerConfig, WorkerReply, WorkerSource, WorkerTask, WorkerTransport,
};
pub use workflow::{
    ApprovalSpec, StepConfig, StepId, StepKind, WorkerRef, WorkflowDefinition, WorkflowId,
    WorkflowMetadata, WorkflowStep,
};

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

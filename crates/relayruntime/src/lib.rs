//! Workflow execution runtime
//!
//! This crate provides the engine that runs workflows: the executor
//! registry, worker resolution, the approval gate and the dependency-driven
//! orchestration loop.

mod config;
mod directory;
mod gate;
mod orchestrator;
mod registry;
mod resolver;
mod runtime;

pub use config::{ConfigError, RuntimeConfig};
pub use directory::{ProjectAssignments, StaticWorkerSource, WorkerDirectory, WorkersFile};
pub use gate::{ApprovalGate, ApprovalOutcome, Suspension};
pub use orchestrator::{Orchestrator, RunOutcome, RunPlan};
pub use registry::{ExecutorInfo, ExecutorRegistry};
pub use resolver::AgentResolver;
pub use runtime::{RelayRuntime, RunHandle, RunSummary};

use crate::{
    Decision, OverdueSeverity, PendingApproval, RiskLevel, RunId, RunStatus, StepId, StepKind,
    WorkflowId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Events emitted during a workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        thread_id: String,
        workflow_id: WorkflowId,
        workflow_name: String,
        step_count: usize,
        timestamp: DateTime<Utc>,
    },
    StepStarted {
        run_id: RunId,
        thread_id: String,
        step_id: StepId,
        kind: StepKind,
        worker_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    StepCompleted {
        run_id: RunId,
        thread_id: String,
        step_id: StepId,
        output: Option<String>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    StepFailed {
        run_id: RunId,
        thread_id: String,
        step_id: StepId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    StepBlocked {
        run_id: RunId,
        thread_id: String,
        step_id: StepId,
        failed_dependency: StepId,
        timestamp: DateTime<Utc>,
    },
    StepAborted {
        run_id: RunId,
        thread_id: String,
        step_id: StepId,
        timestamp: DateTime<Utc>,
    },
    StepEvent {
        run_id: RunId,
        thread_id: String,
        step_id: StepId,
        event: StepEvent,
        timestamp: DateTime<Utc>,
    },
    ApprovalRequested {
        run_id: RunId,
        approval: ApprovalNotice,
    },
    ApprovalProcessed {
        run_id: RunId,
        approval: ApprovalNotice,
        decision: Decision,
        comment: Option<String>,
    },
    ApprovalOverdue {
        run_id: RunId,
        approval: ApprovalNotice,
        severity: OverdueSeverity,
        overdue_secs: i64,
    },
    ApprovalExpired {
        run_id: RunId,
        approval: ApprovalNotice,
        reason: String,
    },
    RunCompleted {
        run_id: RunId,
        thread_id: String,
        status: RunStatus,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    RunAborted {
        run_id: RunId,
        thread_id: String,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::StepStarted { run_id, .. }
            | RunEvent::StepCompleted { run_id, .. }
            | RunEvent::StepFailed { run_id, .. }
            | RunEvent::StepBlocked { run_id, .. }
            | RunEvent::StepAborted { run_id, .. }
            | RunEvent::StepEvent { run_id, .. }
            | RunEvent::ApprovalRequested { run_id, .. }
            | RunEvent::ApprovalProcessed { run_id, .. }
            | RunEvent::ApprovalOverdue { run_id, .. }
            | RunEvent::ApprovalExpired { run_id, .. }
            | RunEvent::RunCompleted { run_id, .. }
            | RunEvent::RunAborted { run_id, .. } => *run_id,
        }
    }

    pub fn thread_id(&self) -> &str {
        match self {
            RunEvent::RunStarted { thread_id, .. }
            | RunEvent::StepStarted { thread_id, .. }
            | RunEvent::StepCompleted { thread_id, .. }
            | RunEvent::StepFailed { thread_id, .. }
            | RunEvent::StepBlocked { thread_id, .. }
            | RunEvent::StepAborted { thread_id, .. }
            | RunEvent::StepEvent { thread_id, .. }
            | RunEvent::RunCompleted { thread_id, .. }
            | RunEvent::RunAborted { thread_id, .. } => thread_id,
            RunEvent::ApprovalRequested { approval, .. }
            | RunEvent::ApprovalProcessed { approval, .. }
            | RunEvent::ApprovalOverdue { approval, .. }
            | RunEvent::ApprovalExpired { approval, .. } => &approval.thread_id,
        }
    }
}

/// Approval payload carried by approval lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalNotice {
    pub thread_id: String,
    pub step_id: StepId,
    pub prompt: String,
    pub timeout_seconds: u64,
    pub requested_at: DateTime<Utc>,
    pub risk_level: Option<RiskLevel>,
}

impl From<&PendingApproval> for ApprovalNotice {
    fn from(approval: &PendingApproval) -> Self {
        Self {
            thread_id: approval.thread_id.clone(),
            step_id: approval.step_id.clone(),
            prompt: approval.prompt.clone(),
            timeout_seconds: approval.timeout_seconds,
            requested_at: approval.requested_at,
            risk_level: approval.risk_level,
        }
    }
}

/// Events specific to step execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum StepEvent {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
}

/// Event emitter for executors to send real-time updates
#[derive(Clone)]
pub struct StepEmitter {
    run_id: RunId,
    thread_id: String,
    step_id: StepId,
    sender: broadcast::Sender<RunEvent>,
}

impl StepEmitter {
    pub fn new(
        run_id: RunId,
        thread_id: impl Into<String>,
        step_id: impl Into<String>,
        sender: broadcast::Sender<RunEvent>,
    ) -> Self {
        Self {
            run_id,
            thread_id: thread_id.into(),
            step_id: step_id.into(),
            sender,
        }
    }

    /// Emit a step-specific event
    pub fn emit(&self, event: StepEvent) {
        let _ = self.sender.send(RunEvent::StepEvent {
            run_id: self.run_id,
            thread_id: self.thread_id.clone(),
            step_id: self.step_id.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(StepEvent::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(StepEvent::Warning {
            message: message.into(),
        });
    }

    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(StepEvent::Progress { percent, message });
    }
}

/// Broadcasts run and approval lifecycle events to every subscriber.
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the events of a single thread.
    pub fn subscribe_thread(&self, thread_id: impl Into<String>) -> ThreadSubscription {
        ThreadSubscription {
            thread_id: thread_id.into(),
            receiver: self.sender.subscribe(),
        }
    }

    pub fn emit(&self, event: RunEvent) {
        tracing::trace!(thread_id = event.thread_id(), "emitting run event");
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(
        &self,
        run_id: RunId,
        thread_id: impl Into<String>,
        step_id: impl Into<String>,
    ) -> StepEmitter {
        StepEmitter::new(run_id, thread_id, step_id, self.sender.clone())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

pub struct ThreadSubscription {
    thread_id: String,
    receiver: broadcast::Receiver<RunEvent>,
}

impl ThreadSubscription {
    /// Next event of this thread. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<RunEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.thread_id() == self.thread_id => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(thread_id = %self.thread_id, skipped, "subscriber lagged behind");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

//! Approval gate: holds gated steps until a human decides.
//!
//! Each gated step registers a [`PendingApproval`] together with a oneshot
//! sender. The orchestration loop keeps the matching receiver (the
//! [`Suspension`]) and resumes the step once [`ApprovalGate::decide`]
//! fires it. Deadlines only escalate: an expired approval stays decidable.

use chrono::Utc;
use relaycore::{
    ApprovalError, ApprovalNotice, ApprovalState, Decision, EventBus, OverdueAlert,
    OverduePolicy, PendingApproval, RiskLevel, RunEvent, RunId, StepId, rank_overdue,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

/// How a suspended step is resumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved { comment: Option<String> },
    Rejected { comment: Option<String> },
    /// The run was aborted while the approval was outstanding
    Aborted,
}

/// Continuation of a step waiting for approval.
#[derive(Debug)]
pub struct Suspension {
    pub run_id: RunId,
    pub step_id: StepId,
    pub resume: oneshot::Receiver<ApprovalOutcome>,
}

type ApprovalKey = (String, StepId);

struct PendingEntry {
    approval: PendingApproval,
    resume: oneshot::Sender<ApprovalOutcome>,
    watcher: CancellationToken,
}

#[derive(Default)]
struct GateState {
    pending: HashMap<ApprovalKey, PendingEntry>,
    /// Decided and abort-expired approvals, per (thread, step)
    ledger: HashMap<ApprovalKey, PendingApproval>,
}

pub struct ApprovalGate {
    state: Mutex<GateState>,
    event_bus: Arc<EventBus>,
    policy: OverduePolicy,
}

fn key(thread_id: &str, step_id: &str) -> ApprovalKey {
    (thread_id.to_string(), step_id.to_string())
}

impl ApprovalGate {
    pub fn new(event_bus: Arc<EventBus>, policy: OverduePolicy) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            event_bus,
            policy,
        }
    }

    pub fn policy(&self) -> &OverduePolicy {
        &self.policy
    }

    /// Register an approval for a finished step and hand back its continuation.
    pub async fn request(
        self: &Arc<Self>,
        run_id: RunId,
        thread_id: &str,
        step_id: &str,
        prompt: impl Into<String>,
        timeout_seconds: u64,
        risk_level: Option<RiskLevel>,
    ) -> Suspension {
        let mut approval = PendingApproval::new(run_id, thread_id, step_id, prompt, timeout_seconds)
            .with_risk(risk_level);
        let (resume_tx, resume_rx) = oneshot::channel();
        let watcher = CancellationToken::new();

        approval.state = ApprovalState::Pending;
        let notice = ApprovalNotice::from(&approval);
        let approval_key = key(thread_id, step_id);

        {
            let mut state = self.state.lock().await;
            state.ledger.remove(&approval_key);
            if let Some(previous) = state.pending.insert(
                approval_key.clone(),
                PendingEntry {
                    approval,
                    resume: resume_tx,
                    watcher: watcher.clone(),
                },
            ) {
                tracing::warn!(thread_id, step_id, "replacing an outstanding approval");
                previous.watcher.cancel();
            }
        }

        tracing::info!(thread_id, step_id, timeout_seconds, "approval requested");
        self.event_bus.emit(RunEvent::ApprovalRequested {
            run_id,
            approval: notice,
        });

        let gate = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = watcher.cancelled() => {}
                _ = tokio::time::sleep(std::time::Duration::from_secs(timeout_seconds)) => {
                    gate.expire(&approval_key).await;
                }
            }
        });

        Suspension {
            run_id,
            step_id: step_id.to_string(),
            resume: resume_rx,
        }
    }

    /// Deadline passed: mark expired and raise the overdue signal. The
    /// approval keeps waiting for a decision.
    async fn expire(&self, approval_key: &ApprovalKey) {
        let event = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.pending.get_mut(approval_key) else {
                return;
            };
            if entry.approval.state != ApprovalState::Pending {
                return;
            }
            entry.approval.state = ApprovalState::Expired;

            let overdue = entry
                .approval
                .overdue_by(Utc::now())
                .unwrap_or_else(chrono::Duration::zero);
            let severity = self.policy.classify(overdue, entry.approval.risk_level);
            tracing::warn!(
                thread_id = %entry.approval.thread_id,
                step_id = %entry.approval.step_id,
                %severity,
                "approval overdue"
            );
            RunEvent::ApprovalOverdue {
                run_id: entry.approval.run_id,
                approval: ApprovalNotice::from(&entry.approval),
                severity,
                overdue_secs: overdue.num_seconds(),
            }
        };
        self.event_bus.emit(event);
    }

    /// Record a decision. Each approval transitions exactly once.
    pub async fn decide(
        &self,
        thread_id: &str,
        step_id: &str,
        decision: Decision,
        comment: Option<String>,
    ) -> Result<PendingApproval, ApprovalError> {
        let approval_key = key(thread_id, step_id);
        let mut state = self.state.lock().await;

        let Some(entry) = state.pending.remove(&approval_key) else {
            return Err(match state.ledger.get(&approval_key) {
                Some(record) => match record.decision {
                    Some(previous) => ApprovalError::AlreadyDecided {
                        thread_id: thread_id.to_string(),
                        step_id: step_id.to_string(),
                        decision: previous.to_string(),
                    },
                    None => ApprovalError::Closed {
                        thread_id: thread_id.to_string(),
                        step_id: step_id.to_string(),
                    },
                },
                None => ApprovalError::NotFound {
                    thread_id: thread_id.to_string(),
                    step_id: step_id.to_string(),
                },
            });
        };

        entry.watcher.cancel();
        let mut approval = entry.approval;
        approval.decide(decision, comment.clone());
        state.ledger.insert(approval_key, approval.clone());
        drop(state);

        tracing::info!(thread_id, step_id, %decision, "approval decided");
        self.event_bus.emit(RunEvent::ApprovalProcessed {
            run_id: approval.run_id,
            approval: ApprovalNotice::from(&approval),
            decision,
            comment: comment.clone(),
        });

        let outcome = match decision {
            Decision::Approve => ApprovalOutcome::Approved { comment },
            Decision::Reject => ApprovalOutcome::Rejected { comment },
        };
        if entry.resume.send(outcome).is_err() {
            tracing::debug!(thread_id, step_id, "decided approval had no waiting step");
        }

        Ok(approval)
    }

    /// Expire every outstanding approval of an aborted run.
    pub async fn abort_run(&self, run_id: RunId) -> Vec<PendingApproval> {
        let entries: Vec<(ApprovalKey, PendingEntry)> = {
            let mut state = self.state.lock().await;
            let keys: Vec<ApprovalKey> = state
                .pending
                .iter()
                .filter(|(_, e)| e.approval.run_id == run_id)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| state.pending.remove(&k).map(|e| (k, e)))
                .collect()
        };

        let mut expired = Vec::with_capacity(entries.len());
        for (approval_key, entry) in entries {
            entry.watcher.cancel();
            let mut approval = entry.approval;
            approval.state = ApprovalState::Expired;

            self.event_bus.emit(RunEvent::ApprovalExpired {
                run_id,
                approval: ApprovalNotice::from(&approval),
                reason: "run aborted".to_string(),
            });
            let _ = entry.resume.send(ApprovalOutcome::Aborted);

            self.state
                .lock()
                .await
                .ledger
                .insert(approval_key, approval.clone());
            expired.push(approval);
        }

        if !expired.is_empty() {
            tracing::warn!(%run_id, count = expired.len(), "expired approvals of aborted run");
        }
        expired
    }

    /// Look up an approval, outstanding or settled.
    pub async fn get(&self, thread_id: &str, step_id: &str) -> Option<PendingApproval> {
        let approval_key = key(thread_id, step_id);
        let state = self.state.lock().await;
        state
            .pending
            .get(&approval_key)
            .map(|e| e.approval.clone())
            .or_else(|| state.ledger.get(&approval_key).cloned())
    }

    /// Outstanding approvals, oldest request first.
    pub async fn pending(&self) -> Vec<PendingApproval> {
        let mut approvals: Vec<PendingApproval> = self
            .state
            .lock()
            .await
            .pending
            .values()
            .map(|e| e.approval.clone())
            .collect();
        approvals.sort_by_key(|a| a.requested_at);
        approvals
    }

    pub async fn pending_for_thread(&self, thread_id: &str) -> Vec<PendingApproval> {
        self.pending()
            .await
            .into_iter()
            .filter(|a| a.thread_id == thread_id)
            .collect()
    }

    /// Overdue approvals ranked by severity, computed now.
    pub async fn overdue(&self) -> Vec<OverdueAlert> {
        let approvals = self.pending().await;
        rank_overdue(approvals.iter(), Utc::now(), &self.policy)
    }

    /// Drop outstanding approvals of a finished run without resuming them.
    pub async fn release_run(&self, run_id: RunId) {
        let mut state = self.state.lock().await;
        state.pending.retain(|_, entry| {
            let keep = entry.approval.run_id != run_id;
            if !keep {
                entry.watcher.cancel();
            }
            keep
        });
    }

    /// Forget the decision ledger of a thread.
    pub async fn forget_thread(&self, thread_id: &str) -> usize {
        let mut state = self.state.lock().await;
        let before = state.ledger.len();
        state.ledger.retain(|(thread, _), _| thread != thread_id);
        before - state.ledger.len()
    }
}

//! Human approval checkpoints: records, decisions and overdue severity.

use crate::{RunId, StepId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// How many severity bands this risk level escalates an overdue approval.
    fn escalation(&self) -> u8 {
        match self {
            RiskLevel::Low | RiskLevel::Medium => 0,
            RiskLevel::High => 1,
            RiskLevel::Critical => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Requested,
    Pending,
    Approved,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Approve => f.write_str("approved"),
            Decision::Reject => f.write_str("rejected"),
        }
    }
}

/// One approval checkpoint of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub run_id: RunId,
    pub thread_id: String,
    pub step_id: StepId,
    pub prompt: String,
    pub timeout_seconds: u64,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub risk_level: Option<RiskLevel>,
    pub state: ApprovalState,
    #[serde(default)]
    pub decision: Option<Decision>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
}

impl PendingApproval {
    pub fn new(
        run_id: RunId,
        thread_id: impl Into<String>,
        step_id: impl Into<String>,
        prompt: impl Into<String>,
        timeout_seconds: u64,
    ) -> Self {
        Self {
            run_id,
            thread_id: thread_id.into(),
            step_id: step_id.into(),
            prompt: prompt.into(),
            timeout_seconds,
            requested_at: Utc::now(),
            risk_level: None,
            state: ApprovalState::Requested,
            decision: None,
            comment: None,
            decided_at: None,
        }
    }

    pub fn with_risk(mut self, risk: Option<RiskLevel>) -> Self {
        self.risk_level = risk;
        self
    }

    /// `None` when the timeout is too large to land on a representable date.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        i64::try_from(self.timeout_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|timeout| self.requested_at.checked_add_signed(timeout))
    }

    /// Time past the deadline, if the deadline has passed.
    pub fn overdue_by(&self, now: DateTime<Utc>) -> Option<Duration> {
        let overdue = now - self.deadline()?;
        if overdue >= Duration::zero() {
            Some(overdue)
        } else {
            None
        }
    }

    pub fn is_decided(&self) -> bool {
        self.decision.is_some()
    }

    /// Record a decision. Callers check `is_decided` first.
    pub fn decide(&mut self, decision: Decision, comment: Option<String>) {
        self.state = match decision {
            Decision::Approve => ApprovalState::Approved,
            Decision::Reject => ApprovalState::Rejected,
        };
        self.decision = Some(decision);
        self.comment = comment;
        self.decided_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverdueSeverity {
    Warning,
    Error,
    Critical,
}

impl OverdueSeverity {
    fn from_band(band: u8) -> Self {
        match band {
            0 => OverdueSeverity::Warning,
            1 => OverdueSeverity::Error,
            _ => OverdueSeverity::Critical,
        }
    }
}

impl fmt::Display for OverdueSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverdueSeverity::Warning => f.write_str("warning"),
            OverdueSeverity::Error => f.write_str("error"),
            OverdueSeverity::Critical => f.write_str("critical"),
        }
    }
}

/// Thresholds for grading overdue approvals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverduePolicy {
    pub error_after_secs: u64,
    pub critical_after_secs: u64,
}

impl Default for OverduePolicy {
    fn default() -> Self {
        Self {
            error_after_secs: 300,
            critical_after_secs: 1800,
        }
    }
}

impl OverduePolicy {
    /// Grade by time past the deadline, then escalate by declared risk.
    pub fn classify(&self, overdue: Duration, risk: Option<RiskLevel>) -> OverdueSeverity {
        let secs = overdue.num_seconds().max(0) as u64;
        let base: u8 = if secs >= self.critical_after_secs {
            2
        } else if secs >= self.error_after_secs {
            1
        } else {
            0
        };
        let bump = risk.map(|r| r.escalation()).unwrap_or(0);
        OverdueSeverity::from_band(base.saturating_add(bump))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverdueAlert {
    pub approval: PendingApproval,
    pub severity: OverdueSeverity,
    pub overdue_secs: i64,
}

/// Undecided approvals past their deadline, most severe first and, within
/// a severity, longest overdue first. Severity is computed against `now` on
/// every call.
pub fn rank_overdue<'a>(
    approvals: impl IntoIterator<Item = &'a PendingApproval>,
    now: DateTime<Utc>,
    policy: &OverduePolicy,
) -> Vec<OverdueAlert> {
    let mut alerts: Vec<OverdueAlert> = approvals
        .into_iter()
        .filter(|a| !a.is_decided())
        .filter_map(|a| {
            a.overdue_by(now).map(|overdue| OverdueAlert {
                approval: a.clone(),
                severity: policy.classify(overdue, a.risk_level),
                overdue_secs: overdue.num_seconds(),
            })
        })
        .collect();

    alerts.sort_by(|x, y| match y.severity.cmp(&x.severity) {
        Ordering::Equal => y.overdue_secs.cmp(&x.overdue_secs),
        other => other,
    });
    alerts
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::RunId;

/// A pending human decision for an approval-gated node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub run_id: RunId,
    pub node_id: String,
    pub message: String,
    /// Bounded preview of the value awaiting release.
    pub preview: String,
    pub deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Decision supplied by the host through `resolve_approval`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Denied { reason: String },
}

/// How a request was finally resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Approved,
    Denied { reason: String },
    TimedOut,
    /// The owning run was cancelled before a decision arrived.
    Withdrawn,
}

impl From<ApprovalDecision> for ApprovalOutcome {
    fn from(decision: ApprovalDecision) -> Self {
        match decision {
            ApprovalDecision::Approved => Self::Approved,
            ApprovalDecision::Denied { reason } => Self::Denied { reason },
        }
    }
}

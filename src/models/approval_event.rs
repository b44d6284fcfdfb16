use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// ApprovalEvent is the append-only compliance trail for approvals.
/// Maps to `wf.approval_event`. Rows are written in the same atomic change
/// set as the mutation they record, so the trail is never out of sync with
/// state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalEvent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub approval_id: Uuid,
    pub task_id: Option<Uuid>,
    pub kind: String,
    pub payload: Value,
    pub actor: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
}

impl ApprovalEvent {
    pub fn record(
        tenant_id: Uuid,
        approval_id: Uuid,
        task_id: Option<Uuid>,
        kind: &str,
        payload: Value,
        actor: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            approval_id,
            task_id,
            kind: kind.to_string(),
            payload,
            actor,
            occurred_at: Utc::now(),
        }
    }
}

/// ApprovalEscalation records an SLA breach or manual hand-off.
/// Maps to `wf.approval_escalation`. The record itself mutates nothing;
/// the configured escalation policy performs the actual state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalEscalation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub approval_id: Uuid,
    pub task_id: Option<Uuid>,
    pub kind: String,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

impl ApprovalEscalation {
    pub fn record(
        tenant_id: Uuid,
        approval_id: Uuid,
        task_id: Option<Uuid>,
        kind: &str,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            approval_id,
            task_id,
            kind: kind.to_string(),
            payload,
            occurred_at: Utc::now(),
        }
    }
}

/// ApprovalComment is a discussion entry attached to an approval, optionally
/// scoped to one task. Maps to `wf.approval_comment`, which is append-only
/// except for deletion via the privileged `comment.delete` capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalComment {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub approval_id: Uuid,
    pub task_id: Option<Uuid>,
    pub author: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

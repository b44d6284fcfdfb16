use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::approval::{Decision, TaskStatus};

/// ApprovalTask is one approver's action item within a stage.
/// Maps to `wf.approval_task`. A task's lifecycle is owned by its stage;
/// `due_at` is the SLA deadline enforced by a scheduled reminder timer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalTask {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub approval_id: Uuid,
    pub stage_id: Uuid,
    pub order_index: i32,
    pub status: TaskStatus,
    pub decision: Option<Decision>,
    pub reason: Option<String>,
    pub assignee_principal_id: Option<Uuid>,
    /// Retained when the assignee came from group resolution, for audit.
    pub assignee_group_id: Option<Uuid>,
    pub due_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalTask {
    /// True while the task can still receive a decision.
    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// AssignmentSnapshot is the immutable record of who was resolved as an
/// assignee for a stage at resolution time. Maps to
/// `wf.approval_assignment_snapshot`. Created once per resolution and never
/// mutated, so group membership changes never rewrite approval history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentSnapshot {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub approval_id: Uuid,
    pub stage_id: Uuid,
    /// Group the principals were expanded from, when applicable.
    pub assignee_group_id: Option<Uuid>,
    pub resolved_principals: Vec<Uuid>,
    pub resolved_at: DateTime<Utc>,
}

impl AssignmentSnapshot {
    pub fn record(
        tenant_id: Uuid,
        approval_id: Uuid,
        stage_id: Uuid,
        assignee_group_id: Option<Uuid>,
        resolved_principals: Vec<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            approval_id,
            stage_id,
            assignee_group_id,
            resolved_principals,
            resolved_at: Utc::now(),
        }
    }
}

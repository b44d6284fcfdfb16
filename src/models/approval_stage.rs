use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::approval::{Decision, QuorumRule, StageMode, StageStatus};

/// ApprovalStage is an ordered phase within an approval instance.
/// Maps to `wf.approval_stage`. Exactly one stage is `active` at a time;
/// the stage owns its tasks and aggregates their outcomes under `quorum`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalStage {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub approval_id: Uuid,
    pub stage_no: i32,
    pub name: String,
    pub mode: StageMode,
    pub quorum: QuorumRule,
    pub status: StageStatus,
    /// Resolution recorded when the stage completes.
    pub decision: Option<Decision>,
    pub activated_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

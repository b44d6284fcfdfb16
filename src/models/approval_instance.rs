use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::EntityRef;
use crate::approval::{ApprovalStatus, Decision};

/// ApprovalInstance is one approval request against an entity.
/// Maps to `wf.approval_instance`. Becomes terminal when `decision` is
/// finalized; `entity_snapshot` freezes the entity as it looked when the
/// approval was requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalInstance {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub definition_id: Uuid,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub entity_snapshot: Value,
    pub status: ApprovalStatus,
    pub decision: Option<Decision>,
    pub requested_by: Uuid,
    pub org_unit_id: Option<Uuid>,
    pub module_code: Option<String>,
    pub row_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalInstance {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_type.clone(), self.entity_id)
    }
}

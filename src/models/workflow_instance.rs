use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::EntityRef;
use crate::state_machine::InstanceStatus;

/// WorkflowInstance is the runtime execution of a lifecycle against one
/// entity. Maps to `wf.workflow_instance`, unique on
/// `(tenant_id, entity_type, entity_id)`: at most one workflow per entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub lifecycle_id: Uuid,
    /// Bound [`super::LifecycleVersion`]; never changes after creation.
    pub version_id: Uuid,
    pub current_state: String,
    pub previous_state: Option<String>,
    pub status: InstanceStatus,
    /// Organizational unit used for `ou`-constrained capability checks.
    pub org_unit_id: Option<Uuid>,
    /// Module boundary used for `module`-constrained capability checks.
    pub module_code: Option<String>,
    pub row_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_type.clone(), self.entity_id)
    }
}

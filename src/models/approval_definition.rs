use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// ApprovalDefinition is the tenant-scoped multi-stage sign-off template.
/// Maps to `wf.approval_definition`, unique on `(tenant_id, code)`. The raw
/// `rules` payload is parsed into [`crate::approval::ApprovalRules`] once at
/// load time, never re-interpreted per operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDefinition {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub code: String,
    pub entity_type: String,
    pub rules: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// New ApprovalDefinition for creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewApprovalDefinition {
    pub tenant_id: Uuid,
    pub code: String,
    pub entity_type: String,
    pub rules: Value,
}

impl ApprovalDefinition {
    pub fn from_new(new: NewApprovalDefinition) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            code: new.code,
            entity_type: new.entity_type,
            rules: new.rules,
            created_at: now,
            updated_at: now,
        }
    }
}

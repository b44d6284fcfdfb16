use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// LifecycleDefinition is the tenant-scoped state-machine template.
/// Maps to `wf.lifecycle_definition`, unique on `(tenant_id, code)`. The raw
/// `definition` payload stays mutable until a version snapshots it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleDefinition {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub code: String,
    pub entity_type: String,
    pub definition: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// New LifecycleDefinition for creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLifecycleDefinition {
    pub tenant_id: Uuid,
    pub code: String,
    pub entity_type: String,
    pub definition: Value,
}

impl LifecycleDefinition {
    pub fn from_new(new: NewLifecycleDefinition) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            code: new.code,
            entity_type: new.entity_type,
            definition: new.definition,
            created_at: now,
            updated_at: now,
        }
    }
}

/// LifecycleVersion is an immutable snapshot of a definition payload.
/// Maps to `wf.lifecycle_version`, unique on `(lifecycle_id, version)`,
/// monotonically increasing, restrict-on-delete while instances reference it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleVersion {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub lifecycle_id: Uuid,
    pub version: i32,
    pub definition: Value,
    pub created_at: DateTime<Utc>,
}

impl LifecycleVersion {
    /// Snapshot a definition payload as the next version.
    pub fn snapshot(definition: &LifecycleDefinition, version: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: definition.tenant_id,
            lifecycle_id: definition.id,
            version,
            definition: definition.definition.clone(),
            created_at: Utc::now(),
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// WorkflowTransition is the append-only audit record of a state change.
/// Maps to `wf.workflow_transition`. Rows are never updated or deleted;
/// replaying
/// the rows in `sort_key` order from the initial state must reach the
/// instance's `current_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTransition {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub instance_id: Uuid,
    pub from_state: Option<String>,
    pub to_state: String,
    pub triggered_by: Option<Uuid>,
    pub transition_data: Option<Value>,
    /// Monotone per-instance ordering key.
    pub sort_key: i32,
    pub created_at: DateTime<Utc>,
}

impl WorkflowTransition {
    pub fn record(
        tenant_id: Uuid,
        instance_id: Uuid,
        from_state: Option<String>,
        to_state: impl Into<String>,
        triggered_by: Option<Uuid>,
        transition_data: Option<Value>,
        sort_key: i32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            instance_id,
            from_state,
            to_state: to_state.into(),
            triggered_by,
            transition_data,
            sort_key,
            created_at: Utc::now(),
        }
    }
}

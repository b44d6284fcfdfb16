//! # Data Layer
//!
//! One struct per `wf.*` table. These are plain persisted records; all
//! behavior lives in [`crate::state_machine`], [`crate::approval`] and
//! [`crate::scheduler`]. Every row is tenant-partitioned; rows mutated under
//! optimistic concurrency carry a `row_version` bumped on each update.

pub mod approval_definition;
pub mod approval_event;
pub mod approval_instance;
pub mod approval_stage;
pub mod approval_task;
pub mod assignment_snapshot;
pub mod lifecycle_definition;
pub mod timer_schedule;
pub mod workflow_instance;
pub mod workflow_transition;

pub use approval_definition::{ApprovalDefinition, NewApprovalDefinition};
pub use approval_event::{ApprovalComment, ApprovalEscalation, ApprovalEvent};
pub use approval_instance::ApprovalInstance;
pub use approval_stage::ApprovalStage;
pub use approval_task::ApprovalTask;
pub use assignment_snapshot::AssignmentSnapshot;
pub use lifecycle_definition::{LifecycleDefinition, LifecycleVersion, NewLifecycleDefinition};
pub use timer_schedule::{TimerSchedule, TimerStatus, TimerType};
pub use workflow_instance::WorkflowInstance;
pub use workflow_transition::WorkflowTransition;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reference to the business entity a workflow or timer is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: Uuid,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: Uuid) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id,
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

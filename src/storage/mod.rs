//! # Storage Layer
//!
//! The engine computes plans; the store commits them. `apply(ChangeSet)` is
//! the single atomic write path: every mutation and its audit rows land in
//! one transaction or not at all, so partial state (a mutation without its
//! audit record, or vice versa) is never observable. Rows guarded by
//! optimistic concurrency fail the whole change set with
//! [`EngineError::StaleWrite`] when the expected `row_version` is stale.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::authz::CapabilityRow;
use crate::error::Result;
use crate::models::{
    ApprovalComment, ApprovalDefinition, ApprovalEscalation, ApprovalEvent, ApprovalInstance,
    ApprovalStage, ApprovalTask, AssignmentSnapshot, EntityRef, LifecycleDefinition,
    LifecycleVersion, TimerSchedule, TimerStatus, WorkflowInstance, WorkflowTransition,
};

/// One mutation within an atomic change set.
#[derive(Debug, Clone)]
pub enum Change {
    InsertInstance(WorkflowInstance),
    /// Compare-and-swap on `expected_version`.
    UpdateInstance {
        instance: WorkflowInstance,
        expected_version: i64,
    },
    InsertTransition(WorkflowTransition),
    InsertApproval(ApprovalInstance),
    /// Compare-and-swap on `expected_version`. Every decision plan carries
    /// one of these, which is what serializes quorum re-evaluation.
    UpdateApproval {
        approval: ApprovalInstance,
        expected_version: i64,
    },
    InsertStage(ApprovalStage),
    UpdateStage(ApprovalStage),
    InsertTask(ApprovalTask),
    UpdateTask(ApprovalTask),
    InsertSnapshot(AssignmentSnapshot),
    InsertEscalation(ApprovalEscalation),
    InsertEvent(ApprovalEvent),
    InsertComment(ApprovalComment),
    DeleteComment {
        comment_id: Uuid,
    },
    InsertTimer(TimerSchedule),
    /// `scheduled -> canceled` flip; a no-op if the timer already left
    /// `scheduled` (losing the race to a fire is not an error).
    CancelTimer {
        schedule_id: Uuid,
    },
}

/// Ordered mutations applied in one transaction.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub tenant_id: Uuid,
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new(tenant_id: Uuid) -> Self {
        Self {
            tenant_id,
            changes: Vec::new(),
        }
    }

    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Persistence boundary for the engine. Reads are point lookups and scoped
/// scans; all writes funnel through [`Store::apply`] except the timer status
/// CAS, which stands alone so fire/cancel races resolve atomically.
#[async_trait]
pub trait Store: Send + Sync {
    // -- definitions ------------------------------------------------------

    async fn insert_lifecycle_definition(&self, def: LifecycleDefinition) -> Result<()>;
    /// Definitions stay mutable until referenced by a version.
    async fn update_lifecycle_definition(&self, def: LifecycleDefinition) -> Result<()>;
    /// Restrict-on-delete: fails while versions reference the definition.
    async fn delete_lifecycle_definition(&self, tenant_id: Uuid, id: Uuid) -> Result<()>;
    async fn lifecycle_definition(&self, tenant_id: Uuid, id: Uuid) -> Result<LifecycleDefinition>;
    async fn lifecycle_definition_by_code(
        &self,
        tenant_id: Uuid,
        code: &str,
    ) -> Result<Option<LifecycleDefinition>>;

    async fn insert_lifecycle_version(&self, version: LifecycleVersion) -> Result<()>;
    async fn lifecycle_version(&self, id: Uuid) -> Result<LifecycleVersion>;
    async fn latest_lifecycle_version(&self, lifecycle_id: Uuid)
        -> Result<Option<LifecycleVersion>>;

    async fn insert_approval_definition(&self, def: ApprovalDefinition) -> Result<()>;
    async fn update_approval_definition(&self, def: ApprovalDefinition) -> Result<()>;
    async fn approval_definition(&self, tenant_id: Uuid, id: Uuid) -> Result<ApprovalDefinition>;

    // -- workflow instances -----------------------------------------------

    async fn workflow_instance(&self, id: Uuid) -> Result<WorkflowInstance>;
    async fn workflow_instance_by_entity(
        &self,
        tenant_id: Uuid,
        entity: &EntityRef,
    ) -> Result<Option<WorkflowInstance>>;
    /// Transitions in `sort_key` order.
    async fn transitions_for(&self, instance_id: Uuid) -> Result<Vec<WorkflowTransition>>;
    async fn next_transition_sort_key(&self, instance_id: Uuid) -> Result<i32>;

    // -- approvals ----------------------------------------------------------

    async fn approval_instance(&self, id: Uuid) -> Result<ApprovalInstance>;
    /// Non-terminal approvals raised against an entity.
    async fn open_approvals_for_entity(
        &self,
        tenant_id: Uuid,
        entity: &EntityRef,
    ) -> Result<Vec<ApprovalInstance>>;
    /// Stages in `stage_no` order.
    async fn stages_for(&self, approval_id: Uuid) -> Result<Vec<ApprovalStage>>;
    /// All tasks across the approval's stages, in `order_index` order.
    async fn tasks_for_approval(&self, approval_id: Uuid) -> Result<Vec<ApprovalTask>>;
    async fn approval_task(&self, id: Uuid) -> Result<ApprovalTask>;
    async fn snapshots_for(&self, approval_id: Uuid) -> Result<Vec<AssignmentSnapshot>>;
    async fn events_for(&self, approval_id: Uuid) -> Result<Vec<ApprovalEvent>>;
    async fn escalations_for(&self, approval_id: Uuid) -> Result<Vec<ApprovalEscalation>>;
    async fn comments_for(&self, approval_id: Uuid) -> Result<Vec<ApprovalComment>>;
    async fn comment(&self, id: Uuid) -> Result<ApprovalComment>;

    // -- timers -------------------------------------------------------------

    async fn timer(&self, id: Uuid) -> Result<TimerSchedule>;
    async fn scheduled_timers_for_entity(
        &self,
        tenant_id: Uuid,
        entity: &EntityRef,
    ) -> Result<Vec<TimerSchedule>>;
    /// All `scheduled` rows with `fire_at <= now`.
    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<TimerSchedule>>;
    /// Atomic status flip; returns whether this caller won the transition.
    async fn transition_timer(
        &self,
        id: Uuid,
        from: TimerStatus,
        to: TimerStatus,
    ) -> Result<bool>;

    // -- authorization ------------------------------------------------------

    async fn capabilities_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<CapabilityRow>>;

    // -- atomic write path --------------------------------------------------

    async fn apply(&self, changes: ChangeSet) -> Result<()>;
}

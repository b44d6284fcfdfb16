//! In-memory store.
//!
//! Backs tests and embedded use. A single `parking_lot::RwLock` guards the
//! tables; `apply` runs two-phase (validate every CAS and uniqueness
//! constraint, then mutate) so a change set is atomic under the write lock
//! exactly as a database transaction would be.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::{Change, ChangeSet, Store};
use crate::authz::CapabilityRow;
use crate::error::{EngineError, Result};
use crate::models::{
    ApprovalComment, ApprovalDefinition, ApprovalEscalation, ApprovalEvent, ApprovalInstance,
    ApprovalStage, ApprovalTask, AssignmentSnapshot, EntityRef, LifecycleDefinition,
    LifecycleVersion, TimerSchedule, TimerStatus, WorkflowInstance, WorkflowTransition,
};

#[derive(Default)]
struct Inner {
    lifecycle_defs: HashMap<Uuid, LifecycleDefinition>,
    lifecycle_versions: HashMap<Uuid, LifecycleVersion>,
    approval_defs: HashMap<Uuid, ApprovalDefinition>,
    instances: HashMap<Uuid, WorkflowInstance>,
    instance_by_entity: HashMap<(Uuid, String, Uuid), Uuid>,
    transitions: HashMap<Uuid, Vec<WorkflowTransition>>,
    approvals: HashMap<Uuid, ApprovalInstance>,
    stages: HashMap<Uuid, ApprovalStage>,
    tasks: HashMap<Uuid, ApprovalTask>,
    snapshots: Vec<AssignmentSnapshot>,
    escalations: Vec<ApprovalEscalation>,
    events: Vec<ApprovalEvent>,
    comments: HashMap<Uuid, ApprovalComment>,
    timers: HashMap<Uuid, TimerSchedule>,
    capabilities: Vec<CapabilityRow>,
}

/// In-memory [`Store`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed capability policy rows (test/bootstrap helper).
    pub fn seed_capabilities(&self, rows: Vec<CapabilityRow>) {
        self.inner.write().capabilities.extend(rows);
    }

    fn validate(inner: &Inner, changes: &ChangeSet) -> Result<()> {
        for change in changes.changes() {
            match change {
                Change::InsertInstance(instance) => {
                    let key = (
                        instance.tenant_id,
                        instance.entity_type.clone(),
                        instance.entity_id,
                    );
                    if inner.instance_by_entity.contains_key(&key) {
                        return Err(EngineError::DuplicateInstance {
                            entity_type: instance.entity_type.clone(),
                            entity_id: instance.entity_id,
                        });
                    }
                }
                Change::UpdateInstance {
                    instance,
                    expected_version,
                } => {
                    let current =
                        inner
                            .instances
                            .get(&instance.id)
                            .ok_or(EngineError::NotFound {
                                kind: "workflow instance",
                                id: instance.id,
                            })?;
                    if current.row_version != *expected_version {
                        return Err(EngineError::StaleWrite);
                    }
                }
                Change::UpdateApproval {
                    approval,
                    expected_version,
                } => {
                    let current =
                        inner
                            .approvals
                            .get(&approval.id)
                            .ok_or(EngineError::NotFound {
                                kind: "approval instance",
                                id: approval.id,
                            })?;
                    if current.row_version != *expected_version {
                        return Err(EngineError::StaleWrite);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_lifecycle_definition(&self, def: LifecycleDefinition) -> Result<()> {
        self.inner.write().lifecycle_defs.insert(def.id, def);
        Ok(())
    }

    async fn update_lifecycle_definition(&self, def: LifecycleDefinition) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.lifecycle_defs.contains_key(&def.id) {
            return Err(EngineError::NotFound {
                kind: "lifecycle definition",
                id: def.id,
            });
        }
        inner.lifecycle_defs.insert(def.id, def);
        Ok(())
    }

    async fn delete_lifecycle_definition(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        let mut inner = self.inner.write();
        let referenced = inner
            .lifecycle_versions
            .values()
            .any(|v| v.lifecycle_id == id);
        if referenced {
            return Err(EngineError::DefinitionInUse { id });
        }
        match inner.lifecycle_defs.get(&id) {
            Some(def) if def.tenant_id == tenant_id => {
                inner.lifecycle_defs.remove(&id);
                Ok(())
            }
            _ => Err(EngineError::NotFound {
                kind: "lifecycle definition",
                id,
            }),
        }
    }

    async fn lifecycle_definition(&self, tenant_id: Uuid, id: Uuid) -> Result<LifecycleDefinition> {
        self.inner
            .read()
            .lifecycle_defs
            .get(&id)
            .filter(|d| d.tenant_id == tenant_id)
            .cloned()
            .ok_or(EngineError::NotFound {
                kind: "lifecycle definition",
                id,
            })
    }

    async fn lifecycle_definition_by_code(
        &self,
        tenant_id: Uuid,
        code: &str,
    ) -> Result<Option<LifecycleDefinition>> {
        Ok(self
            .inner
            .read()
            .lifecycle_defs
            .values()
            .find(|d| d.tenant_id == tenant_id && d.code == code)
            .cloned())
    }

    async fn insert_lifecycle_version(&self, version: LifecycleVersion) -> Result<()> {
        self.inner
            .write()
            .lifecycle_versions
            .insert(version.id, version);
        Ok(())
    }

    async fn lifecycle_version(&self, id: Uuid) -> Result<LifecycleVersion> {
        self.inner
            .read()
            .lifecycle_versions
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound {
                kind: "lifecycle version",
                id,
            })
    }

    async fn latest_lifecycle_version(
        &self,
        lifecycle_id: Uuid,
    ) -> Result<Option<LifecycleVersion>> {
        Ok(self
            .inner
            .read()
            .lifecycle_versions
            .values()
            .filter(|v| v.lifecycle_id == lifecycle_id)
            .max_by_key(|v| v.version)
            .cloned())
    }

    async fn insert_approval_definition(&self, def: ApprovalDefinition) -> Result<()> {
        self.inner.write().approval_defs.insert(def.id, def);
        Ok(())
    }

    async fn update_approval_definition(&self, def: ApprovalDefinition) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.approval_defs.contains_key(&def.id) {
            return Err(EngineError::NotFound {
                kind: "approval definition",
                id: def.id,
            });
        }
        inner.approval_defs.insert(def.id, def);
        Ok(())
    }

    async fn approval_definition(&self, tenant_id: Uuid, id: Uuid) -> Result<ApprovalDefinition> {
        self.inner
            .read()
            .approval_defs
            .get(&id)
            .filter(|d| d.tenant_id == tenant_id)
            .cloned()
            .ok_or(EngineError::NotFound {
                kind: "approval definition",
                id,
            })
    }

    async fn workflow_instance(&self, id: Uuid) -> Result<WorkflowInstance> {
        self.inner
            .read()
            .instances
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound {
                kind: "workflow instance",
                id,
            })
    }

    async fn workflow_instance_by_entity(
        &self,
        tenant_id: Uuid,
        entity: &EntityRef,
    ) -> Result<Option<WorkflowInstance>> {
        let inner = self.inner.read();
        let key = (tenant_id, entity.entity_type.clone(), entity.entity_id);
        Ok(inner
            .instance_by_entity
            .get(&key)
            .and_then(|id| inner.instances.get(id))
            .cloned())
    }

    async fn transitions_for(&self, instance_id: Uuid) -> Result<Vec<WorkflowTransition>> {
        let mut rows = self
            .inner
            .read()
            .transitions
            .get(&instance_id)
            .cloned()
            .unwrap_or_default();
        rows.sort_by_key(|t| t.sort_key);
        Ok(rows)
    }

    async fn next_transition_sort_key(&self, instance_id: Uuid) -> Result<i32> {
        Ok(self
            .inner
            .read()
            .transitions
            .get(&instance_id)
            .and_then(|rows| rows.iter().map(|t| t.sort_key).max())
            .unwrap_or(0)
            + 1)
    }

    async fn approval_instance(&self, id: Uuid) -> Result<ApprovalInstance> {
        self.inner
            .read()
            .approvals
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound {
                kind: "approval instance",
                id,
            })
    }

    async fn open_approvals_for_entity(
        &self,
        tenant_id: Uuid,
        entity: &EntityRef,
    ) -> Result<Vec<ApprovalInstance>> {
        Ok(self
            .inner
            .read()
            .approvals
            .values()
            .filter(|a| {
                a.tenant_id == tenant_id
                    && a.entity_type == entity.entity_type
                    && a.entity_id == entity.entity_id
                    && !a.status.is_terminal()
            })
            .cloned()
            .collect())
    }

    async fn stages_for(&self, approval_id: Uuid) -> Result<Vec<ApprovalStage>> {
        let mut stages: Vec<_> = self
            .inner
            .read()
            .stages
            .values()
            .filter(|s| s.approval_id == approval_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.stage_no);
        Ok(stages)
    }

    async fn tasks_for_approval(&self, approval_id: Uuid) -> Result<Vec<ApprovalTask>> {
        let mut tasks: Vec<_> = self
            .inner
            .read()
            .tasks
            .values()
            .filter(|t| t.approval_id == approval_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.stage_id, t.order_index));
        Ok(tasks)
    }

    async fn approval_task(&self, id: Uuid) -> Result<ApprovalTask> {
        self.inner
            .read()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound {
                kind: "approval task",
                id,
            })
    }

    async fn snapshots_for(&self, approval_id: Uuid) -> Result<Vec<AssignmentSnapshot>> {
        Ok(self
            .inner
            .read()
            .snapshots
            .iter()
            .filter(|s| s.approval_id == approval_id)
            .cloned()
            .collect())
    }

    async fn events_for(&self, approval_id: Uuid) -> Result<Vec<ApprovalEvent>> {
        Ok(self
            .inner
            .read()
            .events
            .iter()
            .filter(|e| e.approval_id == approval_id)
            .cloned()
            .collect())
    }

    async fn escalations_for(&self, approval_id: Uuid) -> Result<Vec<ApprovalEscalation>> {
        Ok(self
            .inner
            .read()
            .escalations
            .iter()
            .filter(|e| e.approval_id == approval_id)
            .cloned()
            .collect())
    }

    async fn comments_for(&self, approval_id: Uuid) -> Result<Vec<ApprovalComment>> {
        let mut comments: Vec<_> = self
            .inner
            .read()
            .comments
            .values()
            .filter(|c| c.approval_id == approval_id)
            .cloned()
            .collect();
        comments.sort_by_key(|c| c.created_at);
        Ok(comments)
    }

    async fn comment(&self, id: Uuid) -> Result<ApprovalComment> {
        self.inner
            .read()
            .comments
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound {
                kind: "approval comment",
                id,
            })
    }

    async fn timer(&self, id: Uuid) -> Result<TimerSchedule> {
        self.inner
            .read()
            .timers
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound {
                kind: "timer schedule",
                id,
            })
    }

    async fn scheduled_timers_for_entity(
        &self,
        tenant_id: Uuid,
        entity: &EntityRef,
    ) -> Result<Vec<TimerSchedule>> {
        Ok(self
            .inner
            .read()
            .timers
            .values()
            .filter(|t| {
                t.tenant_id == tenant_id
                    && t.entity_type == entity.entity_type
                    && t.entity_id == entity.entity_id
                    && t.status == TimerStatus::Scheduled
            })
            .cloned()
            .collect())
    }

    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<TimerSchedule>> {
        let mut due: Vec<_> = self
            .inner
            .read()
            .timers
            .values()
            .filter(|t| t.status == TimerStatus::Scheduled && t.fire_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|t| t.fire_at);
        Ok(due)
    }

    async fn transition_timer(
        &self,
        id: Uuid,
        from: TimerStatus,
        to: TimerStatus,
    ) -> Result<bool> {
        let mut inner = self.inner.write();
        let timer = inner.timers.get_mut(&id).ok_or(EngineError::NotFound {
            kind: "timer schedule",
            id,
        })?;
        if timer.status != from {
            return Ok(false);
        }
        timer.status = to;
        let now = Utc::now();
        match to {
            TimerStatus::Fired => timer.fired_at = Some(now),
            TimerStatus::Canceled => timer.canceled_at = Some(now),
            TimerStatus::Scheduled => {}
        }
        Ok(true)
    }

    async fn capabilities_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<CapabilityRow>> {
        Ok(self
            .inner
            .read()
            .capabilities
            .iter()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn apply(&self, changes: ChangeSet) -> Result<()> {
        let mut inner = self.inner.write();

        // Phase 1: every constraint is checked before anything mutates, so a
        // failed change set leaves no partial state behind.
        Self::validate(&inner, &changes)?;

        // Phase 2: mutate.
        for change in changes.changes().iter().cloned() {
            match change {
                Change::InsertInstance(instance) => {
                    let key = (
                        instance.tenant_id,
                        instance.entity_type.clone(),
                        instance.entity_id,
                    );
                    inner.instance_by_entity.insert(key, instance.id);
                    inner.instances.insert(instance.id, instance);
                }
                Change::UpdateInstance { instance, .. } => {
                    inner.instances.insert(instance.id, instance);
                }
                Change::InsertTransition(transition) => {
                    inner
                        .transitions
                        .entry(transition.instance_id)
                        .or_default()
                        .push(transition);
                }
                Change::InsertApproval(approval) => {
                    inner.approvals.insert(approval.id, approval);
                }
                Change::UpdateApproval { approval, .. } => {
                    inner.approvals.insert(approval.id, approval);
                }
                Change::InsertStage(stage) | Change::UpdateStage(stage) => {
                    inner.stages.insert(stage.id, stage);
                }
                Change::InsertTask(task) | Change::UpdateTask(task) => {
                    inner.tasks.insert(task.id, task);
                }
                Change::InsertSnapshot(snapshot) => inner.snapshots.push(snapshot),
                Change::InsertEscalation(escalation) => inner.escalations.push(escalation),
                Change::InsertEvent(event) => inner.events.push(event),
                Change::InsertComment(comment) => {
                    inner.comments.insert(comment.id, comment);
                }
                Change::DeleteComment { comment_id } => {
                    inner.comments.remove(&comment_id);
                }
                Change::InsertTimer(timer) => {
                    inner.timers.insert(timer.id, timer);
                }
                Change::CancelTimer { schedule_id } => {
                    if let Some(timer) = inner.timers.get_mut(&schedule_id) {
                        if timer.status == TimerStatus::Scheduled {
                            timer.status = TimerStatus::Canceled;
                            timer.canceled_at = Some(Utc::now());
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_instance() -> WorkflowInstance {
        let now = Utc::now();
        WorkflowInstance {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            entity_type: "purchase_order".into(),
            entity_id: Uuid::new_v4(),
            lifecycle_id: Uuid::new_v4(),
            version_id: Uuid::new_v4(),
            current_state: "draft".into(),
            previous_state: None,
            status: Default::default(),
            org_unit_id: None,
            module_code: None,
            row_version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_apply_is_atomic_on_cas_failure() {
        let store = MemoryStore::new();
        let instance = sample_instance();

        let mut seed = ChangeSet::new(instance.tenant_id);
        seed.push(Change::InsertInstance(instance.clone()));
        store.apply(seed).await.unwrap();

        // Stale CAS plus an event insert: neither may land.
        let mut stale = ChangeSet::new(instance.tenant_id);
        let mut updated = instance.clone();
        updated.current_state = "submitted".into();
        updated.row_version = 99;
        stale.push(Change::UpdateInstance {
            instance: updated,
            expected_version: 42, // wrong
        });
        stale.push(Change::InsertTransition(WorkflowTransition::record(
            instance.tenant_id,
            instance.id,
            Some("draft".into()),
            "submitted",
            None,
            None,
            2,
        )));

        let err = store.apply(stale).await.unwrap_err();
        assert_eq!(err, EngineError::StaleWrite);

        let unchanged = store.workflow_instance(instance.id).await.unwrap();
        assert_eq!(unchanged.current_state, "draft");
        assert!(store.transitions_for(instance.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_instance_rejected() {
        let store = MemoryStore::new();
        let instance = sample_instance();

        let mut first = ChangeSet::new(instance.tenant_id);
        first.push(Change::InsertInstance(instance.clone()));
        store.apply(first).await.unwrap();

        let mut dup = instance.clone();
        dup.id = Uuid::new_v4();
        let mut second = ChangeSet::new(instance.tenant_id);
        second.push(Change::InsertInstance(dup));
        assert!(matches!(
            store.apply(second).await.unwrap_err(),
            EngineError::DuplicateInstance { .. }
        ));
    }

    #[tokio::test]
    async fn test_definition_delete_restricted_by_versions() {
        let store = MemoryStore::new();
        let def = LifecycleDefinition::from_new(crate::models::NewLifecycleDefinition {
            tenant_id: Uuid::new_v4(),
            code: "po-lifecycle".into(),
            entity_type: "purchase_order".into(),
            definition: json!({}),
        });
        store.insert_lifecycle_definition(def.clone()).await.unwrap();
        store
            .insert_lifecycle_version(LifecycleVersion::snapshot(&def, 1))
            .await
            .unwrap();

        assert!(matches!(
            store
                .delete_lifecycle_definition(def.tenant_id, def.id)
                .await
                .unwrap_err(),
            EngineError::DefinitionInUse { .. }
        ));
    }

    #[tokio::test]
    async fn test_timer_cas_single_winner() {
        let store = MemoryStore::new();
        let timer = TimerSchedule {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            entity_type: "purchase_order".into(),
            entity_id: Uuid::new_v4(),
            lifecycle_id: None,
            state: None,
            timer_type: crate::models::TimerType::Reminder,
            status: TimerStatus::Scheduled,
            fire_at: Utc::now(),
            policy_snapshot: json!({}),
            job_id: None,
            created_at: Utc::now(),
            fired_at: None,
            canceled_at: None,
        };
        let mut cs = ChangeSet::new(timer.tenant_id);
        cs.push(Change::InsertTimer(timer.clone()));
        store.apply(cs).await.unwrap();

        assert!(store
            .transition_timer(timer.id, TimerStatus::Scheduled, TimerStatus::Fired)
            .await
            .unwrap());
        // Second fire and a late cancel are both losing no-ops.
        assert!(!store
            .transition_timer(timer.id, TimerStatus::Scheduled, TimerStatus::Fired)
            .await
            .unwrap());
        assert!(!store
            .transition_timer(timer.id, TimerStatus::Scheduled, TimerStatus::Canceled)
            .await
            .unwrap());
    }
}

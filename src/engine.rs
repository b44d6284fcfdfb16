//! Engine facade.
//!
//! Ties the planners to the storage, authorization, scheduling, and
//! notification layers. Every mutating operation follows the same shape:
//! authorize the actor, load current state, run the pure planner, commit the
//! resulting change set atomically, then notify the timer substrate and
//! publish events. Stale-write CAS failures retry the whole load-plan-commit
//! cycle up to the configured limit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::approval::{
    ApprovalRules, ApprovalStatus, AssigneeResolver, Decision, Orchestrator, SlaTimer,
    StageOutcome, StageStatus, TaskStatus,
};
use crate::authz::{ActorContext, CapabilityIndex, ConstraintType, ScopeRef};
use crate::config::EngineConfig;
use crate::constants::{events, operations, SYSTEM_PRINCIPAL};
use crate::error::{EngineError, Result};
use crate::events::EventPublisher;
use crate::models::{
    ApprovalComment, ApprovalDefinition, ApprovalInstance, EntityRef, LifecycleDefinition,
    LifecycleVersion, NewApprovalDefinition, NewLifecycleDefinition, TimerSchedule, TimerType,
    WorkflowInstance, WorkflowTransition,
};
use crate::refdata::CurrencyLookup;
use crate::scheduler::{TimerScheduler, TimerSubstrate};
use crate::state_machine::{
    plan_start, plan_transition, InstanceStatus, LifecycleGraph, TransitionPlan, TransitionResult,
};
use crate::storage::{Change, ChangeSet, Store};

/// Workflow and approval orchestration engine.
pub struct Engine {
    store: Arc<dyn Store>,
    scheduler: TimerScheduler,
    orchestrator: Orchestrator,
    authz: CapabilityIndex,
    publisher: EventPublisher,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        substrate: Arc<dyn TimerSubstrate>,
        resolver: Arc<dyn AssigneeResolver>,
        currencies: Arc<dyn CurrencyLookup>,
        config: EngineConfig,
    ) -> Self {
        let scheduler = TimerScheduler::new(Arc::clone(&store), substrate);
        let orchestrator = Orchestrator::new(resolver, currencies, config.default_escalation);
        let publisher = EventPublisher::new(config.event_channel_capacity);
        Self {
            store,
            scheduler,
            orchestrator,
            authz: CapabilityIndex::new(),
            publisher,
            config,
        }
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Drop a tenant's cached capability index after a policy change.
    pub fn invalidate_capabilities(&self, tenant_id: Uuid) {
        self.authz.invalidate(tenant_id);
    }

    // -- definition management ------------------------------------------------

    pub async fn create_lifecycle_definition(
        &self,
        ctx: &ActorContext,
        new: NewLifecycleDefinition,
    ) -> Result<LifecycleDefinition> {
        self.authz
            .authorize(
                self.store.as_ref(),
                new.tenant_id,
                ctx,
                operations::DEFINITION_MANAGE,
                ScopeRef::default(),
            )
            .await?;
        LifecycleGraph::parse(&new.definition)?;

        let def = LifecycleDefinition::from_new(new);
        self.store.insert_lifecycle_definition(def.clone()).await?;
        info!(lifecycle_id = %def.id, code = %def.code, "lifecycle definition created");
        Ok(def)
    }

    /// Edits never touch versions already bound to running instances; the
    /// next workflow start snapshots the changed definition as a new version.
    pub async fn update_lifecycle_definition(
        &self,
        ctx: &ActorContext,
        mut def: LifecycleDefinition,
    ) -> Result<LifecycleDefinition> {
        self.authz
            .authorize(
                self.store.as_ref(),
                def.tenant_id,
                ctx,
                operations::DEFINITION_MANAGE,
                ScopeRef::default(),
            )
            .await?;
        LifecycleGraph::parse(&def.definition)?;

        def.updated_at = Utc::now();
        self.store.update_lifecycle_definition(def.clone()).await?;
        Ok(def)
    }

    pub async fn delete_lifecycle_definition(
        &self,
        ctx: &ActorContext,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<()> {
        self.authz
            .authorize(
                self.store.as_ref(),
                tenant_id,
                ctx,
                operations::DEFINITION_MANAGE,
                ScopeRef::default(),
            )
            .await?;
        self.store.delete_lifecycle_definition(tenant_id, id).await
    }

    pub async fn create_approval_definition(
        &self,
        ctx: &ActorContext,
        new: NewApprovalDefinition,
    ) -> Result<ApprovalDefinition> {
        self.authz
            .authorize(
                self.store.as_ref(),
                new.tenant_id,
                ctx,
                operations::DEFINITION_MANAGE,
                ScopeRef::default(),
            )
            .await?;
        ApprovalRules::parse(&new.rules)?;

        let def = ApprovalDefinition::from_new(new);
        self.store.insert_approval_definition(def.clone()).await?;
        info!(definition_id = %def.id, code = %def.code, "approval definition created");
        Ok(def)
    }

    pub async fn update_approval_definition(
        &self,
        ctx: &ActorContext,
        mut def: ApprovalDefinition,
    ) -> Result<ApprovalDefinition> {
        self.authz
            .authorize(
                self.store.as_ref(),
                def.tenant_id,
                ctx,
                operations::DEFINITION_MANAGE,
                ScopeRef::default(),
            )
            .await?;
        ApprovalRules::parse(&def.rules)?;

        def.updated_at = Utc::now();
        self.store.update_approval_definition(def.clone()).await?;
        Ok(def)
    }

    // -- workflow lifecycle ---------------------------------------------------

    /// Start a workflow for an entity: snapshot the current definition as an
    /// immutable version (if not already snapshotted), enter the initial
    /// state, and schedule its timer policies. One live instance per entity.
    pub async fn start_workflow(
        &self,
        ctx: &ActorContext,
        tenant_id: Uuid,
        lifecycle_id: Uuid,
        entity: EntityRef,
        org_unit_id: Option<Uuid>,
        module_code: Option<String>,
    ) -> Result<TransitionResult> {
        self.authz
            .authorize(
                self.store.as_ref(),
                tenant_id,
                ctx,
                operations::WORKFLOW_START,
                ScopeRef {
                    owner: Some(ctx.principal_id),
                    org_unit_id,
                    module_code: module_code.as_deref(),
                },
            )
            .await?;

        let def = self.store.lifecycle_definition(tenant_id, lifecycle_id).await?;
        if def.entity_type != entity.entity_type {
            return Err(EngineError::DefinitionInvalid(format!(
                "lifecycle '{}' governs entity type '{}', not '{}'",
                def.code, def.entity_type, entity.entity_type
            )));
        }
        if let Some(existing) = self
            .store
            .workflow_instance_by_entity(tenant_id, &entity)
            .await?
        {
            return Err(EngineError::DuplicateInstance {
                entity_type: existing.entity_type,
                entity_id: existing.entity_id,
            });
        }

        let version = self.ensure_version(&def).await?;
        let graph = LifecycleGraph::parse(&version.definition)?;
        let plan = plan_start(
            tenant_id,
            &entity.entity_type,
            entity.entity_id,
            &version,
            &graph,
            ctx.principal_id,
            org_unit_id,
            module_code,
        )?;

        let result = self.commit_transition_plan(plan, true).await?;
        self.publish(
            tenant_id,
            events::WORKFLOW_STARTED,
            json!({ "instance_id": result.instance_id, "state": result.to_state, "entity": entity }),
        )
        .await;
        Ok(result)
    }

    /// Move an instance along a defined edge. Retries the load-plan-commit
    /// cycle on stale writes; actors holding `workflow.override` may move to
    /// any defined state.
    pub async fn request_transition(
        &self,
        ctx: &ActorContext,
        instance_id: Uuid,
        to_state: &str,
        transition_data: Option<Value>,
    ) -> Result<TransitionResult> {
        let mut retries = 0;
        loop {
            let instance = self.store.workflow_instance(instance_id).await?;
            let scope = ScopeRef {
                owner: None,
                org_unit_id: instance.org_unit_id,
                module_code: instance.module_code.as_deref(),
            };
            self.authz
                .authorize(
                    self.store.as_ref(),
                    instance.tenant_id,
                    ctx,
                    operations::WORKFLOW_TRANSITION,
                    scope,
                )
                .await?;
            let override_allowed = self
                .authz
                .authorize(
                    self.store.as_ref(),
                    instance.tenant_id,
                    ctx,
                    operations::WORKFLOW_OVERRIDE,
                    scope,
                )
                .await
                .is_ok();

            let version = self.store.lifecycle_version(instance.version_id).await?;
            let latest = self
                .store
                .latest_lifecycle_version(instance.lifecycle_id)
                .await?
                .map(|v| v.version)
                .unwrap_or(version.version);
            let graph = LifecycleGraph::parse(&version.definition)?;
            let sort_key = self.store.next_transition_sort_key(instance_id).await?;

            let plan = plan_transition(
                &instance,
                &graph,
                latest,
                version.version,
                self.config.strict_version_check,
                to_state,
                ctx.principal_id,
                transition_data.clone(),
                override_allowed,
                sort_key,
            )?;

            match self.commit_transition_plan(plan, false).await {
                Ok(result) => {
                    self.publish(
                        instance.tenant_id,
                        events::WORKFLOW_TRANSITIONED,
                        json!({
                            "instance_id": result.instance_id,
                            "from": result.from_state,
                            "to": result.to_state,
                        }),
                    )
                    .await;
                    return Ok(result);
                }
                Err(EngineError::StaleWrite) if retries < self.config.conflict_retry_limit => {
                    retries += 1;
                    debug!(instance_id = %instance_id, retries, "stale write, retrying transition");
                }
                Err(EngineError::StaleWrite) => {
                    return Err(EngineError::Conflict { retries });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Suspend an active instance. The current state is unchanged; the flip
    /// is recorded as a self-transition on the audit trail.
    pub async fn pause_workflow(
        &self,
        ctx: &ActorContext,
        instance_id: Uuid,
        data: Option<Value>,
    ) -> Result<TransitionResult> {
        self.flip_status(
            ctx,
            instance_id,
            operations::WORKFLOW_PAUSE,
            InstanceStatus::Paused,
            events::WORKFLOW_PAUSED,
            "pause",
            data,
        )
        .await
    }

    pub async fn resume_workflow(
        &self,
        ctx: &ActorContext,
        instance_id: Uuid,
        data: Option<Value>,
    ) -> Result<TransitionResult> {
        self.flip_status(
            ctx,
            instance_id,
            operations::WORKFLOW_RESUME,
            InstanceStatus::Active,
            events::WORKFLOW_RESUMED,
            "resume",
            data,
        )
        .await
    }

    /// Cancel an instance. Terminal: pending timers are revoked, open
    /// approvals against the entity resolve as canceled, and no further
    /// transitions are accepted.
    pub async fn cancel_workflow(
        &self,
        ctx: &ActorContext,
        instance_id: Uuid,
        data: Option<Value>,
    ) -> Result<TransitionResult> {
        self.flip_status(
            ctx,
            instance_id,
            operations::WORKFLOW_CANCEL,
            InstanceStatus::Canceled,
            events::WORKFLOW_CANCELED,
            "cancel",
            data,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn flip_status(
        &self,
        ctx: &ActorContext,
        instance_id: Uuid,
        operation: &str,
        to_status: InstanceStatus,
        event: &str,
        action: &str,
        data: Option<Value>,
    ) -> Result<TransitionResult> {
        let mut retries = 0;
        loop {
            let instance = self.store.workflow_instance(instance_id).await?;
            self.authz
                .authorize(
                    self.store.as_ref(),
                    instance.tenant_id,
                    ctx,
                    operation,
                    ScopeRef {
                        owner: None,
                        org_unit_id: instance.org_unit_id,
                        module_code: instance.module_code.as_deref(),
                    },
                )
                .await?;

            if instance.status.is_terminal() {
                return Err(EngineError::InstanceTerminal {
                    instance_id,
                    status: instance.status.to_string(),
                });
            }
            let valid_from = match to_status {
                InstanceStatus::Paused => instance.status == InstanceStatus::Active,
                InstanceStatus::Active => instance.status == InstanceStatus::Paused,
                // cancel is allowed from any non-terminal status
                _ => true,
            };
            if !valid_from {
                return Err(EngineError::InstanceNotActive {
                    instance_id,
                    status: instance.status.to_string(),
                });
            }

            let now = Utc::now();
            let mut updated = instance.clone();
            updated.status = to_status;
            updated.row_version = instance.row_version + 1;
            updated.updated_at = now;

            let sort_key = self.store.next_transition_sort_key(instance_id).await?;
            let transition = WorkflowTransition::record(
                instance.tenant_id,
                instance.id,
                Some(instance.current_state.clone()),
                &instance.current_state,
                Some(ctx.principal_id),
                Some(json!({ "action": action, "data": data })),
                sort_key,
            );

            let mut changes = ChangeSet::new(instance.tenant_id);
            changes.push(Change::UpdateInstance {
                instance: updated,
                expected_version: instance.row_version,
            });
            changes.push(Change::InsertTransition(transition));
            let mut canceled = Vec::new();
            let mut canceled_approvals = Vec::new();
            if to_status.is_terminal() {
                let pending = self
                    .store
                    .scheduled_timers_for_entity(instance.tenant_id, &instance.entity_ref())
                    .await?;
                for timer in pending {
                    changes.push(Change::CancelTimer { schedule_id: timer.id });
                    canceled.push(timer.id);
                }

                // Open approvals raised against the entity die with the
                // workflow: the instance resolves as canceled, unresolved
                // stages and tasks close out, and their SLA deadlines are
                // revoked.
                let open = self
                    .store
                    .open_approvals_for_entity(instance.tenant_id, &instance.entity_ref())
                    .await?;
                for approval in open {
                    let mut resolved = approval.clone();
                    resolved.status = ApprovalStatus::Canceled;
                    resolved.row_version = approval.row_version + 1;
                    resolved.updated_at = now;
                    resolved.resolved_at = Some(now);
                    changes.push(Change::UpdateApproval {
                        approval: resolved,
                        expected_version: approval.row_version,
                    });
                    for stage in self.store.stages_for(approval.id).await? {
                        if matches!(stage.status, StageStatus::Pending | StageStatus::Active) {
                            let mut closed = stage;
                            closed.status = StageStatus::Canceled;
                            closed.resolved_at = Some(now);
                            changes.push(Change::UpdateStage(closed));
                        }
                    }
                    for task in self.store.tasks_for_approval(approval.id).await? {
                        if !task.is_open() {
                            continue;
                        }
                        let task_ref = EntityRef::new("approval_task", task.id);
                        for timer in self
                            .store
                            .scheduled_timers_for_entity(instance.tenant_id, &task_ref)
                            .await?
                        {
                            changes.push(Change::CancelTimer { schedule_id: timer.id });
                            canceled.push(timer.id);
                        }
                        let mut skipped = task;
                        skipped.status = TaskStatus::Skipped;
                        skipped.updated_at = now;
                        changes.push(Change::UpdateTask(skipped));
                    }
                    changes.push(Change::InsertEvent(crate::models::ApprovalEvent::record(
                        instance.tenant_id,
                        approval.id,
                        None,
                        events::APPROVAL_RESOLVED,
                        json!({ "status": ApprovalStatus::Canceled, "cause": "workflow_canceled" }),
                        Some(ctx.principal_id),
                    )));
                    canceled_approvals.push(approval.id);
                }
            }

            match self.store.apply(changes).await {
                Ok(()) => {
                    self.publish_timer_changes(instance.tenant_id, &[], &canceled)
                        .await;
                    for approval_id in &canceled_approvals {
                        self.publish(
                            instance.tenant_id,
                            events::APPROVAL_RESOLVED,
                            json!({ "approval_id": approval_id, "status": ApprovalStatus::Canceled }),
                        )
                        .await;
                    }
                    self.publish(
                        instance.tenant_id,
                        event,
                        json!({ "instance_id": instance_id, "state": instance.current_state }),
                    )
                    .await;
                    return Ok(TransitionResult {
                        instance_id,
                        from_state: Some(instance.current_state.clone()),
                        to_state: instance.current_state,
                        status: to_status,
                    });
                }
                Err(EngineError::StaleWrite) if retries < self.config.conflict_retry_limit => {
                    retries += 1;
                }
                Err(EngineError::StaleWrite) => {
                    return Err(EngineError::Conflict { retries });
                }
                Err(e) => return Err(e),
            }
        }
    }

    // -- approvals --------------------------------------------------------------

    /// Open an approval against an entity snapshot and activate the first
    /// eligible stage.
    #[allow(clippy::too_many_arguments)]
    pub async fn request_approval(
        &self,
        ctx: &ActorContext,
        tenant_id: Uuid,
        definition_id: Uuid,
        entity: EntityRef,
        entity_snapshot: Value,
        org_unit_id: Option<Uuid>,
        module_code: Option<String>,
    ) -> Result<ApprovalInstance> {
        self.authz
            .authorize(
                self.store.as_ref(),
                tenant_id,
                ctx,
                operations::APPROVAL_REQUEST,
                ScopeRef {
                    owner: Some(ctx.principal_id),
                    org_unit_id,
                    module_code: module_code.as_deref(),
                },
            )
            .await?;

        let def = self.store.approval_definition(tenant_id, definition_id).await?;
        let rules = ApprovalRules::parse(&def.rules)?;
        let plan = self
            .orchestrator
            .plan_request(
                &def,
                &rules,
                &entity,
                entity_snapshot,
                ctx.principal_id,
                org_unit_id,
                module_code,
            )
            .await?;

        let approval = plan.approval.clone();
        let mut changes = ChangeSet::new(tenant_id);
        changes.push(Change::InsertApproval(plan.approval));
        for stage in plan.stages {
            changes.push(Change::InsertStage(stage));
        }
        for task in plan.tasks {
            changes.push(Change::InsertTask(task));
        }
        for snapshot in plan.snapshots {
            changes.push(Change::InsertSnapshot(snapshot));
        }
        for event in plan.events {
            changes.push(Change::InsertEvent(event));
        }
        let timer_rows = self.sla_timer_rows(tenant_id, approval.id, &plan.sla_timers);
        for row in &timer_rows {
            changes.push(Change::InsertTimer(row.clone()));
        }

        self.store.apply(changes).await?;
        for row in &timer_rows {
            self.scheduler.notify_scheduled(row).await;
        }
        self.publish_timer_changes(tenant_id, &timer_rows, &[]).await;
        self.publish(
            tenant_id,
            events::APPROVAL_REQUESTED,
            json!({ "approval_id": approval.id, "entity": entity }),
        )
        .await;
        Ok(approval)
    }

    /// Record an approve/reject/escalate decision on a task and run stage
    /// resolution. A `none`-constrained `approval.decide` grant acts as
    /// delegation: the actor may decide tasks assigned to others.
    pub async fn submit_decision(
        &self,
        ctx: &ActorContext,
        approval_id: Uuid,
        task_id: Uuid,
        decision: Decision,
        reason: Option<String>,
    ) -> Result<StageOutcome> {
        let mut retries = 0;
        loop {
            let approval = self.store.approval_instance(approval_id).await?;
            let task = self.store.approval_task(task_id).await?;
            let constraint = self
                .authz
                .authorize(
                    self.store.as_ref(),
                    approval.tenant_id,
                    ctx,
                    operations::APPROVAL_DECIDE,
                    ScopeRef {
                        owner: task.assignee_principal_id,
                        org_unit_id: approval.org_unit_id,
                        module_code: approval.module_code.as_deref(),
                    },
                )
                .await?;
            let actor_is_delegate = constraint == ConstraintType::None;

            let outcome = self
                .decide(
                    &approval,
                    task_id,
                    decision,
                    reason.clone(),
                    ctx.principal_id,
                    actor_is_delegate,
                    "manual",
                )
                .await;

            match outcome {
                Ok(outcome) => return Ok(outcome),
                Err(EngineError::StaleWrite) if retries < self.config.conflict_retry_limit => {
                    retries += 1;
                    debug!(approval_id = %approval_id, retries, "stale write, retrying decision");
                }
                Err(EngineError::StaleWrite) => {
                    return Err(EngineError::Conflict { retries });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One decision attempt: plan, commit, notify.
    #[allow(clippy::too_many_arguments)]
    async fn decide(
        &self,
        approval: &ApprovalInstance,
        task_id: Uuid,
        decision: Decision,
        reason: Option<String>,
        actor: Uuid,
        actor_is_delegate: bool,
        escalation_kind: &str,
    ) -> Result<StageOutcome> {
        let def = self
            .store
            .approval_definition(approval.tenant_id, approval.definition_id)
            .await?;
        let rules = ApprovalRules::parse(&def.rules)?;
        let stages = self.store.stages_for(approval.id).await?;
        let tasks = self.store.tasks_for_approval(approval.id).await?;

        let plan = self
            .orchestrator
            .plan_decision(
                approval,
                &rules,
                &stages,
                &tasks,
                task_id,
                decision,
                reason,
                actor,
                actor_is_delegate,
                escalation_kind,
            )
            .await?;

        let tenant_id = approval.tenant_id;
        let resolved = plan.approval.status.is_terminal();
        let resolved_status = plan.approval.status;
        let outcome = plan.outcome;

        let mut changes = ChangeSet::new(tenant_id);
        changes.push(Change::UpdateApproval {
            approval: plan.approval,
            expected_version: plan.expected_version,
        });
        for stage in plan.updated_stages {
            changes.push(Change::UpdateStage(stage));
        }
        for task in plan.updated_tasks {
            changes.push(Change::UpdateTask(task));
        }
        for task in plan.new_tasks {
            changes.push(Change::InsertTask(task));
        }
        for snapshot in plan.snapshots {
            changes.push(Change::InsertSnapshot(snapshot));
        }
        for escalation in plan.escalations {
            changes.push(Change::InsertEscalation(escalation));
        }
        for event in plan.events {
            changes.push(Change::InsertEvent(event));
        }
        // Settled tasks can no longer breach their SLA.
        let mut canceled = Vec::new();
        for settled in &plan.settled_task_ids {
            let entity = EntityRef::new("approval_task", *settled);
            for timer in self
                .store
                .scheduled_timers_for_entity(tenant_id, &entity)
                .await?
            {
                changes.push(Change::CancelTimer { schedule_id: timer.id });
                canceled.push(timer.id);
            }
        }
        let timer_rows = self.sla_timer_rows(tenant_id, approval.id, &plan.sla_timers);
        for row in &timer_rows {
            changes.push(Change::InsertTimer(row.clone()));
        }

        self.store.apply(changes).await?;
        for row in &timer_rows {
            self.scheduler.notify_scheduled(row).await;
        }
        self.publish_timer_changes(tenant_id, &timer_rows, &canceled).await;

        self.publish(
            tenant_id,
            events::APPROVAL_TASK_DECIDED,
            json!({ "approval_id": approval.id, "task_id": task_id, "decision": decision }),
        )
        .await;
        if resolved {
            self.publish(
                tenant_id,
                events::APPROVAL_RESOLVED,
                json!({ "approval_id": approval.id, "status": resolved_status }),
            )
            .await;
        }
        Ok(outcome)
    }

    /// SLA reminder rows are keyed to the task, not the approval, so settling
    /// one task cancels only its own deadline.
    fn sla_timer_rows(
        &self,
        tenant_id: Uuid,
        approval_id: Uuid,
        timers: &[SlaTimer],
    ) -> Vec<TimerSchedule> {
        timers
            .iter()
            .map(|sla| TimerSchedule {
                id: Uuid::new_v4(),
                tenant_id,
                entity_type: "approval_task".to_string(),
                entity_id: sla.task_id,
                lifecycle_id: None,
                state: None,
                timer_type: TimerType::Reminder,
                status: crate::models::TimerStatus::Scheduled,
                fire_at: sla.fire_at,
                policy_snapshot: json!({
                    "kind": "sla_escalation",
                    "task_id": sla.task_id,
                    "approval_id": approval_id,
                }),
                job_id: None,
                created_at: Utc::now(),
                fired_at: None,
                canceled_at: None,
            })
            .collect()
    }

    // -- comments -----------------------------------------------------------------

    pub async fn add_comment(
        &self,
        ctx: &ActorContext,
        approval_id: Uuid,
        task_id: Option<Uuid>,
        body: String,
    ) -> Result<ApprovalComment> {
        let approval = self.store.approval_instance(approval_id).await?;
        self.authz
            .authorize(
                self.store.as_ref(),
                approval.tenant_id,
                ctx,
                operations::COMMENT_CREATE,
                ScopeRef {
                    owner: Some(ctx.principal_id),
                    org_unit_id: approval.org_unit_id,
                    module_code: approval.module_code.as_deref(),
                },
            )
            .await?;

        let comment = ApprovalComment {
            id: Uuid::new_v4(),
            tenant_id: approval.tenant_id,
            approval_id,
            task_id,
            author: ctx.principal_id,
            body,
            created_at: Utc::now(),
        };
        let mut changes = ChangeSet::new(approval.tenant_id);
        changes.push(Change::InsertComment(comment.clone()));
        changes.push(Change::InsertEvent(crate::models::ApprovalEvent::record(
            approval.tenant_id,
            approval_id,
            task_id,
            events::APPROVAL_COMMENT_ADDED,
            json!({ "comment_id": comment.id }),
            Some(ctx.principal_id),
        )));
        self.store.apply(changes).await?;

        self.publish(
            approval.tenant_id,
            events::APPROVAL_COMMENT_ADDED,
            json!({ "approval_id": approval_id, "comment_id": comment.id }),
        )
        .await;
        Ok(comment)
    }

    /// Deletion is privileged: an `own` grant only covers the actor's own
    /// comments, broader grants cover moderation.
    pub async fn delete_comment(&self, ctx: &ActorContext, comment_id: Uuid) -> Result<()> {
        let comment = self.store.comment(comment_id).await?;
        let approval = self.store.approval_instance(comment.approval_id).await?;
        self.authz
            .authorize(
                self.store.as_ref(),
                approval.tenant_id,
                ctx,
                operations::COMMENT_DELETE,
                ScopeRef {
                    owner: Some(comment.author),
                    org_unit_id: approval.org_unit_id,
                    module_code: approval.module_code.as_deref(),
                },
            )
            .await?;

        let mut changes = ChangeSet::new(approval.tenant_id);
        changes.push(Change::DeleteComment { comment_id });
        changes.push(Change::InsertEvent(crate::models::ApprovalEvent::record(
            approval.tenant_id,
            comment.approval_id,
            comment.task_id,
            events::APPROVAL_COMMENT_DELETED,
            json!({ "comment_id": comment_id }),
            Some(ctx.principal_id),
        )));
        self.store.apply(changes).await?;

        self.publish(
            approval.tenant_id,
            events::APPROVAL_COMMENT_DELETED,
            json!({ "approval_id": comment.approval_id, "comment_id": comment_id }),
        )
        .await;
        Ok(())
    }

    // -- timer firing ---------------------------------------------------------

    /// Fire one timer by schedule id. Exactly-once: only the caller that wins
    /// the `scheduled -> fired` flip acts; replays and fire/cancel race
    /// losers return `false`. A fired timer whose target has already moved on
    /// is a benign no-op.
    pub async fn fire_timer(&self, schedule_id: Uuid) -> Result<bool> {
        let Some(timer) = self.scheduler.claim_fire(schedule_id).await? else {
            return Ok(false);
        };

        self.publish(
            timer.tenant_id,
            events::TIMER_FIRED,
            json!({ "schedule_id": timer.id, "timer_type": timer.timer_type }),
        )
        .await;

        if timer.timer_type.is_transition() {
            return self.fire_auto_transition(&timer).await;
        }

        // Reminders: either an SLA deadline that escalates its task, or a
        // plain notification.
        if timer.policy_snapshot.get("kind").and_then(Value::as_str) == Some("sla_escalation") {
            return self.fire_sla_escalation(&timer).await;
        }
        self.publish(
            timer.tenant_id,
            events::REMINDER_DUE,
            json!({
                "schedule_id": timer.id,
                "entity_type": timer.entity_type,
                "entity_id": timer.entity_id,
            }),
        )
        .await;
        Ok(true)
    }

    async fn fire_auto_transition(&self, timer: &TimerSchedule) -> Result<bool> {
        let Some(to_state) = timer.policy_snapshot.get("to_state").and_then(Value::as_str) else {
            warn!(schedule_id = %timer.id, "transition timer fired without a target state");
            return Ok(false);
        };
        let instance_id: Uuid = match timer
            .policy_snapshot
            .get("instance_id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
        {
            Some(id) => id,
            None => {
                warn!(schedule_id = %timer.id, "transition timer fired without an instance id");
                return Ok(false);
            }
        };

        let instance = self.store.workflow_instance(instance_id).await?;
        // The timer belongs to the state it was scheduled under; if the
        // instance has moved (its timers should have been canceled, but the
        // race loser can still land here), do nothing.
        if timer.state.as_deref() != Some(instance.current_state.as_str()) {
            debug!(
                schedule_id = %timer.id,
                state = %instance.current_state,
                "timer target state no longer current, skipping"
            );
            return Ok(false);
        }

        match self.system_transition(&instance, to_state).await {
            Ok(result) => {
                self.publish(
                    instance.tenant_id,
                    events::WORKFLOW_TRANSITIONED,
                    json!({
                        "instance_id": result.instance_id,
                        "from": result.from_state,
                        "to": result.to_state,
                        "auto": true,
                    }),
                )
                .await;
                Ok(true)
            }
            // The instance moved or terminated before the timer landed.
            Err(
                e @ (EngineError::InvalidTransition { .. }
                | EngineError::InstanceNotActive { .. }
                | EngineError::VersionMismatch { .. }),
            ) => {
                debug!(schedule_id = %timer.id, error = %e, "auto transition skipped");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn system_transition(
        &self,
        instance: &WorkflowInstance,
        to_state: &str,
    ) -> Result<TransitionResult> {
        let mut retries = 0;
        let mut current = instance.clone();
        loop {
            let version = self.store.lifecycle_version(current.version_id).await?;
            let graph = LifecycleGraph::parse(&version.definition)?;
            let sort_key = self.store.next_transition_sort_key(current.id).await?;
            let plan = plan_transition(
                &current,
                &graph,
                version.version,
                version.version,
                false,
                to_state,
                SYSTEM_PRINCIPAL,
                None,
                false,
                sort_key,
            )?;

            match self.commit_transition_plan(plan, false).await {
                Ok(result) => return Ok(result),
                Err(EngineError::StaleWrite) if retries < self.config.conflict_retry_limit => {
                    retries += 1;
                    current = self.store.workflow_instance(current.id).await?;
                }
                Err(EngineError::StaleWrite) => {
                    return Err(EngineError::Conflict { retries });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fire_sla_escalation(&self, timer: &TimerSchedule) -> Result<bool> {
        let approval_id: Option<Uuid> = timer
            .policy_snapshot
            .get("approval_id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok());
        let Some(approval_id) = approval_id else {
            warn!(schedule_id = %timer.id, "sla timer fired without an approval id");
            return Ok(false);
        };
        let task_id = timer.entity_id;

        let mut retries = 0;
        loop {
            let approval = self.store.approval_instance(approval_id).await?;
            let result = self
                .decide(
                    &approval,
                    task_id,
                    Decision::Escalate,
                    Some("sla breach".to_string()),
                    SYSTEM_PRINCIPAL,
                    true,
                    "sla_breach",
                )
                .await;
            match result {
                Ok(_) => return Ok(true),
                // The task or approval settled between scheduling and firing.
                Err(
                    e @ (EngineError::TaskAlreadyResolved { .. }
                    | EngineError::StageNotActive { .. }
                    | EngineError::InstanceTerminal { .. }),
                ) => {
                    debug!(task_id = %task_id, error = %e, "sla escalation skipped");
                    return Ok(false);
                }
                Err(EngineError::StaleWrite) if retries < self.config.conflict_retry_limit => {
                    retries += 1;
                }
                Err(EngineError::StaleWrite) => {
                    return Err(EngineError::Conflict { retries });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fire everything past due. Deployments on the null substrate call this
    /// on a `timer_poll_interval_ms` cadence.
    pub async fn poll_due_timers(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.scheduler.due(now).await?;
        let mut fired = 0;
        for timer in due {
            if self.fire_timer(timer.id).await? {
                fired += 1;
            }
        }
        Ok(fired)
    }

    /// Crash recovery: schedule rows are the source of truth, so firing all
    /// past-due rows replays anything a dead process missed.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<usize> {
        let recovered = self.scheduler.recover(now).await?;
        let mut fired = 0;
        for timer in recovered {
            if self.fire_timer(timer.id).await? {
                fired += 1;
            }
        }
        if fired > 0 {
            info!(fired, "recovery fired past-due timers");
        }
        Ok(fired)
    }

    // -- internals ---------------------------------------------------------------

    /// Reuse the latest version if it still matches the definition payload,
    /// otherwise snapshot a new immutable version.
    async fn ensure_version(&self, def: &LifecycleDefinition) -> Result<LifecycleVersion> {
        if let Some(latest) = self.store.latest_lifecycle_version(def.id).await? {
            if latest.definition == def.definition {
                return Ok(latest);
            }
            let version = LifecycleVersion::snapshot(def, latest.version + 1);
            self.store.insert_lifecycle_version(version.clone()).await?;
            return Ok(version);
        }
        let version = LifecycleVersion::snapshot(def, 1);
        self.store.insert_lifecycle_version(version.clone()).await?;
        Ok(version)
    }

    async fn commit_transition_plan(
        &self,
        plan: TransitionPlan,
        insert: bool,
    ) -> Result<TransitionResult> {
        let result = plan.result();
        let tenant_id = plan.instance.tenant_id;
        let entity = plan.instance.entity_ref();
        let lifecycle_id = plan.instance.lifecycle_id;
        let to_state = plan.instance.current_state.clone();

        let mut changes = ChangeSet::new(tenant_id);
        if insert {
            changes.push(Change::InsertInstance(plan.instance));
        } else {
            changes.push(Change::UpdateInstance {
                instance: plan.instance,
                expected_version: plan.expected_version,
            });
        }
        changes.push(Change::InsertTransition(plan.transition));

        let mut canceled = Vec::new();
        if plan.cancel_pending_timers {
            let pending = self
                .store
                .scheduled_timers_for_entity(tenant_id, &entity)
                .await?;
            for timer in pending {
                changes.push(Change::CancelTimer { schedule_id: timer.id });
                canceled.push(timer.id);
            }
        }

        let timer_rows: Vec<TimerSchedule> = plan
            .schedule
            .iter()
            .map(|request| {
                TimerScheduler::build_row(
                    tenant_id,
                    &entity,
                    Some(lifecycle_id),
                    Some(to_state.clone()),
                    request,
                )
            })
            .collect();
        for row in &timer_rows {
            changes.push(Change::InsertTimer(row.clone()));
        }

        self.store.apply(changes).await?;
        for row in &timer_rows {
            self.scheduler.notify_scheduled(row).await;
        }
        self.publish_timer_changes(tenant_id, &timer_rows, &canceled).await;
        Ok(result)
    }

    /// Announce committed timer schedule changes on the publisher.
    async fn publish_timer_changes(
        &self,
        tenant_id: Uuid,
        scheduled: &[TimerSchedule],
        canceled: &[Uuid],
    ) {
        for row in scheduled {
            self.publish(
                tenant_id,
                events::TIMER_SCHEDULED,
                json!({
                    "schedule_id": row.id,
                    "timer_type": row.timer_type,
                    "fire_at": row.fire_at,
                }),
            )
            .await;
        }
        for schedule_id in canceled {
            self.publish(
                tenant_id,
                events::TIMER_CANCELED,
                json!({ "schedule_id": schedule_id }),
            )
            .await;
        }
    }

    async fn publish(&self, tenant_id: Uuid, name: &str, context: Value) {
        if let Err(e) = self.publisher.publish(tenant_id, name, context).await {
            warn!(event = name, error = %e, "event publish failed");
        }
    }
}

//! Approval orchestration.
//!
//! Drives an approval instance through its stages to a terminal decision.
//! Both entry points are planners: they validate, then compute the complete
//! set of mutations (instance, stages, tasks, snapshots, escalations, audit
//! events, SLA timers) for the storage layer to commit atomically. Stage
//! activation after a resolution runs as an explicit work list, never
//! recursion, so long approval chains cannot grow the call stack.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use super::assignment::AssigneeResolver;
use super::quorum::{QuorumOutcome, TaskTally};
use super::rules::{ApprovalRules, EscalationPolicy, StageRule};
use super::states::{ApprovalStatus, Decision, StageMode, StageStatus, TaskStatus};
use crate::constants::events;
use crate::error::{EngineError, Result};
use crate::models::{
    ApprovalDefinition, ApprovalEscalation, ApprovalEvent, ApprovalInstance, ApprovalStage,
    ApprovalTask, AssignmentSnapshot, EntityRef,
};
use crate::refdata::CurrencyLookup;

/// SLA timer request for a newly assigned task.
#[derive(Debug, Clone, PartialEq)]
pub struct SlaTimer {
    pub task_id: Uuid,
    pub fire_at: DateTime<Utc>,
}

/// Mutations produced by `plan_request`.
#[derive(Debug, Clone)]
pub struct ApprovalPlan {
    pub approval: ApprovalInstance,
    pub stages: Vec<ApprovalStage>,
    pub tasks: Vec<ApprovalTask>,
    pub snapshots: Vec<AssignmentSnapshot>,
    pub events: Vec<ApprovalEvent>,
    pub sla_timers: Vec<SlaTimer>,
}

/// Mutations produced by `plan_decision`.
#[derive(Debug, Clone)]
pub struct DecisionPlan {
    pub outcome: StageOutcome,
    /// Updated instance row; always bumped so concurrent decisions on the
    /// same approval serialize through the row-version CAS.
    pub approval: ApprovalInstance,
    pub expected_version: i64,
    pub updated_stages: Vec<ApprovalStage>,
    pub updated_tasks: Vec<ApprovalTask>,
    pub new_tasks: Vec<ApprovalTask>,
    pub snapshots: Vec<AssignmentSnapshot>,
    pub escalations: Vec<ApprovalEscalation>,
    pub events: Vec<ApprovalEvent>,
    pub sla_timers: Vec<SlaTimer>,
    /// Tasks settled by this decision; their pending SLA timers are moot.
    pub settled_task_ids: Vec<Uuid>,
}

/// Stage-level outcome reported to the caller of `submit_decision`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The active stage still waits on more decisions.
    Pending,
    /// The stage approved and the next stage was activated.
    Advanced { next_stage_no: i32 },
    /// The final stage approved; the instance is approved.
    Approved,
    /// A stage rejected; the instance is rejected.
    Rejected,
    /// An escalation was recorded; resolution follows the configured policy.
    Escalated,
}

/// Stage/quorum resolution engine.
pub struct Orchestrator {
    resolver: Arc<dyn AssigneeResolver>,
    currencies: Arc<dyn CurrencyLookup>,
    default_escalation: EscalationPolicy,
}

impl Orchestrator {
    pub fn new(
        resolver: Arc<dyn AssigneeResolver>,
        currencies: Arc<dyn CurrencyLookup>,
        default_escalation: EscalationPolicy,
    ) -> Self {
        Self {
            resolver,
            currencies,
            default_escalation,
        }
    }

    /// Plan a new approval request: snapshot the entity, create every stage
    /// up front (ineligible stages are skipped at creation), and activate
    /// the first eligible stage.
    #[allow(clippy::too_many_arguments)]
    pub async fn plan_request(
        &self,
        definition: &ApprovalDefinition,
        rules: &ApprovalRules,
        entity: &EntityRef,
        entity_snapshot: Value,
        requested_by: Uuid,
        org_unit_id: Option<Uuid>,
        module_code: Option<String>,
    ) -> Result<ApprovalPlan> {
        let now = Utc::now();
        let mut approval = ApprovalInstance {
            id: Uuid::new_v4(),
            tenant_id: definition.tenant_id,
            definition_id: definition.id,
            entity_type: entity.entity_type.clone(),
            entity_id: entity.entity_id,
            entity_snapshot,
            status: ApprovalStatus::Pending,
            decision: None,
            requested_by,
            org_unit_id,
            module_code,
            row_version: 1,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        };

        let mut events = vec![ApprovalEvent::record(
            approval.tenant_id,
            approval.id,
            None,
            events::APPROVAL_REQUESTED,
            json!({ "definition_id": definition.id, "entity": entity }),
            Some(requested_by),
        )];

        let mut stages = Vec::with_capacity(rules.stages.len());
        for (idx, rule) in rules.stages.iter().enumerate() {
            let eligible = match &rule.condition {
                Some(cond) => cond.evaluate(&approval.entity_snapshot, self.currencies.as_ref())?,
                None => true,
            };
            let stage = ApprovalStage {
                id: Uuid::new_v4(),
                tenant_id: approval.tenant_id,
                approval_id: approval.id,
                stage_no: (idx + 1) as i32,
                name: rule.name.clone(),
                mode: rule.mode,
                quorum: rule.quorum,
                status: if eligible {
                    StageStatus::Pending
                } else {
                    StageStatus::Skipped
                },
                decision: None,
                activated_at: None,
                resolved_at: Some(now).filter(|_| !eligible),
                created_at: now,
            };
            if !eligible {
                events.push(ApprovalEvent::record(
                    approval.tenant_id,
                    approval.id,
                    None,
                    events::APPROVAL_STAGE_SKIPPED,
                    json!({ "stage_no": stage.stage_no, "name": stage.name }),
                    None,
                ));
            }
            stages.push(stage);
        }

        let mut tasks = Vec::new();
        let mut snapshots = Vec::new();
        let mut sla_timers = Vec::new();

        let first_eligible = stages
            .iter()
            .position(|s| s.status == StageStatus::Pending);

        match first_eligible {
            Some(pos) => {
                let rule = &rules.stages[pos];
                let activation = self
                    .activate_stage(&approval, &mut stages[pos], rule, now)
                    .await?;
                tasks.extend(activation.tasks);
                snapshots.extend(activation.snapshots);
                events.extend(activation.events);
                sla_timers.extend(activation.sla_timers);
            }
            None => {
                // Every stage was condition-skipped: nothing left to approve.
                approval.status = ApprovalStatus::Approved;
                approval.decision = Some(Decision::Approve);
                approval.resolved_at = Some(now);
                events.push(ApprovalEvent::record(
                    approval.tenant_id,
                    approval.id,
                    None,
                    events::APPROVAL_RESOLVED,
                    json!({ "status": "approved", "auto": true }),
                    None,
                ));
            }
        }

        Ok(ApprovalPlan {
            approval,
            stages,
            tasks,
            snapshots,
            events,
            sla_timers,
        })
    }

    /// Plan a decision on one task and run stage/quorum resolution.
    #[allow(clippy::too_many_arguments)]
    pub async fn plan_decision(
        &self,
        approval: &ApprovalInstance,
        rules: &ApprovalRules,
        stages: &[ApprovalStage],
        tasks: &[ApprovalTask],
        task_id: Uuid,
        decision: Decision,
        reason: Option<String>,
        actor: Uuid,
        actor_is_delegate: bool,
        escalation_kind: &str,
    ) -> Result<DecisionPlan> {
        if approval.status.is_terminal() {
            return Err(EngineError::InstanceTerminal {
                instance_id: approval.id,
                status: approval.status.to_string(),
            });
        }

        let task = tasks
            .iter()
            .find(|t| t.id == task_id)
            .ok_or(EngineError::NotFound {
                kind: "approval task",
                id: task_id,
            })?;
        let stage = stages
            .iter()
            .find(|s| s.id == task.stage_id)
            .ok_or(EngineError::NotFound {
                kind: "approval stage",
                id: task.stage_id,
            })?;

        if stage.status != StageStatus::Active {
            return Err(EngineError::StageNotActive {
                stage_id: stage.id,
                status: stage.status.to_string(),
            });
        }
        if !task.is_open() {
            return Err(EngineError::TaskAlreadyResolved {
                task_id: task.id,
                status: task.status.to_string(),
            });
        }
        if !actor_is_delegate && task.assignee_principal_id != Some(actor) {
            return Err(EngineError::TaskNotAssignedToActor {
                task_id: task.id,
                principal_id: actor,
            });
        }

        let now = Utc::now();
        let mut plan = DecisionPlan {
            outcome: StageOutcome::Pending,
            approval: approval.clone(),
            expected_version: approval.row_version,
            updated_stages: Vec::new(),
            updated_tasks: Vec::new(),
            new_tasks: Vec::new(),
            snapshots: Vec::new(),
            escalations: Vec::new(),
            events: Vec::new(),
            sla_timers: Vec::new(),
            settled_task_ids: Vec::new(),
        };
        plan.approval.row_version += 1;
        plan.approval.updated_at = now;

        // Settle the decided task.
        let mut decided = task.clone();
        decided.status = match decision {
            Decision::Approve => TaskStatus::Approved,
            Decision::Reject => TaskStatus::Rejected,
            Decision::Escalate => TaskStatus::Escalated,
        };
        decided.decision = Some(decision);
        decided.reason = reason.clone();
        decided.completed_at = Some(now);
        decided.updated_at = now;
        plan.settled_task_ids.push(decided.id);
        plan.events.push(ApprovalEvent::record(
            approval.tenant_id,
            approval.id,
            Some(decided.id),
            events::APPROVAL_TASK_DECIDED,
            json!({ "decision": decision, "reason": reason, "stage_no": stage.stage_no }),
            Some(actor),
        ));

        let rule = rules
            .stages
            .get((stage.stage_no - 1) as usize)
            .ok_or_else(|| {
                EngineError::DefinitionInvalid(format!(
                    "stage_no {} has no rule in the bound definition",
                    stage.stage_no
                ))
            })?;

        // Working copies of the active stage's tasks with the decision applied.
        let mut stage_tasks: Vec<ApprovalTask> = tasks
            .iter()
            .filter(|t| t.stage_id == stage.id)
            .map(|t| if t.id == decided.id { decided.clone() } else { t.clone() })
            .collect();
        plan.updated_tasks.push(decided.clone());

        // Escalation is not a quorum vote: record it, then apply the policy.
        let forced = if decision == Decision::Escalate {
            let policy = rule.escalation.unwrap_or(self.default_escalation);
            plan.escalations.push(ApprovalEscalation::record(
                approval.tenant_id,
                approval.id,
                Some(decided.id),
                escalation_kind,
                json!({ "policy": policy, "stage_no": stage.stage_no }),
            ));
            plan.events.push(ApprovalEvent::record(
                approval.tenant_id,
                approval.id,
                Some(decided.id),
                events::APPROVAL_ESCALATED,
                json!({ "kind": escalation_kind, "policy": policy }),
                Some(actor),
            ));
            match policy {
                EscalationPolicy::Reassign => {
                    let reassigned = self
                        .create_tasks(
                            approval,
                            stage,
                            &rule.escalate_to,
                            rule,
                            next_order_index(&stage_tasks),
                            now,
                            true,
                        )
                        .await?;
                    stage_tasks.extend(reassigned.tasks.iter().cloned());
                    plan.new_tasks.extend(reassigned.tasks);
                    plan.snapshots.extend(reassigned.snapshots);
                    plan.sla_timers.extend(reassigned.sla_timers);
                    for t in &plan.new_tasks {
                        plan.events.push(ApprovalEvent::record(
                            approval.tenant_id,
                            approval.id,
                            Some(t.id),
                            events::APPROVAL_TASK_REASSIGNED,
                            json!({ "stage_no": stage.stage_no }),
                            None,
                        ));
                    }
                    None
                }
                EscalationPolicy::AutoApprove => Some(QuorumOutcome::Approved),
                EscalationPolicy::AutoReject => Some(QuorumOutcome::Rejected),
                EscalationPolicy::Hold => {
                    plan.approval.status = ApprovalStatus::Escalated;
                    plan.outcome = StageOutcome::Escalated;
                    return Ok(plan);
                }
            }
        } else {
            None
        };

        // Work-list resolution: evaluate the active stage; an approved stage
        // activates the next eligible one, which may in turn need evaluation.
        let mut active_stage = stage.clone();
        let mut forced = forced;
        loop {
            let outcome =
                forced.take().unwrap_or_else(|| active_stage.quorum.evaluate(&tally(&stage_tasks)));

            match outcome {
                QuorumOutcome::Pending => {
                    // Serial stages hand the baton to the next open task,
                    // unless one is already holding it (e.g. a reassigned
                    // escalation task).
                    let baton_free = !stage_tasks
                        .iter()
                        .any(|t| matches!(t.status, TaskStatus::Assigned | TaskStatus::InProgress));
                    if active_stage.mode == StageMode::Serial && baton_free {
                        if let Some(next) = stage_tasks
                            .iter_mut()
                            .filter(|t| t.status == TaskStatus::Pending)
                            .min_by_key(|t| t.order_index)
                        {
                            next.status = TaskStatus::Assigned;
                            next.updated_at = now;
                            if let Some(sla) = rule.sla_seconds {
                                next.due_at = Some(now + Duration::seconds(sla));
                                plan.sla_timers.push(SlaTimer {
                                    task_id: next.id,
                                    fire_at: next.due_at.unwrap(),
                                });
                            }
                            plan.events.push(ApprovalEvent::record(
                                approval.tenant_id,
                                approval.id,
                                Some(next.id),
                                events::APPROVAL_TASK_ASSIGNED,
                                json!({ "stage_no": active_stage.stage_no }),
                                None,
                            ));
                            plan.updated_tasks.push(next.clone());
                        }
                    }
                    if decision == Decision::Escalate {
                        plan.outcome = StageOutcome::Escalated;
                    }
                    return Ok(plan);
                }

                QuorumOutcome::Approved | QuorumOutcome::Rejected => {
                    let stage_decision = if outcome == QuorumOutcome::Approved {
                        Decision::Approve
                    } else {
                        Decision::Reject
                    };
                    active_stage.status = StageStatus::Completed;
                    active_stage.decision = Some(stage_decision);
                    active_stage.resolved_at = Some(now);
                    plan.updated_stages.push(active_stage.clone());

                    // Tasks still open when the stage resolves are skipped.
                    for t in stage_tasks.iter_mut().filter(|t| t.is_open()) {
                        t.status = TaskStatus::Skipped;
                        t.updated_at = now;
                        plan.settled_task_ids.push(t.id);
                        plan.updated_tasks.push(t.clone());
                    }

                    plan.events.push(ApprovalEvent::record(
                        approval.tenant_id,
                        approval.id,
                        None,
                        events::APPROVAL_STAGE_RESOLVED,
                        json!({ "stage_no": active_stage.stage_no, "decision": stage_decision }),
                        None,
                    ));

                    if outcome == QuorumOutcome::Rejected {
                        // A rejected stage rejects the whole instance; later
                        // pending stages never run.
                        for s in stages.iter().filter(|s| {
                            s.stage_no > active_stage.stage_no && s.status == StageStatus::Pending
                        }) {
                            let mut canceled = s.clone();
                            canceled.status = StageStatus::Canceled;
                            canceled.resolved_at = Some(now);
                            plan.updated_stages.push(canceled);
                        }
                        self.resolve_instance(&mut plan, ApprovalStatus::Rejected, now);
                        plan.outcome = StageOutcome::Rejected;
                        return Ok(plan);
                    }

                    // Approved: activate the next pending stage, or resolve
                    // the instance if this was the last one.
                    let next = stages.iter().find(|s| {
                        s.stage_no > active_stage.stage_no && s.status == StageStatus::Pending
                    });
                    match next {
                        Some(next_stage) => {
                            let next_rule = rules
                                .stages
                                .get((next_stage.stage_no - 1) as usize)
                                .ok_or_else(|| {
                                    EngineError::DefinitionInvalid(format!(
                                        "stage_no {} has no rule in the bound definition",
                                        next_stage.stage_no
                                    ))
                                })?;
                            let mut activated = next_stage.clone();
                            let activation = self
                                .activate_stage(approval, &mut activated, next_rule, now)
                                .await?;
                            stage_tasks = activation.tasks.clone();
                            plan.new_tasks.extend(activation.tasks);
                            plan.snapshots.extend(activation.snapshots);
                            plan.events.extend(activation.events);
                            plan.sla_timers.extend(activation.sla_timers);
                            plan.updated_stages.push(activated.clone());
                            plan.outcome = StageOutcome::Advanced {
                                next_stage_no: activated.stage_no,
                            };
                            active_stage = activated;
                            // Loop again: a freshly activated stage with no
                            // answerable tasks must resolve immediately.
                            continue;
                        }
                        None => {
                            self.resolve_instance(&mut plan, ApprovalStatus::Approved, now);
                            plan.outcome = StageOutcome::Approved;
                            return Ok(plan);
                        }
                    }
                }
            }
        }
    }

    fn resolve_instance(&self, plan: &mut DecisionPlan, status: ApprovalStatus, now: DateTime<Utc>) {
        plan.approval.status = status;
        plan.approval.decision = Some(match status {
            ApprovalStatus::Approved => Decision::Approve,
            _ => Decision::Reject,
        });
        plan.approval.resolved_at = Some(now);
        plan.events.push(ApprovalEvent::record(
            plan.approval.tenant_id,
            plan.approval.id,
            None,
            events::APPROVAL_RESOLVED,
            json!({ "status": status }),
            None,
        ));
    }

    /// Resolve assignees, create tasks and the assignment snapshot, and mark
    /// the stage active.
    async fn activate_stage(
        &self,
        approval: &ApprovalInstance,
        stage: &mut ApprovalStage,
        rule: &StageRule,
        now: DateTime<Utc>,
    ) -> Result<StageActivation> {
        stage.status = StageStatus::Active;
        stage.activated_at = Some(now);

        let mut activation = self
            .create_tasks(approval, stage, &rule.assignees, rule, 1, now, false)
            .await?;
        activation.events.insert(
            0,
            ApprovalEvent::record(
                approval.tenant_id,
                approval.id,
                None,
                events::APPROVAL_STAGE_ACTIVATED,
                json!({ "stage_no": stage.stage_no, "name": stage.name }),
                None,
            ),
        );
        Ok(activation)
    }

    /// Create one task per resolved principal. In serial mode only the first
    /// new task is assigned (the rest wait their turn); reassignment always
    /// assigns immediately.
    #[allow(clippy::too_many_arguments)]
    async fn create_tasks(
        &self,
        approval: &ApprovalInstance,
        stage: &ApprovalStage,
        assignees: &[super::rules::AssigneeRef],
        rule: &StageRule,
        first_order_index: i32,
        now: DateTime<Utc>,
        reassignment: bool,
    ) -> Result<StageActivation> {
        use super::rules::AssigneeRef;

        let mut tasks = Vec::new();
        let mut snapshots = Vec::new();
        let mut sla_timers = Vec::new();
        let mut order_index = first_order_index;

        for assignee in assignees {
            let principals = self.resolver.resolve(approval.tenant_id, assignee).await?;
            let group_id = match assignee {
                AssigneeRef::Group(g) => Some(*g),
                AssigneeRef::Principal(_) => None,
            };
            snapshots.push(AssignmentSnapshot::record(
                approval.tenant_id,
                approval.id,
                stage.id,
                group_id,
                principals.clone(),
            ));

            for principal in principals {
                let assigned = reassignment
                    || stage.mode == StageMode::Parallel
                    || order_index == first_order_index;
                let due_at = if assigned {
                    rule.sla_seconds.map(|s| now + Duration::seconds(s))
                } else {
                    None
                };
                let task = ApprovalTask {
                    id: Uuid::new_v4(),
                    tenant_id: approval.tenant_id,
                    approval_id: approval.id,
                    stage_id: stage.id,
                    order_index,
                    status: if assigned {
                        TaskStatus::Assigned
                    } else {
                        TaskStatus::Pending
                    },
                    decision: None,
                    reason: None,
                    assignee_principal_id: Some(principal),
                    assignee_group_id: group_id,
                    due_at,
                    completed_at: None,
                    created_at: now,
                    updated_at: now,
                };
                if let Some(due) = due_at {
                    sla_timers.push(SlaTimer {
                        task_id: task.id,
                        fire_at: due,
                    });
                }
                tasks.push(task);
                order_index += 1;
            }
        }

        Ok(StageActivation {
            tasks,
            snapshots,
            events: Vec::new(),
            sla_timers,
        })
    }
}

struct StageActivation {
    tasks: Vec<ApprovalTask>,
    snapshots: Vec<AssignmentSnapshot>,
    events: Vec<ApprovalEvent>,
    sla_timers: Vec<SlaTimer>,
}

fn tally(tasks: &[ApprovalTask]) -> TaskTally {
    let mut t = TaskTally::default();
    for task in tasks {
        match task.status {
            TaskStatus::Approved => t.approved += 1,
            TaskStatus::Rejected => t.rejected += 1,
            s if s.is_open() => t.answerable += 1,
            // skipped and escalated tasks count toward neither side
            _ => {}
        }
    }
    t
}

fn next_order_index(tasks: &[ApprovalTask]) -> i32 {
    tasks.iter().map(|t| t.order_index).max().unwrap_or(0) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally_ignores_settled_and_escalated() {
        let now = Utc::now();
        let mk = |status: TaskStatus| ApprovalTask {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            approval_id: Uuid::new_v4(),
            stage_id: Uuid::new_v4(),
            order_index: 1,
            status,
            decision: None,
            reason: None,
            assignee_principal_id: Some(Uuid::new_v4()),
            assignee_group_id: None,
            due_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };

        let tasks = vec![
            mk(TaskStatus::Approved),
            mk(TaskStatus::Rejected),
            mk(TaskStatus::Assigned),
            mk(TaskStatus::Pending),
            mk(TaskStatus::Escalated),
            mk(TaskStatus::Skipped),
        ];
        let t = tally(&tasks);
        assert_eq!(t.approved, 1);
        assert_eq!(t.rejected, 1);
        assert_eq!(t.answerable, 2);
    }
}

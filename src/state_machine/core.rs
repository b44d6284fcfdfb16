//! Transition planning.
//!
//! `plan_transition` validates a requested state change against the bound
//! version's graph and produces a [`TransitionPlan`]: the CAS-guarded
//! instance update, the append-only transition record, and the timer side
//! effects declared by the target state. The plan is committed atomically by
//! the storage layer; nothing here touches the store.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use super::graph::LifecycleGraph;
use super::guards;
use super::states::InstanceStatus;
use crate::error::Result;
use crate::models::{LifecycleVersion, TimerType, WorkflowInstance, WorkflowTransition};

/// A timer the target state's policy asks to schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerRequest {
    pub timer_type: TimerType,
    pub fire_at: DateTime<Utc>,
    pub policy_snapshot: Value,
}

/// Everything a validated transition will mutate, computed up front.
#[derive(Debug, Clone)]
pub struct TransitionPlan {
    /// Updated instance row; committed with a compare-and-swap on
    /// `expected_version`.
    pub instance: WorkflowInstance,
    pub expected_version: i64,
    pub transition: WorkflowTransition,
    /// All pending timers for the entity are canceled on any transition;
    /// a manual move preempts whatever the previous state scheduled.
    pub cancel_pending_timers: bool,
    pub schedule: Vec<TimerRequest>,
}

/// Outcome reported to the caller after a plan commits.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TransitionResult {
    pub instance_id: Uuid,
    pub from_state: Option<String>,
    pub to_state: String,
    pub status: InstanceStatus,
}

impl TransitionPlan {
    pub fn result(&self) -> TransitionResult {
        TransitionResult {
            instance_id: self.instance.id,
            from_state: self.transition.from_state.clone(),
            to_state: self.transition.to_state.clone(),
            status: self.instance.status,
        }
    }
}

/// Build the plan for starting a new workflow: the instance enters the
/// graph's initial state and the initial state's timer policies are
/// scheduled.
#[allow(clippy::too_many_arguments)]
pub fn plan_start(
    tenant_id: Uuid,
    entity_type: &str,
    entity_id: Uuid,
    version: &LifecycleVersion,
    graph: &LifecycleGraph,
    triggered_by: Uuid,
    org_unit_id: Option<Uuid>,
    module_code: Option<String>,
) -> Result<TransitionPlan> {
    let now = Utc::now();
    let initial = graph.initial().to_string();
    let instance = WorkflowInstance {
        id: Uuid::new_v4(),
        tenant_id,
        entity_type: entity_type.to_string(),
        entity_id,
        lifecycle_id: version.lifecycle_id,
        version_id: version.id,
        current_state: initial.clone(),
        previous_state: None,
        status: graph.status_on_entry(&initial),
        org_unit_id,
        module_code,
        row_version: 1,
        created_at: now,
        updated_at: now,
    };

    let transition = WorkflowTransition::record(
        tenant_id,
        instance.id,
        None,
        initial.clone(),
        Some(triggered_by),
        None,
        1,
    );

    let schedule = timers_for_state(graph, &instance, &initial, now);

    Ok(TransitionPlan {
        instance,
        expected_version: 0, // insert, not CAS
        transition,
        cancel_pending_timers: false,
        schedule,
    })
}

/// Validate and plan a single `current_state -> to_state` move.
#[allow(clippy::too_many_arguments)]
pub fn plan_transition(
    instance: &WorkflowInstance,
    graph: &LifecycleGraph,
    latest_version: i32,
    bound_version: i32,
    strict_version_check: bool,
    to_state: &str,
    triggered_by: Uuid,
    transition_data: Option<Value>,
    override_allowed: bool,
    next_sort_key: i32,
) -> Result<TransitionPlan> {
    guards::ensure_instance_active(instance)?;
    guards::ensure_version_current(strict_version_check, bound_version, latest_version)?;
    guards::ensure_edge_defined(graph, &instance.current_state, to_state, override_allowed)?;

    let now = Utc::now();
    let mut updated = instance.clone();
    updated.previous_state = Some(instance.current_state.clone());
    updated.current_state = to_state.to_string();
    updated.status = graph.status_on_entry(to_state);
    updated.row_version = instance.row_version + 1;
    updated.updated_at = now;

    let transition = WorkflowTransition::record(
        instance.tenant_id,
        instance.id,
        Some(instance.current_state.clone()),
        to_state,
        Some(triggered_by),
        transition_data,
        next_sort_key,
    );

    // Entering a terminal state schedules nothing; its mapped status also
    // forces cancellation of everything still pending for the entity.
    let schedule = if updated.status.is_terminal() {
        Vec::new()
    } else {
        timers_for_state(graph, instance, to_state, now)
    };

    Ok(TransitionPlan {
        instance: updated,
        expected_version: instance.row_version,
        transition,
        cancel_pending_timers: true,
        schedule,
    })
}

fn timers_for_state(
    graph: &LifecycleGraph,
    instance: &WorkflowInstance,
    state: &str,
    now: DateTime<Utc>,
) -> Vec<TimerRequest> {
    let Some(node) = graph.state(state) else {
        return Vec::new();
    };
    node.timers
        .iter()
        .map(|policy| TimerRequest {
            timer_type: policy.timer_type,
            fire_at: now + Duration::seconds(policy.after_seconds),
            policy_snapshot: json!({
                "timer_type": policy.timer_type,
                "after_seconds": policy.after_seconds,
                "to_state": policy.to_state,
                "state": state,
                "lifecycle_id": instance.lifecycle_id,
                "instance_id": instance.id,
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    fn sample_graph() -> LifecycleGraph {
        LifecycleGraph::parse(&json!({
            "initial": "draft",
            "states": [
                { "name": "draft" },
                { "name": "submitted", "timers": [
                    { "timer_type": "auto_transition", "after_seconds": 86400, "to_state": "approved" }
                ]},
                { "name": "approved", "terminal": "completed" },
                { "name": "rejected", "terminal": "failed" }
            ],
            "transitions": [
                { "from": "draft", "to": "submitted" },
                { "from": "submitted", "to": "approved" },
                { "from": "submitted", "to": "rejected" }
            ]
        }))
        .unwrap()
    }

    fn sample_version() -> LifecycleVersion {
        LifecycleVersion {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            lifecycle_id: Uuid::new_v4(),
            version: 1,
            definition: json!({}),
            created_at: Utc::now(),
        }
    }

    fn started_instance(graph: &LifecycleGraph) -> WorkflowInstance {
        let version = sample_version();
        plan_start(
            version.tenant_id,
            "purchase_order",
            Uuid::new_v4(),
            &version,
            graph,
            Uuid::new_v4(),
            None,
            None,
        )
        .unwrap()
        .instance
    }

    #[test]
    fn test_start_enters_initial_state() {
        let graph = sample_graph();
        let version = sample_version();
        let plan = plan_start(
            version.tenant_id,
            "purchase_order",
            Uuid::new_v4(),
            &version,
            &graph,
            Uuid::new_v4(),
            None,
            None,
        )
        .unwrap();

        assert_eq!(plan.instance.current_state, "draft");
        assert_eq!(plan.instance.status, InstanceStatus::Active);
        assert_eq!(plan.transition.from_state, None);
        assert_eq!(plan.transition.to_state, "draft");
        assert_eq!(plan.transition.sort_key, 1);
        assert!(plan.schedule.is_empty()); // draft declares no timers
    }

    #[test]
    fn test_valid_transition_schedules_target_timers() {
        let graph = sample_graph();
        let instance = started_instance(&graph);

        let plan = plan_transition(
            &instance, &graph, 1, 1, false, "submitted",
            Uuid::new_v4(), None, false, 2,
        )
        .unwrap();

        assert_eq!(plan.instance.current_state, "submitted");
        assert_eq!(plan.instance.previous_state.as_deref(), Some("draft"));
        assert_eq!(plan.instance.row_version, instance.row_version + 1);
        assert_eq!(plan.expected_version, instance.row_version);
        assert!(plan.cancel_pending_timers);
        assert_eq!(plan.schedule.len(), 1);
        assert_eq!(plan.schedule[0].timer_type, TimerType::AutoTransition);
    }

    #[test]
    fn test_entering_terminal_state_sets_status_and_schedules_nothing() {
        let graph = sample_graph();
        let mut instance = started_instance(&graph);
        instance.current_state = "submitted".into();

        let plan = plan_transition(
            &instance, &graph, 1, 1, false, "approved",
            Uuid::new_v4(), None, false, 3,
        )
        .unwrap();

        assert_eq!(plan.instance.status, InstanceStatus::Completed);
        assert!(plan.schedule.is_empty());
        assert!(plan.cancel_pending_timers);
    }

    #[test]
    fn test_undefined_edge_is_rejected() {
        let graph = sample_graph();
        let instance = started_instance(&graph);

        let err = plan_transition(
            &instance, &graph, 1, 1, false, "approved",
            Uuid::new_v4(), None, false, 2,
        )
        .unwrap_err();

        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn test_override_capability_bypasses_edge_table() {
        let graph = sample_graph();
        let instance = started_instance(&graph);

        let plan = plan_transition(
            &instance, &graph, 1, 1, false, "approved",
            Uuid::new_v4(), None, true, 2,
        )
        .unwrap();
        assert_eq!(plan.instance.current_state, "approved");
    }

    #[test]
    fn test_terminal_instance_rejects_transitions() {
        let graph = sample_graph();
        let mut instance = started_instance(&graph);
        instance.current_state = "approved".into();
        instance.status = InstanceStatus::Completed;

        let err = plan_transition(
            &instance, &graph, 1, 1, false, "rejected",
            Uuid::new_v4(), None, true, 3,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InstanceNotActive { .. }));
    }

    #[test]
    fn test_strict_version_mode() {
        let graph = sample_graph();
        let instance = started_instance(&graph);

        let err = plan_transition(
            &instance, &graph, 2, 1, true, "submitted",
            Uuid::new_v4(), None, false, 2,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::VersionMismatch { .. }));
    }
}

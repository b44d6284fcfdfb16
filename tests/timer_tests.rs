//! Durable timer behavior: state-entry scheduling, cancel-on-transition,
//! exactly-once firing, crash recovery, and SLA escalation.

mod common;

use chrono::{Duration, Utc};
use common::*;
use serde_json::json;
use uuid::Uuid;
use wf_engine::approval::{ApprovalStatus, Decision, TaskStatus};
use wf_engine::authz::{ActorContext, ConstraintType};
use wf_engine::constants::operations;
use wf_engine::models::{
    EntityRef, NewApprovalDefinition, NewLifecycleDefinition, TimerStatus, TimerType,
};
use wf_engine::state_machine::InstanceStatus;
use wf_engine::storage::Store;
use wf_engine::TransitionResult;

async fn start_with_timers(h: &Harness) -> (TransitionResult, EntityRef) {
    let admin = h.admin();
    let def = h
        .engine
        .create_lifecycle_definition(
            &admin,
            NewLifecycleDefinition {
                tenant_id: h.tenant_id,
                code: "po-lifecycle".into(),
                entity_type: "purchase_order".into(),
                definition: po_lifecycle_with_timers(),
            },
        )
        .await
        .unwrap();
    let entity = purchase_order();
    let started = h
        .engine
        .start_workflow(&admin, h.tenant_id, def.id, entity.clone(), None, None)
        .await
        .unwrap();
    (started, entity)
}

#[tokio::test]
async fn test_state_entry_schedules_and_transition_cancels() {
    let h = harness();
    h.grant_admin();
    let admin = h.admin();
    let (started, entity) = start_with_timers(&h).await;

    // Entering draft scheduled its reminder.
    let pending = h
        .store
        .scheduled_timers_for_entity(h.tenant_id, &entity)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].timer_type, TimerType::Reminder);
    let reminder_id = pending[0].id;

    // Moving on cancels the draft reminder and schedules the submitted
    // deadline in the same change set.
    h.engine
        .request_transition(&admin, started.instance_id, "submitted", None)
        .await
        .unwrap();

    let pending = h
        .store
        .scheduled_timers_for_entity(h.tenant_id, &entity)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].timer_type, TimerType::AutoTransition);

    let reminder = h.store.timer(reminder_id).await.unwrap();
    assert_eq!(reminder.status, TimerStatus::Canceled);
    assert!(reminder.canceled_at.is_some());

    // Firing the canceled timer is a no-op.
    assert!(!h.engine.fire_timer(reminder_id).await.unwrap());
}

#[tokio::test]
async fn test_auto_transition_fires_exactly_once() {
    let h = harness();
    h.grant_admin();
    let admin = h.admin();
    let (started, entity) = start_with_timers(&h).await;
    h.engine
        .request_transition(&admin, started.instance_id, "submitted", None)
        .await
        .unwrap();
    let deadline = h
        .store
        .scheduled_timers_for_entity(h.tenant_id, &entity)
        .await
        .unwrap()[0]
        .id;

    assert!(h.engine.fire_timer(deadline).await.unwrap());

    let instance = h.store.workflow_instance(started.instance_id).await.unwrap();
    assert_eq!(instance.current_state, "approved");
    assert_eq!(instance.status, InstanceStatus::Completed);

    let timer = h.store.timer(deadline).await.unwrap();
    assert_eq!(timer.status, TimerStatus::Fired);
    assert!(timer.fired_at.is_some());

    // A replay loses the scheduled -> fired flip.
    assert!(!h.engine.fire_timer(deadline).await.unwrap());
}

#[tokio::test]
async fn test_poll_fires_only_past_due_timers() {
    let h = harness();
    h.grant_admin();
    let admin = h.admin();
    let (started, _) = start_with_timers(&h).await;
    h.engine
        .request_transition(&admin, started.instance_id, "submitted", None)
        .await
        .unwrap();

    // The 24h deadline is not due yet.
    assert_eq!(h.engine.poll_due_timers(Utc::now()).await.unwrap(), 0);

    let fired = h
        .engine
        .poll_due_timers(Utc::now() + Duration::days(2))
        .await
        .unwrap();
    assert_eq!(fired, 1);
    let instance = h.store.workflow_instance(started.instance_id).await.unwrap();
    assert_eq!(instance.current_state, "approved");
}

#[tokio::test]
async fn test_recovery_replays_missed_timers() {
    let h = harness();
    h.grant_admin();
    let admin = h.admin();
    let (started, _) = start_with_timers(&h).await;
    h.engine
        .request_transition(&admin, started.instance_id, "submitted", None)
        .await
        .unwrap();

    // Schedule rows survive a dead process; recovery fires what it missed.
    let fired = h
        .engine
        .recover(Utc::now() + Duration::days(2))
        .await
        .unwrap();
    assert_eq!(fired, 1);
    let instance = h.store.workflow_instance(started.instance_id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);

    assert_eq!(
        h.engine.recover(Utc::now() + Duration::days(2)).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_cancel_workflow_revokes_pending_timers() {
    let h = harness();
    h.grant_admin();
    let admin = h.admin();
    let (started, entity) = start_with_timers(&h).await;

    h.engine
        .cancel_workflow(&admin, started.instance_id, None)
        .await
        .unwrap();

    let pending = h
        .store
        .scheduled_timers_for_entity(h.tenant_id, &entity)
        .await
        .unwrap();
    assert!(pending.is_empty());
    assert_eq!(
        h.engine
            .poll_due_timers(Utc::now() + Duration::days(2))
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_transition_publishes_timer_schedule_changes() {
    let h = harness();
    h.grant_admin();
    let admin = h.admin();
    let (started, _) = start_with_timers(&h).await;

    // Leaving draft cancels its reminder and schedules the submitted
    // deadline; both land on the event stream.
    let mut rx = h.engine.publisher().subscribe();
    h.engine
        .request_transition(&admin, started.instance_id, "submitted", None)
        .await
        .unwrap();

    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        names.push(event.name);
    }
    assert!(names.contains(&"timer.canceled".to_string()));
    assert!(names.contains(&"timer.scheduled".to_string()));
}

#[tokio::test]
async fn test_reminder_fire_publishes_events() {
    let h = harness();
    h.grant_admin();
    let (_, _) = start_with_timers(&h).await;

    let mut rx = h.engine.publisher().subscribe();
    let fired = h
        .engine
        .poll_due_timers(Utc::now() + Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(fired, 1);

    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        names.push(event.name);
    }
    assert!(names.contains(&"timer.fired".to_string()));
    assert!(names.contains(&"timer.reminder_due".to_string()));
}

// -- SLA deadlines on approval tasks -----------------------------------------

async fn request_with_sla(h: &Harness, stage: serde_json::Value) -> Uuid {
    let admin = h.admin();
    let def = h
        .engine
        .create_approval_definition(
            &admin,
            NewApprovalDefinition {
                tenant_id: h.tenant_id,
                code: "po-approval".into(),
                entity_type: "purchase_order".into(),
                rules: json!({ "stages": [stage] }),
            },
        )
        .await
        .unwrap();
    h.engine
        .request_approval(&admin, h.tenant_id, def.id, purchase_order(), json!({}), None, None)
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_sla_breach_escalates_the_task() {
    let h = harness();
    h.grant_admin();
    let alice = Uuid::new_v4();

    let approval_id = request_with_sla(
        &h,
        json!({
            "name": "manager",
            "mode": "serial",
            "assignees": [ { "principal": alice } ],
            "sla_seconds": 3600
        }),
    )
    .await;

    let fired = h
        .engine
        .poll_due_timers(Utc::now() + Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(fired, 1);

    let tasks = h.store.tasks_for_approval(approval_id).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Escalated);

    // Default policy holds the approval for an operator.
    let approval = h.store.approval_instance(approval_id).await.unwrap();
    assert_eq!(approval.status, ApprovalStatus::Escalated);

    let escalations = h.store.escalations_for(approval_id).await.unwrap();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].kind, "sla_breach");
}

#[tokio::test]
async fn test_sla_breach_reassigns_when_configured() {
    let h = harness();
    h.grant_admin();
    h.grant("approver", operations::APPROVAL_DECIDE, ConstraintType::Own);
    let (alice, carol) = (Uuid::new_v4(), Uuid::new_v4());

    let approval_id = request_with_sla(
        &h,
        json!({
            "name": "manager",
            "mode": "serial",
            "assignees": [ { "principal": alice } ],
            "sla_seconds": 3600,
            "escalation": "reassign",
            "escalate_to": [ { "principal": carol } ]
        }),
    )
    .await;

    assert_eq!(
        h.engine
            .poll_due_timers(Utc::now() + Duration::hours(2))
            .await
            .unwrap(),
        1
    );

    // The breach handed the task to carol; the approval is still open and
    // carol's replacement task carries its own deadline.
    let approval = h.store.approval_instance(approval_id).await.unwrap();
    assert_eq!(approval.status, ApprovalStatus::Pending);
    let tasks = h.store.tasks_for_approval(approval_id).await.unwrap();
    let carols = tasks
        .iter()
        .find(|t| t.assignee_principal_id == Some(carol))
        .unwrap();
    assert_eq!(carols.status, TaskStatus::Assigned);
    assert!(carols.due_at.is_some());

    let carol_ctx = ActorContext::new(carol, vec!["approver".to_string()]);
    h.engine
        .submit_decision(&carol_ctx, approval_id, carols.id, Decision::Approve, None)
        .await
        .unwrap();
    let approval = h.store.approval_instance(approval_id).await.unwrap();
    assert_eq!(approval.status, ApprovalStatus::Approved);
}

#[tokio::test]
async fn test_decision_cancels_the_sla_timer() {
    let h = harness();
    h.grant_admin();
    h.grant("approver", operations::APPROVAL_DECIDE, ConstraintType::Own);
    let alice = Uuid::new_v4();

    let approval_id = request_with_sla(
        &h,
        json!({
            "name": "manager",
            "mode": "serial",
            "assignees": [ { "principal": alice } ],
            "sla_seconds": 3600
        }),
    )
    .await;
    let tasks = h.store.tasks_for_approval(approval_id).await.unwrap();
    let task_entity = EntityRef::new("approval_task", tasks[0].id);
    let deadline = h
        .store
        .scheduled_timers_for_entity(h.tenant_id, &task_entity)
        .await
        .unwrap()[0]
        .id;

    let alice_ctx = ActorContext::new(alice, vec!["approver".to_string()]);
    h.engine
        .submit_decision(&alice_ctx, approval_id, tasks[0].id, Decision::Approve, None)
        .await
        .unwrap();

    // Settling the task revoked its deadline; nothing is left to breach.
    let timer = h.store.timer(deadline).await.unwrap();
    assert_eq!(timer.status, TimerStatus::Canceled);
    assert_eq!(
        h.engine
            .poll_due_timers(Utc::now() + Duration::hours(2))
            .await
            .unwrap(),
        0
    );
}

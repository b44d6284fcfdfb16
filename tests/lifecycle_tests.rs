//! Workflow lifecycle behavior through the engine facade: definition
//! versioning, transition recording, status flips, and guard rejections.

mod common;

use common::*;
use serde_json::json;
use uuid::Uuid;
use wf_engine::authz::ConstraintType;
use wf_engine::constants::operations;
use wf_engine::models::NewLifecycleDefinition;
use wf_engine::state_machine::InstanceStatus;
use wf_engine::storage::Store;
use wf_engine::EngineError;

#[tokio::test]
async fn test_full_lifecycle_records_every_transition() {
    let h = harness();
    h.grant_admin();
    let admin = h.admin();

    let def = h
        .engine
        .create_lifecycle_definition(
            &admin,
            NewLifecycleDefinition {
                tenant_id: h.tenant_id,
                code: "po-lifecycle".into(),
                entity_type: "purchase_order".into(),
                definition: po_lifecycle(),
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
    assert_eq!(started.to_state, "draft");
    assert_eq!(started.status, InstanceStatus::Active);

    let t1 = h
        .engine
        .request_transition(&admin, started.instance_id, "submitted", None)
        .await
        .unwrap();
    assert_eq!(t1.from_state.as_deref(), Some("draft"));

    let t2 = h
        .engine
        .request_transition(&admin, started.instance_id, "approved", None)
        .await
        .unwrap();
    assert_eq!(t2.status, InstanceStatus::Completed);

    // Start row plus two moves, in sort order, each from matching the
    // previous to.
    let transitions = h.store.transitions_for(started.instance_id).await.unwrap();
    assert_eq!(transitions.len(), 3);
    assert_eq!(transitions[0].from_state, None);
    assert_eq!(transitions[0].to_state, "draft");
    assert_eq!(transitions[1].from_state.as_deref(), Some("draft"));
    assert_eq!(transitions[1].to_state, "submitted");
    assert_eq!(transitions[2].from_state.as_deref(), Some("submitted"));
    assert_eq!(transitions[2].to_state, "approved");
    assert_eq!(
        transitions.iter().map(|t| t.sort_key).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
}

#[tokio::test]
async fn test_terminal_instance_rejects_further_transitions() {
    let h = harness();
    h.grant_admin();
    let admin = h.admin();

    let def = h
        .engine
        .create_lifecycle_definition(
            &admin,
            NewLifecycleDefinition {
                tenant_id: h.tenant_id,
                code: "po-lifecycle".into(),
                entity_type: "purchase_order".into(),
                definition: po_lifecycle(),
            },
        )
        .await
        .unwrap();
    let started = h
        .engine
        .start_workflow(&admin, h.tenant_id, def.id, purchase_order(), None, None)
        .await
        .unwrap();
    h.engine
        .request_transition(&admin, started.instance_id, "submitted", None)
        .await
        .unwrap();
    h.engine
        .request_transition(&admin, started.instance_id, "approved", None)
        .await
        .unwrap();

    let before = h.store.transitions_for(started.instance_id).await.unwrap().len();
    let err = h
        .engine
        .request_transition(&admin, started.instance_id, "rejected", None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InstanceNotActive { .. }));
    // Nothing was recorded for the rejected request.
    let after = h.store.transitions_for(started.instance_id).await.unwrap().len();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_undefined_edge_rejected_unless_override_granted() {
    let h = harness();
    h.grant("clerk", operations::WORKFLOW_START, ConstraintType::None);
    h.grant("clerk", operations::WORKFLOW_TRANSITION, ConstraintType::None);
    h.grant("clerk", operations::DEFINITION_MANAGE, ConstraintType::None);
    let clerk = h.actor("clerk");

    let def = h
        .engine
        .create_lifecycle_definition(
            &clerk,
            NewLifecycleDefinition {
                tenant_id: h.tenant_id,
                code: "po-lifecycle".into(),
                entity_type: "purchase_order".into(),
                definition: po_lifecycle(),
            },
        )
        .await
        .unwrap();
    let started = h
        .engine
        .start_workflow(&clerk, h.tenant_id, def.id, purchase_order(), None, None)
        .await
        .unwrap();

    // draft -> approved is not a defined edge.
    let err = h
        .engine
        .request_transition(&clerk, started.instance_id, "approved", None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    // The override capability moves to any defined state.
    h.grant("clerk", operations::WORKFLOW_OVERRIDE, ConstraintType::None);
    let moved = h
        .engine
        .request_transition(&clerk, started.instance_id, "approved", None)
        .await
        .unwrap();
    assert_eq!(moved.to_state, "approved");
}

#[tokio::test]
async fn test_one_live_instance_per_entity() {
    let h = harness();
    h.grant_admin();
    let admin = h.admin();

    let def = h
        .engine
        .create_lifecycle_definition(
            &admin,
            NewLifecycleDefinition {
                tenant_id: h.tenant_id,
                code: "po-lifecycle".into(),
                entity_type: "purchase_order".into(),
                definition: po_lifecycle(),
            },
        )
        .await
        .unwrap();

    let entity = purchase_order();
    h.engine
        .start_workflow(&admin, h.tenant_id, def.id, entity.clone(), None, None)
        .await
        .unwrap();
    let err = h
        .engine
        .start_workflow(&admin, h.tenant_id, def.id, entity, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateInstance { .. }));
}

#[tokio::test]
async fn test_running_instances_keep_their_bound_version() {
    let h = harness();
    h.grant_admin();
    let admin = h.admin();

    let mut def = h
        .engine
        .create_lifecycle_definition(
            &admin,
            NewLifecycleDefinition {
                tenant_id: h.tenant_id,
                code: "po-lifecycle".into(),
                entity_type: "purchase_order".into(),
                definition: po_lifecycle(),
            },
        )
        .await
        .unwrap();

    let first = h
        .engine
        .start_workflow(&admin, h.tenant_id, def.id, purchase_order(), None, None)
        .await
        .unwrap();

    // Edit the definition: add an on_hold state.
    def.definition = json!({
        "initial": "draft",
        "states": [
            { "name": "draft" },
            { "name": "on_hold" },
            { "name": "submitted" },
            { "name": "approved", "terminal": "completed" },
            { "name": "rejected", "terminal": "failed" }
        ],
        "transitions": [
            { "from": "draft", "to": "on_hold" },
            { "from": "on_hold", "to": "draft" },
            { "from": "draft", "to": "submitted" },
            { "from": "submitted", "to": "approved" },
            { "from": "submitted", "to": "rejected" }
        ]
    });
    let def = h.engine.update_lifecycle_definition(&admin, def).await.unwrap();

    // The next start snapshots the edit as version 2.
    let second = h
        .engine
        .start_workflow(&admin, h.tenant_id, def.id, purchase_order(), None, None)
        .await
        .unwrap();

    let first_instance = h.store.workflow_instance(first.instance_id).await.unwrap();
    let second_instance = h.store.workflow_instance(second.instance_id).await.unwrap();
    let v1 = h.store.lifecycle_version(first_instance.version_id).await.unwrap();
    let v2 = h.store.lifecycle_version(second_instance.version_id).await.unwrap();
    assert_eq!(v1.version, 1);
    assert_eq!(v2.version, 2);

    // The first instance still runs the old graph: on_hold is unknown to it.
    let err = h
        .engine
        .request_transition(&admin, first.instance_id, "on_hold", None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
    // The second instance has the new edge.
    h.engine
        .request_transition(&admin, second.instance_id, "on_hold", None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_strict_version_check_rejects_superseded_instances() {
    let mut config = wf_engine::EngineConfig::default();
    config.strict_version_check = true;
    let h = harness_with_config(config);
    h.grant_admin();
    let admin = h.admin();

    let mut def = h
        .engine
        .create_lifecycle_definition(
            &admin,
            NewLifecycleDefinition {
                tenant_id: h.tenant_id,
                code: "po-lifecycle".into(),
                entity_type: "purchase_order".into(),
                definition: po_lifecycle(),
            },
        )
        .await
        .unwrap();
    let first = h
        .engine
        .start_workflow(&admin, h.tenant_id, def.id, purchase_order(), None, None)
        .await
        .unwrap();

    // Supersede version 1.
    def.definition["states"]
        .as_array_mut()
        .unwrap()
        .push(json!({ "name": "archived", "terminal": "completed" }));
    def.definition["transitions"]
        .as_array_mut()
        .unwrap()
        .push(json!({ "from": "approved", "to": "archived" }));
    let def = h.engine.update_lifecycle_definition(&admin, def).await.unwrap();
    h.engine
        .start_workflow(&admin, h.tenant_id, def.id, purchase_order(), None, None)
        .await
        .unwrap();

    let err = h
        .engine
        .request_transition(&admin, first.instance_id, "submitted", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::VersionMismatch { bound: 1, latest: 2 }
    ));
}

#[tokio::test]
async fn test_pause_blocks_transitions_until_resume() {
    let h = harness();
    h.grant_admin();
    let admin = h.admin();

    let def = h
        .engine
        .create_lifecycle_definition(
            &admin,
            NewLifecycleDefinition {
                tenant_id: h.tenant_id,
                code: "po-lifecycle".into(),
                entity_type: "purchase_order".into(),
                definition: po_lifecycle(),
            },
        )
        .await
        .unwrap();
    let started = h
        .engine
        .start_workflow(&admin, h.tenant_id, def.id, purchase_order(), None, None)
        .await
        .unwrap();

    let paused = h
        .engine
        .pause_workflow(&admin, started.instance_id, Some(json!({"reason": "audit"})))
        .await
        .unwrap();
    assert_eq!(paused.status, InstanceStatus::Paused);
    // The flip is recorded as a self-transition.
    assert_eq!(paused.from_state, Some("draft".to_string()));
    assert_eq!(paused.to_state, "draft");

    let err = h
        .engine
        .request_transition(&admin, started.instance_id, "submitted", None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InstanceNotActive { .. }));

    // Pausing a paused instance is rejected too.
    let err = h
        .engine
        .pause_workflow(&admin, started.instance_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InstanceNotActive { .. }));

    h.engine
        .resume_workflow(&admin, started.instance_id, None)
        .await
        .unwrap();
    h.engine
        .request_transition(&admin, started.instance_id, "submitted", None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_cancel_is_terminal() {
    let h = harness();
    h.grant_admin();
    let admin = h.admin();

    let def = h
        .engine
        .create_lifecycle_definition(
            &admin,
            NewLifecycleDefinition {
                tenant_id: h.tenant_id,
                code: "po-lifecycle".into(),
                entity_type: "purchase_order".into(),
                definition: po_lifecycle(),
            },
        )
        .await
        .unwrap();
    let started = h
        .engine
        .start_workflow(&admin, h.tenant_id, def.id, purchase_order(), None, None)
        .await
        .unwrap();

    let canceled = h
        .engine
        .cancel_workflow(&admin, started.instance_id, None)
        .await
        .unwrap();
    assert_eq!(canceled.status, InstanceStatus::Canceled);

    let err = h
        .engine
        .resume_workflow(&admin, started.instance_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InstanceTerminal { .. }));
}

#[tokio::test]
async fn test_operations_require_capability_grants() {
    let h = harness();
    h.grant_admin();
    let admin = h.admin();
    let viewer = h.actor("viewer"); // no grants

    let def = h
        .engine
        .create_lifecycle_definition(
            &admin,
            NewLifecycleDefinition {
                tenant_id: h.tenant_id,
                code: "po-lifecycle".into(),
                entity_type: "purchase_order".into(),
                definition: po_lifecycle(),
            },
        )
        .await
        .unwrap();

    let err = h
        .engine
        .start_workflow(&viewer, h.tenant_id, def.id, purchase_order(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PermissionDenied { .. }));
}

#[tokio::test]
async fn test_lifecycle_governs_one_entity_type() {
    let h = harness();
    h.grant_admin();
    let admin = h.admin();

    let def = h
        .engine
        .create_lifecycle_definition(
            &admin,
            NewLifecycleDefinition {
                tenant_id: h.tenant_id,
                code: "po-lifecycle".into(),
                entity_type: "purchase_order".into(),
                definition: po_lifecycle(),
            },
        )
        .await
        .unwrap();

    let err = h
        .engine
        .start_workflow(
            &admin,
            h.tenant_id,
            def.id,
            wf_engine::EntityRef::new("invoice", Uuid::new_v4()),
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DefinitionInvalid(_)));
}

#[tokio::test]
async fn test_malformed_definition_rejected_at_creation() {
    let h = harness();
    h.grant_admin();
    let admin = h.admin();

    // The initial state is not declared.
    let err = h
        .engine
        .create_lifecycle_definition(
            &admin,
            NewLifecycleDefinition {
                tenant_id: h.tenant_id,
                code: "broken".into(),
                entity_type: "purchase_order".into(),
                definition: json!({
                    "initial": "nowhere",
                    "states": [ { "name": "draft" } ],
                    "transitions": []
                }),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DefinitionInvalid(_)));
}

#[tokio::test]
async fn test_definition_delete_restricted_while_versions_exist() {
    let h = harness();
    h.grant_admin();
    let admin = h.admin();

    let def = h
        .engine
        .create_lifecycle_definition(
            &admin,
            NewLifecycleDefinition {
                tenant_id: h.tenant_id,
                code: "po-lifecycle".into(),
                entity_type: "purchase_order".into(),
                definition: po_lifecycle(),
            },
        )
        .await
        .unwrap();

    // No versions yet: deletable. Recreate, start a workflow, then deletion
    // is restricted by the version snapshot.
    h.engine
        .delete_lifecycle_definition(&admin, h.tenant_id, def.id)
        .await
        .unwrap();

    let def = h
        .engine
        .create_lifecycle_definition(
            &admin,
            NewLifecycleDefinition {
                tenant_id: h.tenant_id,
                code: "po-lifecycle".into(),
                entity_type: "purchase_order".into(),
                definition: po_lifecycle(),
            },
        )
        .await
        .unwrap();
    h.engine
        .start_workflow(&admin, h.tenant_id, def.id, purchase_order(), None, None)
        .await
        .unwrap();

    let err = h
        .engine
        .delete_lifecycle_definition(&admin, h.tenant_id, def.id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DefinitionInUse { .. }));
}

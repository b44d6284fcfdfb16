#![allow(dead_code)]

//! Shared fixtures for integration tests: an engine over the in-memory store
//! with a capability-seeded tenant and canned definitions.

use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use wf_engine::approval::StaticDirectoryResolver;
use wf_engine::authz::{ActorContext, CapabilityRow, ConstraintType};
use wf_engine::config::EngineConfig;
use wf_engine::engine::Engine;
use wf_engine::models::EntityRef;
use wf_engine::refdata::StaticCurrencyTable;
use wf_engine::scheduler::NullSubstrate;
use wf_engine::storage::MemoryStore;

pub struct Harness {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub resolver: Arc<StaticDirectoryResolver>,
    pub tenant_id: Uuid,
}

pub fn harness() -> Harness {
    harness_with_config(EngineConfig::default())
}

pub fn harness_with_config(config: EngineConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let resolver = Arc::new(StaticDirectoryResolver::new());
    let engine = Engine::new(
        store.clone(),
        Arc::new(NullSubstrate),
        resolver.clone(),
        Arc::new(StaticCurrencyTable::default()),
        config,
    );
    Harness {
        engine,
        store,
        resolver,
        tenant_id: Uuid::new_v4(),
    }
}

impl Harness {
    /// Grant one capability to a persona in the test tenant.
    pub fn grant(&self, persona: &str, operation: &str, constraint: ConstraintType) {
        self.store.seed_capabilities(vec![CapabilityRow {
            tenant_id: self.tenant_id,
            persona: persona.to_string(),
            operation: operation.to_string(),
            constraint_type: constraint,
        }]);
        self.engine.invalidate_capabilities(self.tenant_id);
    }

    /// Grant the `admin` persona every engine operation unconstrained.
    pub fn grant_admin(&self) {
        use wf_engine::constants::operations as ops;
        for operation in [
            ops::WORKFLOW_START,
            ops::WORKFLOW_TRANSITION,
            ops::WORKFLOW_OVERRIDE,
            ops::WORKFLOW_PAUSE,
            ops::WORKFLOW_RESUME,
            ops::WORKFLOW_CANCEL,
            ops::APPROVAL_REQUEST,
            ops::APPROVAL_DECIDE,
            ops::COMMENT_CREATE,
            ops::COMMENT_DELETE,
            ops::DEFINITION_MANAGE,
        ] {
            self.grant("admin", operation, ConstraintType::None);
        }
    }

    pub fn admin(&self) -> ActorContext {
        ActorContext::new(Uuid::new_v4(), vec!["admin".to_string()])
    }

    pub fn actor(&self, persona: &str) -> ActorContext {
        ActorContext::new(Uuid::new_v4(), vec![persona.to_string()])
    }
}

pub fn purchase_order() -> EntityRef {
    EntityRef::new("purchase_order", Uuid::new_v4())
}

/// draft -> submitted -> approved | rejected, no timers.
pub fn po_lifecycle() -> Value {
    json!({
        "initial": "draft",
        "states": [
            { "name": "draft" },
            { "name": "submitted" },
            { "name": "approved", "terminal": "completed" },
            { "name": "rejected", "terminal": "failed" }
        ],
        "transitions": [
            { "from": "draft", "to": "submitted" },
            { "from": "submitted", "to": "approved" },
            { "from": "submitted", "to": "rejected" }
        ]
    })
}

/// Same graph with timer policies: a reminder while drafting, and an
/// auto-approve deadline once submitted.
pub fn po_lifecycle_with_timers() -> Value {
    json!({
        "initial": "draft",
        "states": [
            { "name": "draft", "timers": [
                { "timer_type": "reminder", "after_seconds": 3600 }
            ]},
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
    })
}

/// Two serial single-approver stages.
pub fn two_stage_serial_rules(first: Uuid, second: Uuid) -> Value {
    json!({
        "stages": [
            {
                "name": "manager",
                "mode": "serial",
                "assignees": [ { "principal": first } ]
            },
            {
                "name": "finance",
                "mode": "serial",
                "assignees": [ { "principal": second } ]
            }
        ]
    })
}

/// One parallel stage over a group, resolved by n-of-m quorum.
pub fn parallel_quorum_rules(group_id: Uuid, n: u32) -> Value {
    json!({
        "stages": [
            {
                "name": "committee",
                "mode": "parallel",
                "assignees": [ { "group": group_id } ],
                "quorum": { "rule": "n_of_m", "n": n }
            }
        ]
    })
}

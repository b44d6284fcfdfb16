//! Guard checks consulted before a transition plan is built.
//!
//! Each guard is a small named check that either passes or returns the
//! specific error naming the violated rule.

use super::graph::LifecycleGraph;
use crate::error::{EngineError, Result};
use crate::models::WorkflowInstance;

/// Instance must be in `active` status to accept transitions. Terminal and
/// paused instances report their authoritative status back to the caller.
pub fn ensure_instance_active(instance: &WorkflowInstance) -> Result<()> {
    if instance.status.is_active() {
        Ok(())
    } else {
        Err(EngineError::InstanceNotActive {
            instance_id: instance.id,
            status: instance.status.to_string(),
        })
    }
}

/// The `(current_state -> to_state)` edge must exist in the bound version's
/// graph, unless the caller holds the override capability.
pub fn ensure_edge_defined(
    graph: &LifecycleGraph,
    from: &str,
    to: &str,
    override_allowed: bool,
) -> Result<()> {
    if override_allowed || graph.allows(from, to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// In strict mode, reject operations on instances whose bound version has
/// been superseded.
pub fn ensure_version_current(strict: bool, bound: i32, latest: i32) -> Result<()> {
    if strict && bound < latest {
        Err(EngineError::VersionMismatch { bound, latest })
    } else {
        Ok(())
    }
}

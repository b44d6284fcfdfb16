//! # Structured Error Handling
//!
//! Crate-wide error taxonomy for the workflow engine. Errors fall into four
//! groups: validation errors (request rejected, nothing mutated), state
//! errors (stale client view, current status reported back), concurrency
//! errors (retried internally, surfaced as [`EngineError::Conflict`] once the
//! retry budget is spent), and infrastructure errors (operation rolled back).

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    // Validation errors: rejected synchronously, no state mutated.
    #[error("invalid transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },

    #[error("lifecycle version {bound} superseded by version {latest}")]
    VersionMismatch { bound: i32, latest: i32 },

    #[error("quorum rule invalid: {0}")]
    QuorumRuleInvalid(String),

    #[error("definition invalid: {0}")]
    DefinitionInvalid(String),

    #[error("task {task_id} is not assigned to principal {principal_id}")]
    TaskNotAssignedToActor { task_id: Uuid, principal_id: Uuid },

    #[error("task {task_id} already resolved (status: {status})")]
    TaskAlreadyResolved { task_id: Uuid, status: String },

    #[error("group {group_id} could not be resolved to any principal")]
    AssignmentUnresolvable { group_id: Uuid },

    #[error("permission denied for operation '{operation}'")]
    PermissionDenied { operation: String },

    // State errors: the caller's view is stale; the authoritative status is
    // included so the caller can resynchronize.
    #[error("workflow instance {instance_id} is not active (status: {status})")]
    InstanceNotActive { instance_id: Uuid, status: String },

    #[error("approval stage {stage_id} is not active (status: {status})")]
    StageNotActive { stage_id: Uuid, status: String },

    #[error("approval instance {instance_id} is terminal (status: {status})")]
    InstanceTerminal { instance_id: Uuid, status: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("entity {entity_type}/{entity_id} already has a workflow instance")]
    DuplicateInstance { entity_type: String, entity_id: Uuid },

    #[error("definition {id} is referenced by versions and cannot be deleted")]
    DefinitionInUse { id: Uuid },

    // Concurrency errors.
    #[error("optimistic lock conflict on concurrent write")]
    StaleWrite,

    #[error("concurrent modification persisted after {retries} retries")]
    Conflict { retries: u32 },

    // Infrastructure errors: operation aborted and rolled back entirely.
    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl EngineError {
    /// True for errors the caller can fix by changing the request.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. }
                | Self::VersionMismatch { .. }
                | Self::QuorumRuleInvalid(_)
                | Self::DefinitionInvalid(_)
                | Self::TaskNotAssignedToActor { .. }
                | Self::TaskAlreadyResolved { .. }
                | Self::AssignmentUnresolvable { .. }
                | Self::PermissionDenied { .. }
        )
    }

    /// True for errors that are transient and safe to retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StaleWrite | Self::Conflict { .. })
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = EngineError::InvalidTransition {
            from: "draft".into(),
            to: "approved".into(),
        };
        assert!(err.is_validation());
        assert!(!err.is_retryable());

        assert!(EngineError::StaleWrite.is_retryable());
        assert!(EngineError::Conflict { retries: 3 }.is_retryable());
        assert!(!EngineError::Database("down".into()).is_retryable());
    }

    #[test]
    fn test_error_messages_name_the_rule() {
        let err = EngineError::InvalidTransition {
            from: "draft".into(),
            to: "closed".into(),
        };
        assert_eq!(err.to_string(), "invalid transition from 'draft' to 'closed'");
    }
}

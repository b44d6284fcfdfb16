//! # System Constants
//!
//! Event names and capability operation names shared across the engine.
//! Audit rows and published events use the dotted names below so that
//! downstream consumers (notifiers, reporting) can filter without parsing
//! payloads.

use uuid::Uuid;

/// Principal recorded on mutations performed by the engine itself
/// (timer fires, auto-transitions).
pub const SYSTEM_PRINCIPAL: Uuid = Uuid::nil();

/// Domain events emitted on the audit trail and the in-process publisher.
pub mod events {
    // Workflow lifecycle events
    pub const WORKFLOW_STARTED: &str = "workflow.started";
    pub const WORKFLOW_TRANSITIONED: &str = "workflow.transitioned";
    pub const WORKFLOW_PAUSED: &str = "workflow.paused";
    pub const WORKFLOW_RESUMED: &str = "workflow.resumed";
    pub const WORKFLOW_CANCELED: &str = "workflow.canceled";

    // Approval lifecycle events
    pub const APPROVAL_REQUESTED: &str = "approval.requested";
    pub const APPROVAL_STAGE_ACTIVATED: &str = "approval.stage_activated";
    pub const APPROVAL_STAGE_SKIPPED: &str = "approval.stage_skipped";
    pub const APPROVAL_STAGE_RESOLVED: &str = "approval.stage_resolved";
    pub const APPROVAL_TASK_DECIDED: &str = "approval.task_decided";
    pub const APPROVAL_TASK_ASSIGNED: &str = "approval.task_assigned";
    pub const APPROVAL_TASK_REASSIGNED: &str = "approval.task_reassigned";
    pub const APPROVAL_ESCALATED: &str = "approval.escalated";
    pub const APPROVAL_RESOLVED: &str = "approval.resolved";
    pub const APPROVAL_COMMENT_ADDED: &str = "approval.comment_added";
    pub const APPROVAL_COMMENT_DELETED: &str = "approval.comment_deleted";

    // Timer events
    pub const TIMER_SCHEDULED: &str = "timer.scheduled";
    pub const TIMER_FIRED: &str = "timer.fired";
    pub const TIMER_CANCELED: &str = "timer.canceled";
    pub const REMINDER_DUE: &str = "timer.reminder_due";
}

/// Capability operation names, matching the persona/capability policy table.
pub mod operations {
    pub const WORKFLOW_START: &str = "workflow.start";
    pub const WORKFLOW_TRANSITION: &str = "workflow.transition";
    pub const WORKFLOW_OVERRIDE: &str = "workflow.override";
    pub const WORKFLOW_PAUSE: &str = "workflow.pause";
    pub const WORKFLOW_RESUME: &str = "workflow.resume";
    pub const WORKFLOW_CANCEL: &str = "workflow.cancel";
    pub const APPROVAL_REQUEST: &str = "approval.request";
    pub const APPROVAL_DECIDE: &str = "approval.decide";
    pub const COMMENT_CREATE: &str = "comment.create";
    pub const COMMENT_DELETE: &str = "comment.delete";
    pub const DEFINITION_MANAGE: &str = "definition.manage";
}

// Approval orchestration module.
//
// Executes a versioned approval template as a runtime instance of ordered
// stages, each resolved serially or in parallel under a quorum rule, with
// configuration-driven escalation on SLA breach or manual hand-off.

pub mod assignment;
pub mod orchestrator;
pub mod quorum;
pub mod rules;
pub mod states;

pub use assignment::{AssigneeResolver, StaticDirectoryResolver};
pub use orchestrator::{ApprovalPlan, DecisionPlan, Orchestrator, SlaTimer, StageOutcome};
pub use quorum::{QuorumOutcome, QuorumRule, TaskTally};
pub use rules::{ApprovalRules, AssigneeRef, CondOp, EscalationPolicy, StageCondition, StageRule};
pub use states::{ApprovalStatus, Decision, StageMode, StageStatus, TaskStatus};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Approval instance status. `escalated` is not terminal: an operator (or
/// the configured escalation policy) still resolves the instance. `canceled`
/// marks approvals closed out when their governing workflow is canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Escalated,
    Canceled,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Canceled)
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
            Self::Escalated => write!(f, "escalated"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "escalated" => Ok(Self::Escalated),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("Invalid approval status: {s}")),
        }
    }
}

/// Stage status. One stage is `active` at a time per instance; stages whose
/// entry condition evaluates false against the entity snapshot are `skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Active,
    Completed,
    Skipped,
    Canceled,
}

impl StageStatus {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Canceled)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "skipped" => Ok(Self::Skipped),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("Invalid stage status: {s}")),
        }
    }
}

/// Task status. Open statuses (`pending`, `assigned`, `in_progress`) can
/// still receive a decision; everything else is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Approved,
    Rejected,
    Skipped,
    Escalated,
}

impl TaskStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Assigned | Self::InProgress)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Assigned => write!(f, "assigned"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
            Self::Skipped => write!(f, "skipped"),
            Self::Escalated => write!(f, "escalated"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "in_progress" => Ok(Self::InProgress),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "skipped" => Ok(Self::Skipped),
            "escalated" => Ok(Self::Escalated),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

/// An approver's decision on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
    Escalate,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approve => write!(f, "approve"),
            Self::Reject => write!(f, "reject"),
            Self::Escalate => write!(f, "escalate"),
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            "escalate" => Ok(Self::Escalate),
            _ => Err(format!("Invalid decision: {s}")),
        }
    }
}

/// Stage resolution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageMode {
    /// Tasks decide one at a time in `order_index` order; a single reject
    /// resolves the stage.
    Serial,
    /// All tasks are open at once; the quorum predicate resolves the stage.
    Parallel,
}

impl fmt::Display for StageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => write!(f, "serial"),
            Self::Parallel => write!(f, "parallel"),
        }
    }
}

impl std::str::FromStr for StageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "serial" => Ok(Self::Serial),
            "parallel" => Ok(Self::Parallel),
            _ => Err(format!("Invalid stage mode: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approval_status_terminal_check() {
        assert!(ApprovalStatus::Approved.is_terminal());
        assert!(ApprovalStatus::Rejected.is_terminal());
        assert!(ApprovalStatus::Canceled.is_terminal());
        assert!(!ApprovalStatus::Pending.is_terminal());
        assert!(!ApprovalStatus::Escalated.is_terminal());
    }

    #[test]
    fn test_task_open_check() {
        assert!(TaskStatus::Pending.is_open());
        assert!(TaskStatus::Assigned.is_open());
        assert!(TaskStatus::InProgress.is_open());
        assert!(!TaskStatus::Approved.is_open());
        assert!(!TaskStatus::Skipped.is_open());
        assert!(!TaskStatus::Escalated.is_open());
    }

    #[test]
    fn test_string_round_trips() {
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
        assert_eq!("escalated".parse::<TaskStatus>().unwrap(), TaskStatus::Escalated);
        assert_eq!(Decision::Approve.to_string(), "approve");
        assert_eq!("parallel".parse::<StageMode>().unwrap(), StageMode::Parallel);
        assert_eq!(
            serde_json::to_string(&StageStatus::Skipped).unwrap(),
            "\"skipped\""
        );
    }
}

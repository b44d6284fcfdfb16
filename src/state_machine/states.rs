use serde::{Deserialize, Serialize};
use std::fmt;

/// Workflow instance status. States themselves are defined per lifecycle;
/// this is the instance-level execution status surrounding them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Instance accepts transitions
    Active,
    /// Instance is suspended; transitions are rejected until resumed
    Paused,
    /// Instance reached a terminal state successfully
    Completed,
    /// Instance reached a terminal failure state
    Failed,
    /// Instance was canceled
    Canceled,
}

impl InstanceStatus {
    /// Check if this is a terminal status (no further transitions accepted)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Check if the instance currently accepts transitions
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("Invalid instance status: {s}")),
        }
    }
}

impl Default for InstanceStatus {
    fn default() -> Self {
        Self::Active
    }
}

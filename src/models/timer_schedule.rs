use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// TimerSchedule is a durable, cancelable future trigger.
/// Maps to `wf.lifecycle_timer_schedule`. The row, not any in-memory timer
/// wheel, is the source of truth for recovery. `policy_snapshot` is immutable:
/// policy changes never retroactively affect scheduled timers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerSchedule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub lifecycle_id: Option<Uuid>,
    /// State the timer was scheduled under, when lifecycle-bound.
    pub state: Option<String>,
    pub timer_type: TimerType,
    pub status: TimerStatus,
    pub fire_at: DateTime<Utc>,
    pub policy_snapshot: Value,
    /// Correlation handle into the underlying timer substrate.
    pub job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub fired_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
}

/// Timer trigger kinds recognized by the fire router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerType {
    AutoClose,
    AutoCancel,
    Reminder,
    AutoTransition,
}

impl TimerType {
    /// True when firing re-enters the state machine core.
    pub fn is_transition(&self) -> bool {
        matches!(self, Self::AutoClose | Self::AutoCancel | Self::AutoTransition)
    }
}

impl fmt::Display for TimerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AutoClose => write!(f, "auto_close"),
            Self::AutoCancel => write!(f, "auto_cancel"),
            Self::Reminder => write!(f, "reminder"),
            Self::AutoTransition => write!(f, "auto_transition"),
        }
    }
}

impl std::str::FromStr for TimerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto_close" => Ok(Self::AutoClose),
            "auto_cancel" => Ok(Self::AutoCancel),
            "reminder" => Ok(Self::Reminder),
            "auto_transition" => Ok(Self::AutoTransition),
            _ => Err(format!("Invalid timer type: {s}")),
        }
    }
}

/// Timer lifecycle: `scheduled → fired` exactly once, or
/// `scheduled → canceled`. Both flips are atomic compare-and-swap;
/// the loser of a fire/cancel race is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    Scheduled,
    Fired,
    Canceled,
}

impl fmt::Display for TimerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Fired => write!(f, "fired"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for TimerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "fired" => Ok(Self::Fired),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("Invalid timer status: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_type_routing() {
        assert!(TimerType::AutoClose.is_transition());
        assert!(TimerType::AutoCancel.is_transition());
        assert!(TimerType::AutoTransition.is_transition());
        assert!(!TimerType::Reminder.is_transition());
    }

    #[test]
    fn test_timer_string_conversion() {
        assert_eq!(TimerType::AutoTransition.to_string(), "auto_transition");
        assert_eq!("reminder".parse::<TimerType>().unwrap(), TimerType::Reminder);
        assert_eq!(TimerStatus::Scheduled.to_string(), "scheduled");
        assert_eq!("fired".parse::<TimerStatus>().unwrap(), TimerStatus::Fired);
        assert!("sometime".parse::<TimerType>().is_err());
    }
}

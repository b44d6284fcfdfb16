//! Typed lifecycle definition graph.
//!
//! The persisted `definition` payload is a JSON blob; it is parsed here once
//! at definition-load time into a typed state/transition graph so operations
//! never re-interpret raw JSON. Expected shape:
//!
//! ```json
//! {
//!   "initial": "draft",
//!   "states": [
//!     { "name": "draft" },
//!     { "name": "submitted",
//!       "timers": [ { "timer_type": "auto_transition",
//!                     "after_seconds": 86400,
//!                     "to_state": "approved" } ] },
//!     { "name": "approved", "terminal": "completed" },
//!     { "name": "rejected", "terminal": "failed" }
//!   ],
//!   "transitions": [
//!     { "from": "draft", "to": "submitted" },
//!     { "from": "submitted", "to": "approved" },
//!     { "from": "submitted", "to": "rejected" }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use super::states::InstanceStatus;
use crate::error::{EngineError, Result};
use crate::models::TimerType;

/// Timer policy attached to a state: entering the state schedules the timer,
/// leaving it cancels all pending timers for the entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerPolicy {
    pub timer_type: TimerType,
    pub after_seconds: i64,
    /// Target state for `auto_*` timers; ignored for reminders.
    #[serde(default)]
    pub to_state: Option<String>,
}

/// One named state in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateNode {
    pub name: String,
    /// Instance status to set when entering this state, if terminal.
    #[serde(default)]
    pub terminal: Option<InstanceStatus>,
    #[serde(default)]
    pub timers: Vec<TimerPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawEdge {
    from: String,
    to: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawGraph {
    initial: String,
    states: Vec<StateNode>,
    #[serde(default)]
    transitions: Vec<RawEdge>,
}

/// Parsed, validated lifecycle graph bound to one lifecycle version.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleGraph {
    initial: String,
    states: HashMap<String, StateNode>,
    edges: HashSet<(String, String)>,
}

impl LifecycleGraph {
    /// Parse and validate a raw `definition` payload. All structural errors
    /// surface here, never mid-operation.
    pub fn parse(definition: &Value) -> Result<Self> {
        let raw: RawGraph = serde_json::from_value(definition.clone())
            .map_err(|e| EngineError::DefinitionInvalid(e.to_string()))?;

        if raw.states.is_empty() {
            return Err(EngineError::DefinitionInvalid(
                "definition declares no states".into(),
            ));
        }

        let mut states = HashMap::with_capacity(raw.states.len());
        for node in raw.states {
            if let Some(status) = node.terminal {
                if !status.is_terminal() {
                    return Err(EngineError::DefinitionInvalid(format!(
                        "state '{}' maps to non-terminal status '{status}'",
                        node.name
                    )));
                }
            }
            if states.insert(node.name.clone(), node).is_some() {
                return Err(EngineError::DefinitionInvalid("duplicate state name".into()));
            }
        }

        if !states.contains_key(&raw.initial) {
            return Err(EngineError::DefinitionInvalid(format!(
                "initial state '{}' is not declared",
                raw.initial
            )));
        }

        let mut edges = HashSet::with_capacity(raw.transitions.len());
        for edge in raw.transitions {
            if !states.contains_key(&edge.from) || !states.contains_key(&edge.to) {
                return Err(EngineError::DefinitionInvalid(format!(
                    "transition '{}' -> '{}' references an undeclared state",
                    edge.from, edge.to
                )));
            }
            edges.insert((edge.from, edge.to));
        }

        // Auto-transition timers must point at a defined edge so a timer fire
        // can never perform a transition a caller could not.
        for node in states.values() {
            for policy in &node.timers {
                if policy.timer_type.is_transition() {
                    let target = policy.to_state.as_deref().ok_or_else(|| {
                        EngineError::DefinitionInvalid(format!(
                            "timer '{}' on state '{}' has no to_state",
                            policy.timer_type, node.name
                        ))
                    })?;
                    if !edges.contains(&(node.name.clone(), target.to_string())) {
                        return Err(EngineError::DefinitionInvalid(format!(
                            "timer on state '{}' targets undefined edge to '{target}'",
                            node.name
                        )));
                    }
                }
                if policy.after_seconds <= 0 {
                    return Err(EngineError::DefinitionInvalid(format!(
                        "timer on state '{}' has non-positive after_seconds",
                        node.name
                    )));
                }
            }
        }

        Ok(Self {
            initial: raw.initial,
            states,
            edges,
        })
    }

    pub fn initial(&self) -> &str {
        &self.initial
    }

    pub fn state(&self, name: &str) -> Option<&StateNode> {
        self.states.get(name)
    }

    /// Check whether the edge `from -> to` is defined.
    pub fn allows(&self, from: &str, to: &str) -> bool {
        self.edges.contains(&(from.to_string(), to.to_string()))
    }

    /// Instance status implied by entering `state`: terminal mapping if
    /// declared, otherwise the instance stays active.
    pub fn status_on_entry(&self, state: &str) -> InstanceStatus {
        self.states
            .get(state)
            .and_then(|node| node.terminal)
            .unwrap_or(InstanceStatus::Active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_definition() -> Value {
        json!({
            "initial": "draft",
            "states": [
                { "name": "draft" },
                { "name": "submitted", "timers": [
                    { "timer_type": "auto_transition", "after_seconds": 86400, "to_state": "approved" },
                    { "timer_type": "reminder", "after_seconds": 3600 }
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

    #[test]
    fn test_parse_valid_definition() {
        let graph = LifecycleGraph::parse(&sample_definition()).unwrap();
        assert_eq!(graph.initial(), "draft");
        assert!(graph.allows("draft", "submitted"));
        assert!(!graph.allows("draft", "approved"));
        assert_eq!(graph.status_on_entry("approved"), InstanceStatus::Completed);
        assert_eq!(graph.status_on_entry("draft"), InstanceStatus::Active);
        assert_eq!(graph.state("submitted").unwrap().timers.len(), 2);
    }

    #[test]
    fn test_rejects_undeclared_initial() {
        let def = json!({
            "initial": "nowhere",
            "states": [{ "name": "draft" }],
            "transitions": []
        });
        assert!(matches!(
            LifecycleGraph::parse(&def),
            Err(EngineError::DefinitionInvalid(_))
        ));
    }

    #[test]
    fn test_rejects_edge_to_unknown_state() {
        let def = json!({
            "initial": "draft",
            "states": [{ "name": "draft" }],
            "transitions": [{ "from": "draft", "to": "ghost" }]
        });
        assert!(matches!(
            LifecycleGraph::parse(&def),
            Err(EngineError::DefinitionInvalid(_))
        ));
    }

    #[test]
    fn test_rejects_auto_timer_without_edge() {
        let def = json!({
            "initial": "a",
            "states": [
                { "name": "a", "timers": [
                    { "timer_type": "auto_close", "after_seconds": 60, "to_state": "b" }
                ]},
                { "name": "b", "terminal": "completed" }
            ],
            "transitions": []
        });
        assert!(matches!(
            LifecycleGraph::parse(&def),
            Err(EngineError::DefinitionInvalid(_))
        ));
    }

    #[test]
    fn test_rejects_non_terminal_status_mapping() {
        let def = json!({
            "initial": "a",
            "states": [{ "name": "a", "terminal": "paused" }],
            "transitions": []
        });
        assert!(matches!(
            LifecycleGraph::parse(&def),
            Err(EngineError::DefinitionInvalid(_))
        ));
    }
}

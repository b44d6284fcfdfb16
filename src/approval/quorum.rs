//! Quorum predicates.
//!
//! The persisted `quorum` JSON is parsed once into [`QuorumRule`] and
//! evaluated as a pure function over a tally of task outcomes, so resolution
//! is deterministic regardless of decision arrival order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// Quorum rule variants. Wire forms:
/// `{"rule": "all"}`, `{"rule": "any"}`, `{"rule": "n_of_m", "n": 2}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum QuorumRule {
    /// Every task must approve; one reject resolves the stage rejected.
    All,
    /// One approve resolves the stage approved.
    Any,
    /// At least `n` approvals; rejected as soon as `n` approvals become
    /// unreachable.
    NOfM { n: u32 },
}

impl Default for QuorumRule {
    fn default() -> Self {
        Self::All
    }
}

impl QuorumRule {
    /// Parse and validate a raw quorum payload.
    pub fn parse(raw: &Value) -> Result<Self> {
        let rule: QuorumRule = serde_json::from_value(raw.clone())
            .map_err(|e| EngineError::QuorumRuleInvalid(e.to_string()))?;
        if let QuorumRule::NOfM { n: 0 } = rule {
            return Err(EngineError::QuorumRuleInvalid(
                "n_of_m quorum requires n >= 1".into(),
            ));
        }
        Ok(rule)
    }

    /// Evaluate the predicate over the current tally. Escalated tasks count
    /// toward neither side: they are simply absent from `answerable`.
    pub fn evaluate(&self, tally: &TaskTally) -> QuorumOutcome {
        match *self {
            QuorumRule::All => {
                if tally.rejected > 0 {
                    QuorumOutcome::Rejected
                } else if tally.answerable == 0 {
                    QuorumOutcome::Approved
                } else {
                    QuorumOutcome::Pending
                }
            }
            QuorumRule::Any => {
                if tally.approved > 0 {
                    QuorumOutcome::Approved
                } else if tally.answerable == 0 {
                    QuorumOutcome::Rejected
                } else {
                    QuorumOutcome::Pending
                }
            }
            QuorumRule::NOfM { n } => {
                if tally.approved >= n {
                    QuorumOutcome::Approved
                } else if tally.approved + tally.answerable < n {
                    QuorumOutcome::Rejected
                } else {
                    QuorumOutcome::Pending
                }
            }
        }
    }
}

/// Counts of task outcomes within one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskTally {
    pub approved: u32,
    pub rejected: u32,
    /// Open tasks that can still deliver a decision.
    pub answerable: u32,
}

/// Stage-level outcome of a quorum evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumOutcome {
    Approved,
    Rejected,
    Pending,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tally(approved: u32, rejected: u32, answerable: u32) -> TaskTally {
        TaskTally {
            approved,
            rejected,
            answerable,
        }
    }

    #[test]
    fn test_parse_variants() {
        assert_eq!(QuorumRule::parse(&json!({"rule": "all"})).unwrap(), QuorumRule::All);
        assert_eq!(QuorumRule::parse(&json!({"rule": "any"})).unwrap(), QuorumRule::Any);
        assert_eq!(
            QuorumRule::parse(&json!({"rule": "n_of_m", "n": 2})).unwrap(),
            QuorumRule::NOfM { n: 2 }
        );
    }

    #[test]
    fn test_parse_rejects_malformed_rules() {
        assert!(matches!(
            QuorumRule::parse(&json!({"rule": "most"})),
            Err(EngineError::QuorumRuleInvalid(_))
        ));
        assert!(matches!(
            QuorumRule::parse(&json!({"rule": "n_of_m", "n": 0})),
            Err(EngineError::QuorumRuleInvalid(_))
        ));
        assert!(matches!(
            QuorumRule::parse(&json!("all")),
            Err(EngineError::QuorumRuleInvalid(_))
        ));
    }

    #[test]
    fn test_all_rule() {
        let rule = QuorumRule::All;
        assert_eq!(rule.evaluate(&tally(0, 0, 3)), QuorumOutcome::Pending);
        assert_eq!(rule.evaluate(&tally(2, 0, 1)), QuorumOutcome::Pending);
        assert_eq!(rule.evaluate(&tally(3, 0, 0)), QuorumOutcome::Approved);
        assert_eq!(rule.evaluate(&tally(1, 1, 1)), QuorumOutcome::Rejected);
    }

    #[test]
    fn test_any_rule() {
        let rule = QuorumRule::Any;
        assert_eq!(rule.evaluate(&tally(0, 1, 2)), QuorumOutcome::Pending);
        assert_eq!(rule.evaluate(&tally(1, 1, 1)), QuorumOutcome::Approved);
        assert_eq!(rule.evaluate(&tally(0, 3, 0)), QuorumOutcome::Rejected);
    }

    #[test]
    fn test_n_of_m_rule() {
        let rule = QuorumRule::NOfM { n: 2 };
        // 2 of 3: approve, reject, approve -> approved at second approve
        assert_eq!(rule.evaluate(&tally(1, 1, 1)), QuorumOutcome::Pending);
        assert_eq!(rule.evaluate(&tally(2, 1, 0)), QuorumOutcome::Approved);
        // Enough rejects to make quorum unreachable resolves rejected
        assert_eq!(rule.evaluate(&tally(0, 2, 1)), QuorumOutcome::Rejected);
        assert_eq!(rule.evaluate(&tally(1, 2, 0)), QuorumOutcome::Rejected);
    }

    #[test]
    fn test_escalated_tasks_count_toward_neither_side() {
        // 3 tasks, one escalated (absent from the tally entirely):
        // 2-of-3 can still approve with the remaining two...
        let rule = QuorumRule::NOfM { n: 2 };
        assert_eq!(rule.evaluate(&tally(1, 0, 1)), QuorumOutcome::Pending);
        // ...but becomes unreachable once another task rejects.
        assert_eq!(rule.evaluate(&tally(1, 1, 0)), QuorumOutcome::Rejected);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    // Replay a sequence of decisions task-by-task and return the outcome at
    // the first moment the rule resolves, plus the outcome over the full
    // final tally. Deterministic quorum resolution means early resolution
    // never disagrees with the final tally's resolution.
    fn resolve_sequence(rule: QuorumRule, decisions: &[bool], total: u32) -> (QuorumOutcome, QuorumOutcome) {
        let mut approved = 0u32;
        let mut rejected = 0u32;
        let mut early = QuorumOutcome::Pending;
        for &approve in decisions {
            if approve {
                approved += 1;
            } else {
                rejected += 1;
            }
            let t = TaskTally {
                approved,
                rejected,
                answerable: total - approved - rejected,
            };
            if early == QuorumOutcome::Pending {
                early = rule.evaluate(&t);
            }
        }
        let final_tally = TaskTally {
            approved,
            rejected,
            answerable: total - approved - rejected,
        };
        (early, rule.evaluate(&final_tally))
    }

    proptest! {
        #[test]
        fn n_of_m_resolution_is_order_independent(
            mut decisions in proptest::collection::vec(any::<bool>(), 1..8),
            n in 1u32..5,
        ) {
            let total = decisions.len() as u32;
            let rule = QuorumRule::NOfM { n };
            let (early_a, _) = resolve_sequence(rule, &decisions, total);
            decisions.reverse();
            let (early_b, _) = resolve_sequence(rule, &decisions, total);
            // Once every decision is in, both orderings resolved the same way.
            if early_a != QuorumOutcome::Pending && early_b != QuorumOutcome::Pending {
                prop_assert_eq!(early_a, early_b);
            }
        }

        #[test]
        fn early_resolution_matches_final_tally(
            decisions in proptest::collection::vec(any::<bool>(), 1..8),
            n in 1u32..5,
        ) {
            let total = decisions.len() as u32;
            let rule = QuorumRule::NOfM { n };
            let (early, final_outcome) = resolve_sequence(rule, &decisions, total);
            if early != QuorumOutcome::Pending {
                prop_assert_eq!(early, final_outcome);
            }
        }
    }
}

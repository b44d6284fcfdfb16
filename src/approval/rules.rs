//! Typed approval rule templates.
//!
//! The persisted `rules` payload is parsed once at definition-load time.
//! Expected shape:
//!
//! ```json
//! {
//!   "stages": [
//!     { "name": "manager",
//!       "mode": "serial",
//!       "assignees": [ { "principal": "..." }, { "group": "..." } ],
//!       "quorum": { "rule": "all" },
//!       "sla_seconds": 86400,
//!       "escalation": "auto_reject",
//!       "escalate_to": [ { "principal": "..." } ],
//!       "condition": { "field": "amount", "op": "gte", "value": 1000,
//!                      "currency_field": "currency" } }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use super::quorum::QuorumRule;
use super::states::StageMode;
use crate::error::{EngineError, Result};
use crate::refdata::CurrencyLookup;

/// Reference to a stage assignee: a concrete principal or a group that is
/// resolved to principals at activation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssigneeRef {
    #[serde(rename = "principal")]
    Principal(Uuid),
    #[serde(rename = "group")]
    Group(Uuid),
}

/// What happens to an escalated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationPolicy {
    /// Create replacement tasks for the stage's `escalate_to` assignees.
    Reassign,
    /// Resolve the stage approved on behalf of the escalated task.
    AutoApprove,
    /// Resolve the stage rejected.
    AutoReject,
    /// Leave the stage waiting; mark the approval instance `escalated`
    /// until an operator acts.
    Hold,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self::Hold
    }
}

impl fmt::Display for EscalationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reassign => write!(f, "reassign"),
            Self::AutoApprove => write!(f, "auto_approve"),
            Self::AutoReject => write!(f, "auto_reject"),
            Self::Hold => write!(f, "hold"),
        }
    }
}

impl std::str::FromStr for EscalationPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "reassign" => Ok(Self::Reassign),
            "auto_approve" => Ok(Self::AutoApprove),
            "auto_reject" => Ok(Self::AutoReject),
            "hold" => Ok(Self::Hold),
            _ => Err(format!("Invalid escalation policy: {s}")),
        }
    }
}

/// Comparison operators for stage entry conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CondOp {
    Gte,
    Lte,
    Eq,
}

/// Entry condition evaluated against the entity snapshot when the approval
/// is requested. A false condition marks the stage `skipped`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCondition {
    pub field: String,
    pub op: CondOp,
    pub value: Value,
    /// Snapshot field naming the currency of `field`; when present, numeric
    /// comparison happens at the currency's minor-unit precision.
    #[serde(default)]
    pub currency_field: Option<String>,
}

impl StageCondition {
    pub fn evaluate(&self, snapshot: &Value, currencies: &dyn CurrencyLookup) -> Result<bool> {
        let Some(actual) = snapshot.get(&self.field) else {
            return Ok(false);
        };

        match (actual, &self.value) {
            (Value::Number(a), Value::Number(e)) => {
                let (mut a, mut e) = (
                    a.as_f64().unwrap_or(f64::NAN),
                    e.as_f64().unwrap_or(f64::NAN),
                );
                if let Some(currency_field) = &self.currency_field {
                    let code = snapshot
                        .get(currency_field)
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            EngineError::DefinitionInvalid(format!(
                                "condition currency field '{currency_field}' missing from snapshot"
                            ))
                        })?;
                    let scale = 10f64.powi(currencies.minor_units(code)? as i32);
                    a = (a * scale).round();
                    e = (e * scale).round();
                }
                Ok(match self.op {
                    CondOp::Gte => a >= e,
                    CondOp::Lte => a <= e,
                    CondOp::Eq => (a - e).abs() < f64::EPSILON,
                })
            }
            (a, e) => Ok(match self.op {
                CondOp::Eq => a == e,
                // Ordering comparisons only make sense for numbers
                _ => false,
            }),
        }
    }
}

/// One stage template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRule {
    pub name: String,
    pub mode: StageMode,
    pub assignees: Vec<AssigneeRef>,
    #[serde(default)]
    pub quorum: QuorumRule,
    #[serde(default)]
    pub sla_seconds: Option<i64>,
    #[serde(default)]
    pub escalation: Option<EscalationPolicy>,
    #[serde(default)]
    pub escalate_to: Vec<AssigneeRef>,
    #[serde(default)]
    pub condition: Option<StageCondition>,
}

/// Parsed, validated approval template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRules {
    pub stages: Vec<StageRule>,
}

impl ApprovalRules {
    /// Parse and validate a raw `rules` payload.
    pub fn parse(raw: &Value) -> Result<Self> {
        let rules: ApprovalRules = serde_json::from_value(raw.clone())
            .map_err(|e| EngineError::DefinitionInvalid(e.to_string()))?;

        if rules.stages.is_empty() {
            return Err(EngineError::DefinitionInvalid(
                "approval rules declare no stages".into(),
            ));
        }
        for stage in &rules.stages {
            if stage.assignees.is_empty() {
                return Err(EngineError::DefinitionInvalid(format!(
                    "stage '{}' declares no assignees",
                    stage.name
                )));
            }
            if stage.escalation == Some(EscalationPolicy::Reassign) && stage.escalate_to.is_empty()
            {
                return Err(EngineError::DefinitionInvalid(format!(
                    "stage '{}' uses reassign escalation without escalate_to assignees",
                    stage.name
                )));
            }
            if let QuorumRule::NOfM { n: 0 } = stage.quorum {
                return Err(EngineError::QuorumRuleInvalid(
                    "n_of_m quorum requires n >= 1".into(),
                ));
            }
        }
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refdata::StaticCurrencyTable;
    use serde_json::json;

    #[test]
    fn test_parse_two_stage_rules() {
        let raw = json!({
            "stages": [
                {
                    "name": "manager",
                    "mode": "serial",
                    "assignees": [ { "principal": Uuid::new_v4() } ],
                    "sla_seconds": 86400
                },
                {
                    "name": "finance",
                    "mode": "parallel",
                    "assignees": [ { "group": Uuid::new_v4() } ],
                    "quorum": { "rule": "n_of_m", "n": 2 },
                    "escalation": "auto_reject"
                }
            ]
        });

        let rules = ApprovalRules::parse(&raw).unwrap();
        assert_eq!(rules.stages.len(), 2);
        assert_eq!(rules.stages[0].quorum, QuorumRule::All); // default
        assert_eq!(rules.stages[1].quorum, QuorumRule::NOfM { n: 2 });
        assert_eq!(rules.stages[1].escalation, Some(EscalationPolicy::AutoReject));
    }

    #[test]
    fn test_parse_rejects_empty_assignees() {
        let raw = json!({
            "stages": [{ "name": "x", "mode": "serial", "assignees": [] }]
        });
        assert!(matches!(
            ApprovalRules::parse(&raw),
            Err(EngineError::DefinitionInvalid(_))
        ));
    }

    #[test]
    fn test_parse_rejects_reassign_without_fallback() {
        let raw = json!({
            "stages": [{
                "name": "x",
                "mode": "serial",
                "assignees": [ { "principal": Uuid::new_v4() } ],
                "escalation": "reassign"
            }]
        });
        assert!(matches!(
            ApprovalRules::parse(&raw),
            Err(EngineError::DefinitionInvalid(_))
        ));
    }

    #[test]
    fn test_amount_condition_with_currency_precision() {
        let cond = StageCondition {
            field: "amount".into(),
            op: CondOp::Gte,
            value: json!(1000),
            currency_field: Some("currency".into()),
        };
        let currencies = StaticCurrencyTable::default();

        let snapshot = json!({ "amount": 1000.004, "currency": "USD" });
        // 1000.004 USD rounds to 100000 cents, threshold is 100000 cents
        assert!(cond.evaluate(&snapshot, &currencies).unwrap());

        let snapshot = json!({ "amount": 999.99, "currency": "USD" });
        assert!(!cond.evaluate(&snapshot, &currencies).unwrap());

        let snapshot = json!({ "amount": 999.6, "currency": "JPY" });
        // JPY has no minor units; 999.6 rounds to 1000
        assert!(cond.evaluate(&snapshot, &currencies).unwrap());
    }

    #[test]
    fn test_string_equality_condition() {
        let cond = StageCondition {
            field: "category".into(),
            op: CondOp::Eq,
            value: json!("capex"),
            currency_field: None,
        };
        let currencies = StaticCurrencyTable::default();
        assert!(cond
            .evaluate(&json!({ "category": "capex" }), &currencies)
            .unwrap());
        assert!(!cond
            .evaluate(&json!({ "category": "opex" }), &currencies)
            .unwrap());
        // Missing field evaluates false, never errors
        assert!(!cond.evaluate(&json!({}), &currencies).unwrap());
    }
}

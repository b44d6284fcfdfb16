//! # Persona/Capability Authorization Index
//!
//! The persona/capability matrix is static policy configuration: it is
//! loaded once per tenant into an in-memory index and refreshed on
//! invalidation, rather than queried per operation. Capability rows grant an
//! operation to a persona under a constraint scope:
//!
//! - `none`: unconstrained (also how delegation is granted)
//! - `own`: only records the actor owns (assignee, author, requester)
//! - `ou`: only records in the actor's organizational unit
//! - `module`: only records inside a module boundary the actor holds

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::storage::Store;

/// Authenticated caller identity, as supplied by the external IdP. The
/// engine trusts the identity and only checks authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorContext {
    pub principal_id: Uuid,
    pub personas: Vec<String>,
    pub org_unit_id: Option<Uuid>,
    pub modules: Vec<String>,
}

impl ActorContext {
    pub fn new(principal_id: Uuid, personas: Vec<String>) -> Self {
        Self {
            principal_id,
            personas,
            org_unit_id: None,
            modules: Vec::new(),
        }
    }
}

/// Constraint scope attached to a capability grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintType {
    None,
    Own,
    Ou,
    Module,
}

impl ConstraintType {
    /// Broader constraints win when an actor holds several grants for the
    /// same operation.
    fn breadth(self) -> u8 {
        match self {
            Self::None => 3,
            Self::Module => 2,
            Self::Ou => 1,
            Self::Own => 0,
        }
    }
}

impl fmt::Display for ConstraintType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Own => write!(f, "own"),
            Self::Ou => write!(f, "ou"),
            Self::Module => write!(f, "module"),
        }
    }
}

impl std::str::FromStr for ConstraintType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "own" => Ok(Self::Own),
            "ou" => Ok(Self::Ou),
            "module" => Ok(Self::Module),
            _ => Err(format!("Invalid constraint type: {s}")),
        }
    }
}

/// One row of the persona/capability policy table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRow {
    pub tenant_id: Uuid,
    pub persona: String,
    pub operation: String,
    pub constraint_type: ConstraintType,
}

/// Scope attributes of the record an operation targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeRef<'a> {
    pub owner: Option<Uuid>,
    pub org_unit_id: Option<Uuid>,
    pub module_code: Option<&'a str>,
}

struct TenantIndex {
    /// (persona, operation) -> broadest granted constraint
    grants: HashMap<(String, String), ConstraintType>,
}

impl TenantIndex {
    fn build(rows: Vec<CapabilityRow>) -> Self {
        let mut grants: HashMap<(String, String), ConstraintType> = HashMap::new();
        for row in rows {
            grants
                .entry((row.persona, row.operation))
                .and_modify(|existing| {
                    if row.constraint_type.breadth() > existing.breadth() {
                        *existing = row.constraint_type;
                    }
                })
                .or_insert(row.constraint_type);
        }
        Self { grants }
    }
}

/// Per-tenant capability cache.
#[derive(Default)]
pub struct CapabilityIndex {
    tenants: DashMap<Uuid, Arc<TenantIndex>>,
}

impl CapabilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a tenant's cached index; the next check reloads it. Called on
    /// change notification from the policy store.
    pub fn invalidate(&self, tenant_id: Uuid) {
        self.tenants.remove(&tenant_id);
    }

    /// Check that the actor may perform `operation` on a record with the
    /// given scope. Returns the matched constraint so callers can tell a
    /// delegated (`none`) grant from an ownership-scoped one.
    pub async fn authorize(
        &self,
        store: &dyn Store,
        tenant_id: Uuid,
        ctx: &ActorContext,
        operation: &str,
        scope: ScopeRef<'_>,
    ) -> Result<ConstraintType> {
        let index = match self.tenants.get(&tenant_id) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                let rows = store.capabilities_for_tenant(tenant_id).await?;
                let index = Arc::new(TenantIndex::build(rows));
                self.tenants.insert(tenant_id, Arc::clone(&index));
                index
            }
        };

        let mut best: Option<ConstraintType> = None;
        for persona in &ctx.personas {
            if let Some(&constraint) = index
                .grants
                .get(&(persona.clone(), operation.to_string()))
            {
                if constraint_satisfied(constraint, ctx, &scope)
                    && best.map_or(true, |b| constraint.breadth() > b.breadth())
                {
                    best = Some(constraint);
                }
            }
        }

        best.ok_or_else(|| EngineError::PermissionDenied {
            operation: operation.to_string(),
        })
    }
}

fn constraint_satisfied(constraint: ConstraintType, ctx: &ActorContext, scope: &ScopeRef<'_>) -> bool {
    match constraint {
        ConstraintType::None => true,
        ConstraintType::Own => scope.owner == Some(ctx.principal_id),
        ConstraintType::Ou => {
            ctx.org_unit_id.is_some() && ctx.org_unit_id == scope.org_unit_id
        }
        ConstraintType::Module => scope
            .module_code
            .is_some_and(|m| ctx.modules.iter().any(|held| held == m)),
    }
}

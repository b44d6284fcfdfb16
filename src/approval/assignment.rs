//! Assignee resolution.
//!
//! The schema records the *result* of group resolution (the assignment
//! snapshot) but not the *policy*; resolution is therefore a pluggable
//! collaborator. The default resolver expands the full group membership so
//! every member receives a task; hosts wanting round-robin or manager-lookup
//! strategies supply their own implementation.

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use super::rules::AssigneeRef;
use crate::error::{EngineError, Result};

/// Resolves an assignee reference to concrete principals.
#[async_trait]
pub trait AssigneeResolver: Send + Sync {
    async fn resolve(&self, tenant_id: Uuid, assignee: &AssigneeRef) -> Result<Vec<Uuid>>;
}

/// Directory-backed resolver over a static group membership table.
#[derive(Default)]
pub struct StaticDirectoryResolver {
    /// (tenant, group) -> members
    groups: DashMap<(Uuid, Uuid), Vec<Uuid>>,
}

impl StaticDirectoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_group(&self, tenant_id: Uuid, group_id: Uuid, members: Vec<Uuid>) {
        self.groups.insert((tenant_id, group_id), members);
    }
}

#[async_trait]
impl AssigneeResolver for StaticDirectoryResolver {
    async fn resolve(&self, tenant_id: Uuid, assignee: &AssigneeRef) -> Result<Vec<Uuid>> {
        match assignee {
            AssigneeRef::Principal(principal_id) => Ok(vec![*principal_id]),
            AssigneeRef::Group(group_id) => {
                let members = self
                    .groups
                    .get(&(tenant_id, *group_id))
                    .map(|entry| entry.value().clone())
                    .unwrap_or_default();
                if members.is_empty() {
                    return Err(EngineError::AssignmentUnresolvable { group_id: *group_id });
                }
                Ok(members)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_principal_resolves_to_itself() {
        let resolver = StaticDirectoryResolver::new();
        let principal = Uuid::new_v4();
        let resolved = resolver
            .resolve(Uuid::new_v4(), &AssigneeRef::Principal(principal))
            .await
            .unwrap();
        assert_eq!(resolved, vec![principal]);
    }

    #[tokio::test]
    async fn test_group_expands_to_members() {
        let resolver = StaticDirectoryResolver::new();
        let tenant = Uuid::new_v4();
        let group = Uuid::new_v4();
        let members = vec![Uuid::new_v4(), Uuid::new_v4()];
        resolver.insert_group(tenant, group, members.clone());

        let resolved = resolver
            .resolve(tenant, &AssigneeRef::Group(group))
            .await
            .unwrap();
        assert_eq!(resolved, members);
    }

    #[tokio::test]
    async fn test_unknown_group_is_unresolvable() {
        let resolver = StaticDirectoryResolver::new();
        let err = resolver
            .resolve(Uuid::new_v4(), &AssigneeRef::Group(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AssignmentUnresolvable { .. }));
    }
}

//! Roles and hierarchical permission inheritance.
//!
//! A role may name a parent role. Its effective permissions are its own
//! assignments plus those of every ancestor. The parent links form their own
//! edge set, separate from permission dependencies, and must stay acyclic.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::graph::{DependencyService, GraphError};
use crate::permission::{Permission, PermissionId};
use crate::store::{EdgeStore, PermissionStore, RoleStore, StoreError};

/// Role identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleId(pub u64);

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A role with its direct permission assignments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Identifier.
    pub id: RoleId,
    /// Unique name.
    pub name: String,
    /// Role this one inherits from.
    pub parent: Option<RoleId>,
    /// Permissions assigned directly (not inherited).
    pub permissions: BTreeSet<PermissionId>,
}

/// Errors from role operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RoleError {
    /// No role with this id.
    #[error("role not found: {id}")]
    NotFound {
        /// The missing role.
        id: RoleId,
    },

    /// The role name is taken.
    #[error("role name already exists: {name}")]
    DuplicateName {
        /// The requested name.
        name: String,
    },

    /// A role cannot be its own parent.
    #[error("role {role} cannot inherit from itself")]
    SelfParent {
        /// The role.
        role: RoleId,
    },

    /// The new parent already inherits from the role.
    #[error("role {role} cannot inherit from {parent}: {parent} already inherits from {role}")]
    HierarchyCycle {
        /// The role being re-parented.
        role: RoleId,
        /// The rejected parent.
        parent: RoleId,
        /// Existing chain `parent -> ... -> role`.
        path: Vec<RoleId>,
    },

    /// The permission does not exist or was deleted.
    #[error("permission not found: {id}")]
    PermissionNotFound {
        /// The missing permission.
        id: PermissionId,
    },

    /// Dependency lookup failed while resolving effective permissions.
    #[error(transparent)]
    Graph(GraphError),

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<GraphError> for RoleError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::PermissionNotFound { id } => Self::PermissionNotFound { id },
            GraphError::Store(e) => Self::Store(e),
            other => Self::Graph(other),
        }
    }
}

/// Checks that giving `role` the parent `parent` keeps the hierarchy acyclic.
///
/// Walks the parent chain upward from `parent`; if it reaches `role`, the new
/// link would close a loop.
///
/// # Errors
///
/// Returns [`RoleError::SelfParent`] or [`RoleError::HierarchyCycle`].
pub fn check_parent(roles: &[Role], role: RoleId, parent: RoleId) -> Result<(), RoleError> {
    if role == parent {
        return Err(RoleError::SelfParent { role });
    }
    let parents: BTreeMap<RoleId, Option<RoleId>> =
        roles.iter().map(|r| (r.id, r.parent)).collect();

    let mut path = vec![parent];
    let mut visited = HashSet::from([parent]);
    let mut cursor = parent;
    while let Some(Some(next)) = parents.get(&cursor) {
        if *next == role {
            path.push(role);
            return Err(RoleError::HierarchyCycle { role, parent, path });
        }
        if !visited.insert(*next) {
            // Pre-existing loop that does not involve `role`.
            break;
        }
        path.push(*next);
        cursor = *next;
    }
    Ok(())
}

/// Role management and effective-permission resolution.
#[derive(Debug)]
pub struct RoleService<S> {
    store: Arc<S>,
}

impl<S: RoleStore + PermissionStore + EdgeStore> RoleService<S> {
    /// Creates a service over `store`.
    #[must_use]
    pub const fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Creates a role without a parent.
    ///
    /// # Errors
    ///
    /// Returns [`RoleError::DuplicateName`] if the name is taken.
    pub fn create_role(&self, name: &str) -> Result<Role, RoleError> {
        let role = self.store.insert_role(name).map_err(|e| match e {
            StoreError::Conflict { .. } => RoleError::DuplicateName {
                name: name.to_string(),
            },
            other => RoleError::Store(other),
        })?;
        info!(role_id = %role.id, name = %role.name, "Role created");
        Ok(role)
    }

    /// Role by id.
    ///
    /// # Errors
    ///
    /// Returns [`RoleError::NotFound`] if absent.
    pub fn get(&self, id: RoleId) -> Result<Role, RoleError> {
        self.store.role(id)?.ok_or(RoleError::NotFound { id })
    }

    /// Makes `role` inherit from `parent`.
    ///
    /// # Errors
    ///
    /// - [`RoleError::NotFound`] if either role is missing
    /// - [`RoleError::SelfParent`] / [`RoleError::HierarchyCycle`] if the
    ///   link would loop
    pub fn set_parent(&self, role: RoleId, parent: RoleId) -> Result<(), RoleError> {
        self.store.set_parent_checked(role, Some(parent), &|roles: &[Role]| {
            check_parent(roles, role, parent)
        })?;
        info!(role_id = %role, parent_id = %parent, "Role parent set");
        Ok(())
    }

    /// Removes the parent link of `role`.
    ///
    /// # Errors
    ///
    /// Returns [`RoleError::NotFound`] if the role is missing.
    pub fn clear_parent(&self, role: RoleId) -> Result<(), RoleError> {
        self.store
            .set_parent_checked(role, None, &|_: &[Role]| Ok(()))?;
        info!(role_id = %role, "Role parent cleared");
        Ok(())
    }

    /// Grants `permission` to `role`. Returns `false` if already granted.
    ///
    /// # Errors
    ///
    /// Returns [`RoleError::NotFound`] or [`RoleError::PermissionNotFound`].
    pub fn assign_permission(
        &self,
        role: RoleId,
        permission: PermissionId,
    ) -> Result<bool, RoleError> {
        self.get(role)?;
        if self.store.permission(permission)?.is_none() {
            return Err(RoleError::PermissionNotFound { id: permission });
        }
        let added = self.store.assign_permission(role, permission)?;
        if added {
            info!(role_id = %role, permission_id = %permission, "Permission assigned to role");
        }
        Ok(added)
    }

    /// Revokes `permission` from `role`. Returns `false` if it was not granted.
    ///
    /// # Errors
    ///
    /// Returns [`RoleError::NotFound`] if the role is missing.
    pub fn revoke_permission(
        &self,
        role: RoleId,
        permission: PermissionId,
    ) -> Result<bool, RoleError> {
        self.get(role)?;
        let removed = self.store.revoke_permission(role, permission)?;
        if removed {
            info!(role_id = %role, permission_id = %permission, "Permission revoked from role");
        }
        Ok(removed)
    }

    /// Parent chain of `role`, nearest first.
    ///
    /// # Errors
    ///
    /// Returns [`RoleError::NotFound`] if the role is missing.
    pub fn ancestors(&self, role: RoleId) -> Result<Vec<Role>, RoleError> {
        let start = self.get(role)?;
        let roles: BTreeMap<RoleId, Role> = self
            .store
            .roles()?
            .into_iter()
            .map(|r| (r.id, r))
            .collect();

        let mut chain = Vec::new();
        let mut visited = HashSet::from([role]);
        let mut cursor = start.parent;
        while let Some(id) = cursor {
            if !visited.insert(id) {
                break;
            }
            let Some(parent) = roles.get(&id) else {
                break;
            };
            chain.push(parent.clone());
            cursor = parent.parent;
        }
        Ok(chain)
    }

    /// Own permissions plus every ancestor's.
    ///
    /// # Errors
    ///
    /// Returns [`RoleError::NotFound`] if the role is missing.
    pub fn effective_permissions(&self, role: RoleId) -> Result<BTreeSet<Permission>, RoleError> {
        let ids = self.effective_ids(role)?;
        self.resolve(&ids)
    }

    /// Effective permissions plus the transitive dependencies of each.
    ///
    /// # Errors
    ///
    /// Returns [`RoleError::NotFound`] if the role is missing.
    pub fn effective_permissions_with_dependencies(
        &self,
        role: RoleId,
        graph: &DependencyService<S>,
    ) -> Result<BTreeSet<Permission>, RoleError> {
        let ids: Vec<PermissionId> = self.effective_ids(role)?.into_iter().collect();
        let closures = graph.batch_load_dependencies(&ids)?;
        let mut result = self.resolve(&ids.iter().copied().collect())?;
        for deps in closures.into_values() {
            result.extend(deps);
        }
        Ok(result)
    }

    /// Granted permissions whose transitive dependencies are not all granted.
    ///
    /// Maps each such permission to the dependencies the role lacks.
    ///
    /// # Errors
    ///
    /// Returns [`RoleError::NotFound`] if the role is missing.
    pub fn missing_dependencies(
        &self,
        role: RoleId,
        graph: &DependencyService<S>,
    ) -> Result<BTreeMap<Permission, BTreeSet<Permission>>, RoleError> {
        let granted = self.effective_ids(role)?;
        let ids: Vec<PermissionId> = granted.iter().copied().collect();
        let closures = graph.batch_load_dependencies(&ids)?;
        let catalog = graph.catalog()?;

        let mut missing = BTreeMap::new();
        for (id, deps) in closures {
            let lacking: BTreeSet<Permission> = deps
                .into_iter()
                .filter(|dep| !granted.contains(&dep.id))
                .collect();
            if lacking.is_empty() {
                continue;
            }
            if let Some(permission) = catalog.get(&id) {
                missing.insert(permission.clone(), lacking);
            }
        }
        Ok(missing)
    }

    fn effective_ids(&self, role: RoleId) -> Result<BTreeSet<PermissionId>, RoleError> {
        let own = self.get(role)?;
        let mut ids = own.permissions;
        for ancestor in self.ancestors(role)? {
            ids.extend(ancestor.permissions);
        }
        Ok(ids)
    }

    fn resolve(&self, ids: &BTreeSet<PermissionId>) -> Result<BTreeSet<Permission>, RoleError> {
        Ok(self
            .store
            .permissions()?
            .into_iter()
            .filter(|p| ids.contains(&p.id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryClosureCache;
    use crate::permission::NewPermission;
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        roles: RoleService<MemoryStore>,
        graph: DependencyService<MemoryStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            Self {
                roles: RoleService::new(Arc::clone(&store)),
                graph: DependencyService::new(
                    Arc::clone(&store),
                    Arc::new(InMemoryClosureCache::new()),
                ),
                store,
            }
        }

        fn permission(&self, name: &str) -> Permission {
            self.store
                .insert_permission(&NewPermission::new(name))
                .unwrap()
        }
    }

    fn names(set: &BTreeSet<Permission>) -> Vec<&str> {
        set.iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn duplicate_role_name_rejected() {
        let fx = Fixture::new();
        fx.roles.create_role("admin").unwrap();
        assert!(matches!(
            fx.roles.create_role("admin"),
            Err(RoleError::DuplicateName { .. })
        ));
    }

    #[test]
    fn parent_cycle_rejected() {
        let fx = Fixture::new();
        let admin = fx.roles.create_role("admin").unwrap();
        let editor = fx.roles.create_role("editor").unwrap();
        let viewer = fx.roles.create_role("viewer").unwrap();
        fx.roles.set_parent(admin.id, editor.id).unwrap();
        fx.roles.set_parent(editor.id, viewer.id).unwrap();

        assert!(matches!(
            fx.roles.set_parent(viewer.id, viewer.id),
            Err(RoleError::SelfParent { .. })
        ));
        match fx.roles.set_parent(viewer.id, admin.id) {
            Err(RoleError::HierarchyCycle { path, .. }) => {
                assert_eq!(path, vec![admin.id, editor.id, viewer.id]);
            },
            other => panic!("expected HierarchyCycle, got {other:?}"),
        }
        assert!(fx.roles.get(viewer.id).unwrap().parent.is_none());
    }

    #[test]
    fn set_parent_requires_existing_roles() {
        let fx = Fixture::new();
        let admin = fx.roles.create_role("admin").unwrap();
        assert!(matches!(
            fx.roles.set_parent(admin.id, RoleId(99)),
            Err(RoleError::NotFound { id }) if id == RoleId(99)
        ));
    }

    #[test]
    fn effective_permissions_include_ancestors() {
        let fx = Fixture::new();
        let admin = fx.roles.create_role("admin").unwrap();
        let viewer = fx.roles.create_role("viewer").unwrap();
        let delete = fx.permission("users.delete");
        let view = fx.permission("users.view");
        fx.roles.assign_permission(admin.id, delete.id).unwrap();
        fx.roles.assign_permission(viewer.id, view.id).unwrap();
        fx.roles.set_parent(admin.id, viewer.id).unwrap();

        let effective = fx.roles.effective_permissions(admin.id).unwrap();
        assert_eq!(names(&effective), vec!["users.delete", "users.view"]);
        assert_eq!(fx.roles.ancestors(admin.id).unwrap()[0].id, viewer.id);

        fx.roles.clear_parent(admin.id).unwrap();
        assert_eq!(
            names(&fx.roles.effective_permissions(admin.id).unwrap()),
            vec!["users.delete"]
        );
    }

    #[test]
    fn assign_unknown_permission_rejected() {
        let fx = Fixture::new();
        let admin = fx.roles.create_role("admin").unwrap();
        assert!(matches!(
            fx.roles.assign_permission(admin.id, PermissionId(5)),
            Err(RoleError::PermissionNotFound { .. })
        ));
        assert!(!fx.roles.revoke_permission(admin.id, PermissionId(5)).unwrap());
    }

    #[test]
    fn dependency_aware_queries() {
        let fx = Fixture::new();
        let role = fx.roles.create_role("moderator").unwrap();
        let delete = fx.permission("users.delete");
        let edit = fx.permission("users.edit");
        let view = fx.permission("users.view");
        fx.graph.add_dependency(delete.id, edit.id).unwrap();
        fx.graph.add_dependency(edit.id, view.id).unwrap();
        fx.roles.assign_permission(role.id, delete.id).unwrap();
        fx.roles.assign_permission(role.id, view.id).unwrap();

        let with_deps = fx
            .roles
            .effective_permissions_with_dependencies(role.id, &fx.graph)
            .unwrap();
        assert_eq!(with_deps.len(), 3);

        let missing = fx.roles.missing_dependencies(role.id, &fx.graph).unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(names(&missing[&delete]), vec!["users.edit"]);
    }
}

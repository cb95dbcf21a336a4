//! In-memory store.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{
    ActivityStore, EdgeStore, PermissionStore, RoleStore, SettingChangeStore, StoreError,
};
use crate::audit::{Activity, ActivityId};
use crate::graph::{DependencyEdge, DependencyGraph, GraphError};
use crate::permission::{NewPermission, Permission, PermissionId};
use crate::role::{Role, RoleError, RoleId};
use crate::settings::{NewSettingChange, SettingChange};

#[derive(Debug)]
struct PermissionRow {
    permission: Permission,
    deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_permission_id: u64,
    permissions: BTreeMap<PermissionId, PermissionRow>,
    /// Insertion order is preserved.
    edges: Vec<DependencyEdge>,
    next_role_id: u64,
    roles: BTreeMap<RoleId, Role>,
    next_activity_id: u64,
    activities: BTreeMap<ActivityId, Activity>,
    setting_changes: Vec<SettingChange>,
}

impl MemoryState {
    fn active(&self, id: PermissionId) -> Option<&Permission> {
        self.permissions
            .get(&id)
            .filter(|row| row.deleted_at.is_none())
            .map(|row| &row.permission)
    }
}

/// A store backed by process memory. All state sits behind one mutex, so
/// every `*_checked` operation is trivially atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::LockPoisoned {
            context: "memory store state".to_string(),
        })
    }

    /// Appends an edge without any validation.
    ///
    /// Simulates rows written around the engine (imports, manual SQL) so
    /// integrity audits can be exercised.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockPoisoned`] if the state lock is poisoned.
    pub fn insert_edge_unchecked(&self, edge: DependencyEdge) -> Result<(), StoreError> {
        self.lock()?.edges.push(edge);
        Ok(())
    }
}

impl PermissionStore for MemoryStore {
    fn insert_permission(&self, draft: &NewPermission) -> Result<Permission, StoreError> {
        let mut state = self.lock()?;
        if state
            .permissions
            .values()
            .any(|row| row.permission.name == draft.name)
        {
            return Err(StoreError::Conflict {
                details: format!("permission name '{}' already used", draft.name),
            });
        }
        state.next_permission_id += 1;
        let permission = Permission {
            id: PermissionId(state.next_permission_id),
            name: draft.name.clone(),
            module: draft.module.clone(),
            display_name: draft.display_name_or_name().to_string(),
        };
        state.permissions.insert(
            permission.id,
            PermissionRow {
                permission: permission.clone(),
                deleted_at: None,
            },
        );
        Ok(permission)
    }

    fn permission(&self, id: PermissionId) -> Result<Option<Permission>, StoreError> {
        Ok(self.lock()?.active(id).cloned())
    }

    fn permission_by_name(&self, name: &str) -> Result<Option<Permission>, StoreError> {
        Ok(self
            .lock()?
            .permissions
            .values()
            .find(|row| row.deleted_at.is_none() && row.permission.name == name)
            .map(|row| row.permission.clone()))
    }

    fn permissions(&self) -> Result<Vec<Permission>, StoreError> {
        Ok(self
            .lock()?
            .permissions
            .values()
            .filter(|row| row.deleted_at.is_none())
            .map(|row| row.permission.clone())
            .collect())
    }

    fn soft_delete_permission(
        &self,
        id: PermissionId,
        deleted_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let Some(row) = state
            .permissions
            .get_mut(&id)
            .filter(|row| row.deleted_at.is_none())
        else {
            return Ok(false);
        };
        row.deleted_at = Some(deleted_at);
        state
            .edges
            .retain(|e| e.permission != id && e.depends_on != id);
        for role in state.roles.values_mut() {
            role.permissions.remove(&id);
        }
        Ok(true)
    }
}

impl EdgeStore for MemoryStore {
    fn edges(&self) -> Result<Vec<DependencyEdge>, StoreError> {
        Ok(self.lock()?.edges.clone())
    }

    fn insert_edge_checked(
        &self,
        edge: DependencyEdge,
        check: &dyn Fn(&DependencyGraph) -> Result<(), GraphError>,
    ) -> Result<(), GraphError> {
        let mut state = self.lock()?;
        for id in [edge.permission, edge.depends_on] {
            if state.active(id).is_none() {
                return Err(GraphError::PermissionNotFound { id });
            }
        }
        let graph = DependencyGraph::from_edges(state.edges.iter().copied());
        check(&graph)?;
        state.edges.push(edge);
        Ok(())
    }

    fn delete_edge(&self, edge: DependencyEdge) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let before = state.edges.len();
        state.edges.retain(|e| *e != edge);
        Ok(state.edges.len() != before)
    }
}

impl RoleStore for MemoryStore {
    fn insert_role(&self, name: &str) -> Result<Role, StoreError> {
        let mut state = self.lock()?;
        if state.roles.values().any(|r| r.name == name) {
            return Err(StoreError::Conflict {
                details: format!("role name '{name}' already used"),
            });
        }
        state.next_role_id += 1;
        let role = Role {
            id: RoleId(state.next_role_id),
            name: name.to_string(),
            parent: None,
            permissions: std::collections::BTreeSet::new(),
        };
        state.roles.insert(role.id, role.clone());
        Ok(role)
    }

    fn role(&self, id: RoleId) -> Result<Option<Role>, StoreError> {
        Ok(self.lock()?.roles.get(&id).cloned())
    }

    fn role_by_name(&self, name: &str) -> Result<Option<Role>, StoreError> {
        Ok(self
            .lock()?
            .roles
            .values()
            .find(|r| r.name == name)
            .cloned())
    }

    fn roles(&self) -> Result<Vec<Role>, StoreError> {
        Ok(self.lock()?.roles.values().cloned().collect())
    }

    fn set_parent_checked(
        &self,
        role: RoleId,
        parent: Option<RoleId>,
        check: &dyn Fn(&[Role]) -> Result<(), RoleError>,
    ) -> Result<(), RoleError> {
        let mut state = self.lock()?;
        for id in std::iter::once(role).chain(parent) {
            if !state.roles.contains_key(&id) {
                return Err(RoleError::NotFound { id });
            }
        }
        let snapshot: Vec<Role> = state.roles.values().cloned().collect();
        check(&snapshot)?;
        if let Some(target) = state.roles.get_mut(&role) {
            target.parent = parent;
        }
        Ok(())
    }

    fn assign_permission(
        &self,
        role: RoleId,
        permission: PermissionId,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        Ok(state
            .roles
            .get_mut(&role)
            .is_some_and(|r| r.permissions.insert(permission)))
    }

    fn revoke_permission(
        &self,
        role: RoleId,
        permission: PermissionId,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        Ok(state
            .roles
            .get_mut(&role)
            .is_some_and(|r| r.permissions.remove(&permission)))
    }

    fn roles_with_permission(&self, permission: PermissionId) -> Result<Vec<RoleId>, StoreError> {
        Ok(self
            .lock()?
            .roles
            .values()
            .filter(|r| r.permissions.contains(&permission))
            .map(|r| r.id)
            .collect())
    }
}

impl ActivityStore for MemoryStore {
    fn insert_activity(&self, activity: &Activity) -> Result<ActivityId, StoreError> {
        let mut state = self.lock()?;
        state.next_activity_id += 1;
        let id = ActivityId(state.next_activity_id);
        let mut stored = activity.clone();
        stored.id = Some(id);
        state.activities.insert(id, stored);
        Ok(id)
    }

    fn activity(&self, id: ActivityId) -> Result<Option<Activity>, StoreError> {
        Ok(self.lock()?.activities.get(&id).cloned())
    }

    fn activities(&self) -> Result<Vec<Activity>, StoreError> {
        Ok(self.lock()?.activities.values().cloned().collect())
    }

    fn replace_activity(&self, activity: &Activity) -> Result<(), StoreError> {
        let Some(id) = activity.id else {
            return Err(StoreError::Corrupt {
                details: "cannot replace an activity without an id".to_string(),
            });
        };
        let mut state = self.lock()?;
        match state.activities.get_mut(&id) {
            Some(row) => {
                *row = activity.clone();
                Ok(())
            },
            None => Err(StoreError::Corrupt {
                details: format!("activity {id} does not exist"),
            }),
        }
    }

    fn delete_activity(&self, id: ActivityId) -> Result<bool, StoreError> {
        Ok(self.lock()?.activities.remove(&id).is_some())
    }
}

impl SettingChangeStore for MemoryStore {
    fn append_setting_change(
        &self,
        change: &NewSettingChange,
    ) -> Result<SettingChange, StoreError> {
        let mut state = self.lock()?;
        let id = state.setting_changes.len() as u64 + 1;
        let row = SettingChange {
            id,
            key: change.key.clone(),
            old_value: change.old_value.clone(),
            new_value: change.new_value.clone(),
            changed_by: change.changed_by,
            reason: change.reason.clone(),
            created_at: change.created_at,
        };
        state.setting_changes.push(row.clone());
        Ok(row)
    }

    fn setting_changes(&self, key: Option<&str>) -> Result<Vec<SettingChange>, StoreError> {
        Ok(self
            .lock()?
            .setting_changes
            .iter()
            .filter(|c| key.is_none_or(|k| c.key == k))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_stay_reserved_after_soft_delete() {
        let store = MemoryStore::new();
        let p = store
            .insert_permission(&NewPermission::new("users.view"))
            .unwrap();
        assert!(store.soft_delete_permission(p.id, Utc::now()).unwrap());
        assert!(!store.soft_delete_permission(p.id, Utc::now()).unwrap());
        assert!(store.permission(p.id).unwrap().is_none());
        assert!(matches!(
            store.insert_permission(&NewPermission::new("users.view")),
            Err(StoreError::Conflict { .. })
        ));
    }

    #[test]
    fn soft_delete_cascades_role_assignments() {
        let store = MemoryStore::new();
        let p = store
            .insert_permission(&NewPermission::new("users.view"))
            .unwrap();
        let role = store.insert_role("viewer").unwrap();
        store.assign_permission(role.id, p.id).unwrap();

        store.soft_delete_permission(p.id, Utc::now()).unwrap();
        assert!(store.roles_with_permission(p.id).unwrap().is_empty());
    }

    #[test]
    fn rejected_check_leaves_edges_untouched() {
        let store = MemoryStore::new();
        let a = store.insert_permission(&NewPermission::new("a.x")).unwrap();
        let b = store.insert_permission(&NewPermission::new("b.x")).unwrap();
        let result = store.insert_edge_checked(DependencyEdge::new(a.id, b.id), &|_: &DependencyGraph| {
            Err(GraphError::SelfDependency { permission: a.id })
        });
        assert!(result.is_err());
        assert!(store.edges().unwrap().is_empty());
    }
}

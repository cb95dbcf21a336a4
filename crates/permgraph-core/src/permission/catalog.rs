//! Permission lifecycle over a [`PermissionStore`].

use std::sync::Arc;

use tracing::info;

use super::{NewPermission, Permission, PermissionError, PermissionId, validate_permission_name};
use crate::cache::ClosureCache;
use crate::clock::{Clock, SystemClock};
use crate::store::{PermissionStore, StoreError};

/// Creates, looks up, and soft-deletes permissions.
///
/// Every mutation invalidates the shared closure cache, since module counts
/// and closures over deleted nodes depend on the catalog contents.
#[derive(Debug)]
pub struct PermissionCatalog<S> {
    store: Arc<S>,
    cache: Arc<dyn ClosureCache>,
    clock: Arc<dyn Clock>,
}

impl<S: PermissionStore> PermissionCatalog<S> {
    /// Creates a catalog sharing `cache` with the dependency service.
    #[must_use]
    pub fn new(store: Arc<S>, cache: Arc<dyn ClosureCache>) -> Self {
        Self {
            store,
            cache,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock used for `deleted_at` stamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Registers a new permission.
    ///
    /// # Errors
    ///
    /// - [`PermissionError::InvalidName`] if the name or module is malformed
    /// - [`PermissionError::DuplicateName`] if the name was ever used before
    pub fn create(&self, draft: &NewPermission) -> Result<Permission, PermissionError> {
        validate_permission_name(&draft.name)?;
        if draft.module.trim().is_empty() {
            return Err(PermissionError::InvalidName {
                name: draft.name.clone(),
                reason: "module is empty".to_string(),
            });
        }

        let permission = self
            .store
            .insert_permission(draft)
            .map_err(|e| match e {
                StoreError::Conflict { .. } => PermissionError::DuplicateName {
                    name: draft.name.clone(),
                },
                other => PermissionError::Store(other),
            })?;

        self.cache.invalidate_all();
        info!(
            permission_id = %permission.id,
            name = %permission.name,
            module = %permission.module,
            "Permission created"
        );
        Ok(permission)
    }

    /// Returns the active permission with `id`.
    ///
    /// # Errors
    ///
    /// Returns [`PermissionError::NotFound`] if it does not exist or was
    /// deleted.
    pub fn get(&self, id: PermissionId) -> Result<Permission, PermissionError> {
        self.store
            .permission(id)?
            .ok_or(PermissionError::NotFound { id })
    }

    /// Looks up an active permission by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn find_by_name(&self, name: &str) -> Result<Option<Permission>, PermissionError> {
        Ok(self.store.permission_by_name(name)?)
    }

    /// All active permissions, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn list(&self) -> Result<Vec<Permission>, PermissionError> {
        Ok(self.store.permissions()?)
    }

    /// Active permissions belonging to `module`, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn list_by_module(&self, module: &str) -> Result<Vec<Permission>, PermissionError> {
        Ok(self
            .store
            .permissions()?
            .into_iter()
            .filter(|p| p.module == module)
            .collect())
    }

    /// Soft-deletes a permission, removing its dependency edges and role
    /// assignments in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns [`PermissionError::NotFound`] if no active permission has
    /// `id`.
    pub fn soft_delete(&self, id: PermissionId) -> Result<(), PermissionError> {
        let removed = self.store.soft_delete_permission(id, self.clock.now())?;
        if !removed {
            return Err(PermissionError::NotFound { id });
        }
        self.cache.invalidate_all();
        info!(permission_id = %id, "Permission soft-deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryClosureCache;
    use crate::graph::DependencyEdge;
    use crate::store::{EdgeStore, MemoryStore};

    fn catalog() -> (PermissionCatalog<MemoryStore>, Arc<MemoryStore>, Arc<InMemoryClosureCache>) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(InMemoryClosureCache::new());
        let catalog = PermissionCatalog::new(Arc::clone(&store), cache.clone());
        (catalog, store, cache)
    }

    #[test]
    fn create_and_lookup() {
        let (catalog, _, _) = catalog();
        let created = catalog
            .create(&NewPermission::new("users.view").with_display_name("View users"))
            .unwrap();

        assert_eq!(created.module, "users");
        assert_eq!(created.display_name, "View users");
        assert_eq!(catalog.get(created.id).unwrap(), created);
        assert_eq!(
            catalog.find_by_name("users.view").unwrap(),
            Some(created.clone())
        );
        assert_eq!(catalog.list_by_module("users").unwrap(), vec![created]);
        assert!(catalog.list_by_module("roles").unwrap().is_empty());
    }

    #[test]
    fn duplicate_name_rejected() {
        let (catalog, _, _) = catalog();
        catalog.create(&NewPermission::new("users.view")).unwrap();
        let err = catalog.create(&NewPermission::new("users.view")).unwrap_err();
        assert!(matches!(err, PermissionError::DuplicateName { .. }), "{err}");
    }

    #[test]
    fn name_stays_reserved_after_soft_delete() {
        let (catalog, _, _) = catalog();
        let p = catalog.create(&NewPermission::new("users.view")).unwrap();
        catalog.soft_delete(p.id).unwrap();

        assert!(matches!(
            catalog.get(p.id),
            Err(PermissionError::NotFound { .. })
        ));
        assert!(matches!(
            catalog.create(&NewPermission::new("users.view")),
            Err(PermissionError::DuplicateName { .. })
        ));
    }

    #[test]
    fn soft_delete_cascades_edges_and_invalidates_cache() {
        let (catalog, store, cache) = catalog();
        let edit = catalog.create(&NewPermission::new("users.edit")).unwrap();
        let view = catalog.create(&NewPermission::new("users.view")).unwrap();
        store
            .insert_edge_unchecked(DependencyEdge::new(edit.id, view.id))
            .unwrap();

        let before = cache.generation();
        catalog.soft_delete(view.id).unwrap();

        assert!(store.edges().unwrap().is_empty());
        assert!(cache.generation() > before);
    }

    #[test]
    fn soft_delete_unknown_is_not_found() {
        let (catalog, _, _) = catalog();
        assert!(matches!(
            catalog.soft_delete(PermissionId(99)),
            Err(PermissionError::NotFound { .. })
        ));
    }

    #[test]
    fn empty_module_rejected() {
        let (catalog, _, _) = catalog();
        let err = catalog
            .create(&NewPermission::new("users.view").with_module("  "))
            .unwrap_err();
        assert!(matches!(err, PermissionError::InvalidName { .. }));
    }
}

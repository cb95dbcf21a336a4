//! The dependency graph engine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use super::{
    CrossModuleDependency, CrossModuleLint, DependencyEdge, DependencyGraph, GraphError,
    IntegrityReport,
};
use crate::cache::{
    CacheMetrics, Closure, ClosureCache, ClosureDirection, ClosureKey, InMemoryClosureCache,
    NoopClosureCache,
};
use crate::config::GraphConfig;
use crate::permission::{Permission, PermissionId};
use crate::stats::GraphStatistics;
use crate::store::{EdgeStore, PermissionStore};

/// Validates and applies dependency edits, and answers closure and path
/// queries.
///
/// The store is the source of truth. Every query loads a fresh snapshot
/// unless the closure cache already holds the answer.
#[derive(Debug)]
pub struct DependencyService<S> {
    store: Arc<S>,
    cache: Arc<dyn ClosureCache>,
    lint: CrossModuleLint,
    /// Last computed statistics, tagged with the cache generation.
    pub(crate) stats_memo: Mutex<Option<(u64, GraphStatistics)>>,
}

impl<S: PermissionStore + EdgeStore> DependencyService<S> {
    /// Creates an engine over `store`, memoizing through `cache`.
    #[must_use]
    pub fn new(store: Arc<S>, cache: Arc<dyn ClosureCache>) -> Self {
        Self {
            store,
            cache,
            lint: CrossModuleLint::default(),
            stats_memo: Mutex::new(None),
        }
    }

    /// Creates an engine configured from `[graph]`.
    #[must_use]
    pub fn from_config(store: Arc<S>, config: &GraphConfig) -> Self {
        let cache: Arc<dyn ClosureCache> = if config.cache_enabled {
            Arc::new(InMemoryClosureCache::new())
        } else {
            Arc::new(NoopClosureCache::new())
        };
        Self::new(store, cache).with_cross_module_lint(config.lint())
    }

    /// Replaces the cross-module lint settings.
    #[must_use]
    pub fn with_cross_module_lint(mut self, lint: CrossModuleLint) -> Self {
        self.lint = lint;
        self
    }

    /// The shared closure cache (hand it to the
    /// [`PermissionCatalog`](crate::permission::PermissionCatalog)).
    #[must_use]
    pub fn cache(&self) -> Arc<dyn ClosureCache> {
        Arc::clone(&self.cache)
    }

    /// Cache hit/miss/invalidation counters.
    #[must_use]
    pub fn cache_metrics(&self) -> CacheMetrics {
        self.cache.metrics()
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Declares that `permission` requires `depends_on`.
    ///
    /// The existence, duplicate, and cycle checks run inside the store's
    /// write transaction together with the insert.
    ///
    /// # Errors
    ///
    /// - [`GraphError::SelfDependency`] if both ids are equal
    /// - [`GraphError::PermissionNotFound`] if either permission is missing
    /// - [`GraphError::DuplicateEdge`] if the edge exists
    /// - [`GraphError::CycleDetected`] if `depends_on` already reaches
    ///   `permission`
    pub fn add_dependency(
        &self,
        permission: PermissionId,
        depends_on: PermissionId,
    ) -> Result<(), GraphError> {
        let edge = DependencyEdge::new(permission, depends_on);
        if edge.is_self_loop() {
            return Err(GraphError::SelfDependency { permission });
        }

        let result = self
            .store
            .insert_edge_checked(edge, &|graph: &DependencyGraph| graph.check_insert(edge));

        match result {
            Ok(()) => {
                self.invalidate();
                info!(
                    permission_id = %permission,
                    depends_on = %depends_on,
                    "Permission dependency added"
                );
                Ok(())
            },
            Err(e) => {
                debug!(
                    permission_id = %permission,
                    depends_on = %depends_on,
                    error = %e,
                    "Permission dependency rejected"
                );
                Err(e)
            },
        }
    }

    /// Removes `permission -> depends_on`. Absent edges are a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Store`] if the delete fails.
    pub fn remove_dependency(
        &self,
        permission: PermissionId,
        depends_on: PermissionId,
    ) -> Result<(), GraphError> {
        let removed = self
            .store
            .delete_edge(DependencyEdge::new(permission, depends_on))?;
        if removed {
            self.invalidate();
            info!(
                permission_id = %permission,
                depends_on = %depends_on,
                "Permission dependency removed"
            );
        }
        Ok(())
    }

    /// Loads the current edge set.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Store`] if the read fails.
    pub fn snapshot(&self) -> Result<DependencyGraph, GraphError> {
        Ok(DependencyGraph::from_edges(self.store.edges()?))
    }

    /// Permissions `permission` requires directly.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::PermissionNotFound`] for unknown ids.
    pub fn direct_dependencies(
        &self,
        permission: PermissionId,
    ) -> Result<BTreeSet<Permission>, GraphError> {
        self.require(permission)?;
        let graph = self.snapshot()?;
        self.resolve(graph.direct_dependencies(permission).iter().copied())
    }

    /// Permissions that require `permission` directly.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::PermissionNotFound`] for unknown ids.
    pub fn direct_dependents(
        &self,
        permission: PermissionId,
    ) -> Result<BTreeSet<Permission>, GraphError> {
        self.require(permission)?;
        let graph = self.snapshot()?;
        self.resolve(graph.direct_dependents(permission).iter().copied())
    }

    /// Everything that must also be granted with `permission`.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::PermissionNotFound`] for unknown ids.
    pub fn all_dependencies(
        &self,
        permission: PermissionId,
    ) -> Result<BTreeSet<Permission>, GraphError> {
        self.require(permission)?;
        let ids = self.closure(ClosureKey::dependencies(permission))?;
        self.resolve(ids.iter().copied())
    }

    /// Everything that would break if `permission` were revoked.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::PermissionNotFound`] for unknown ids.
    pub fn all_dependents(
        &self,
        permission: PermissionId,
    ) -> Result<BTreeSet<Permission>, GraphError> {
        self.require(permission)?;
        let ids = self.closure(ClosureKey::dependents(permission))?;
        self.resolve(ids.iter().copied())
    }

    /// Returns `true` if `to` is reachable from `from` along dependency
    /// edges.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::PermissionNotFound`] for unknown ids.
    pub fn has_dependency_path(
        &self,
        from: PermissionId,
        to: PermissionId,
    ) -> Result<bool, GraphError> {
        self.require(from)?;
        self.require(to)?;
        if from != to {
            if let Some(cached) = self.cache.get(ClosureKey::dependencies(from)) {
                return Ok(cached.contains(&to));
            }
        }
        Ok(self.snapshot()?.has_path(from, to))
    }

    /// Shortest dependency path from `from` to `to`, both included.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::PermissionNotFound`] for unknown ids.
    pub fn dependency_path(
        &self,
        from: PermissionId,
        to: PermissionId,
    ) -> Result<Option<Vec<Permission>>, GraphError> {
        self.require(from)?;
        self.require(to)?;
        let Some(path) = self.snapshot()?.shortest_path(from, to) else {
            return Ok(None);
        };
        let catalog = self.catalog()?;
        Ok(Some(
            path.into_iter()
                .map(|id| lookup(&catalog, id))
                .collect(),
        ))
    }

    /// Full consistency audit of the stored edge set.
    ///
    /// O(V + E). Treat as a batch operation on large graphs.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Store`] if the edges or permissions cannot be
    /// loaded.
    pub fn validate_integrity(&self) -> Result<IntegrityReport, GraphError> {
        let edges = self.store.edges()?;
        let catalog = self.catalog()?;
        let graph = DependencyGraph::from_edges(edges.iter().copied());

        let cycles: Vec<Vec<Permission>> = graph
            .find_cycles()
            .into_iter()
            .map(|cycle| cycle.into_iter().map(|id| lookup(&catalog, id)).collect())
            .collect();

        let mut dangling_edges = Vec::new();
        let mut cross_module = Vec::new();
        for edge in &edges {
            match (catalog.get(&edge.permission), catalog.get(&edge.depends_on)) {
                (Some(permission), Some(depends_on)) => {
                    if self.lint.flags(permission, depends_on) {
                        cross_module.push(CrossModuleDependency {
                            permission: permission.clone(),
                            depends_on: depends_on.clone(),
                        });
                    }
                },
                _ => dangling_edges.push(*edge),
            }
        }

        let is_valid = cycles.is_empty() && dangling_edges.is_empty();
        if is_valid {
            info!(
                edges = edges.len(),
                cross_module = cross_module.len(),
                "Dependency graph integrity check passed"
            );
        } else {
            warn!(
                cycles = cycles.len(),
                dangling_edges = dangling_edges.len(),
                "Dependency graph integrity check failed"
            );
        }

        Ok(IntegrityReport {
            is_valid,
            cycles,
            dangling_edges,
            cross_module,
        })
    }

    /// Dependency closures for many permissions from a single edge fetch.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::PermissionNotFound`] if any id is unknown.
    pub fn batch_load_dependencies(
        &self,
        permissions: &[PermissionId],
    ) -> Result<BTreeMap<PermissionId, BTreeSet<Permission>>, GraphError> {
        self.batch_load(permissions, ClosureDirection::Dependencies)
    }

    /// Dependent closures for many permissions from a single edge fetch.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::PermissionNotFound`] if any id is unknown.
    pub fn batch_load_dependents(
        &self,
        permissions: &[PermissionId],
    ) -> Result<BTreeMap<PermissionId, BTreeSet<Permission>>, GraphError> {
        self.batch_load(permissions, ClosureDirection::Dependents)
    }

    fn batch_load(
        &self,
        permissions: &[PermissionId],
        direction: ClosureDirection,
    ) -> Result<BTreeMap<PermissionId, BTreeSet<Permission>>, GraphError> {
        let catalog = self.catalog()?;
        if let Some(missing) = permissions.iter().find(|id| !catalog.contains_key(id)) {
            return Err(GraphError::PermissionNotFound { id: *missing });
        }

        let generation = self.cache.generation();
        let mut result = BTreeMap::new();
        let mut misses = Vec::new();
        for &id in permissions {
            let key = ClosureKey {
                direction,
                permission: id,
            };
            match self.cache.get(key) {
                Some(hit) => {
                    result.insert(id, resolve_in(&catalog, &hit));
                },
                None => misses.push(key),
            }
        }

        if !misses.is_empty() {
            let graph = self.snapshot()?;
            for key in misses {
                let computed: Closure = Arc::new(compute(&graph, key));
                self.cache.put(key, generation, Arc::clone(&computed));
                result.insert(key.permission, resolve_in(&catalog, &computed));
            }
        }
        Ok(result)
    }

    fn closure(&self, key: ClosureKey) -> Result<Closure, GraphError> {
        if let Some(hit) = self.cache.get(key) {
            return Ok(hit);
        }
        let generation = self.cache.generation();
        let graph = self.snapshot()?;
        let computed: Closure = Arc::new(compute(&graph, key));
        self.cache.put(key, generation, Arc::clone(&computed));
        Ok(computed)
    }

    fn invalidate(&self) {
        self.cache.invalidate_all();
        *self.stats_memo.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub(crate) fn require(&self, id: PermissionId) -> Result<Permission, GraphError> {
        self.store
            .permission(id)?
            .ok_or(GraphError::PermissionNotFound { id })
    }

    pub(crate) fn catalog(&self) -> Result<BTreeMap<PermissionId, Permission>, GraphError> {
        Ok(self
            .store
            .permissions()?
            .into_iter()
            .map(|p| (p.id, p))
            .collect())
    }

    fn resolve(
        &self,
        ids: impl IntoIterator<Item = PermissionId>,
    ) -> Result<BTreeSet<Permission>, GraphError> {
        let catalog = self.catalog()?;
        Ok(ids
            .into_iter()
            .filter_map(|id| {
                let found = catalog.get(&id).cloned();
                if found.is_none() {
                    warn!(permission_id = %id, "Edge references a missing permission");
                }
                found
            })
            .collect())
    }
}

fn compute(graph: &DependencyGraph, key: ClosureKey) -> BTreeSet<PermissionId> {
    match key.direction {
        ClosureDirection::Dependencies => graph.all_dependencies(key.permission),
        ClosureDirection::Dependents => graph.all_dependents(key.permission),
    }
}

fn resolve_in(
    catalog: &BTreeMap<PermissionId, Permission>,
    ids: &BTreeSet<PermissionId>,
) -> BTreeSet<Permission> {
    ids.iter().filter_map(|id| catalog.get(id).cloned()).collect()
}

fn lookup(catalog: &BTreeMap<PermissionId, Permission>, id: PermissionId) -> Permission {
    catalog
        .get(&id)
        .cloned()
        .unwrap_or_else(|| Permission::unresolved(id))
}

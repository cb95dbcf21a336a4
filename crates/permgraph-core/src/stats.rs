//! Aggregate statistics over the permission catalog and dependency graph.

use std::collections::BTreeMap;
use std::sync::PoisonError;

use serde::Serialize;
use tracing::debug;

use crate::graph::{DependencyGraph, DependencyService, GraphError};
use crate::permission::PermissionId;
use crate::store::{EdgeStore, PermissionStore, RoleStore};

/// Summary of the permission graph.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct GraphStatistics {
    /// Active permissions.
    pub permission_count: usize,
    /// Stored dependency edges.
    pub edge_count: usize,
    /// Active permissions per module.
    pub module_counts: BTreeMap<String, usize>,
    /// Permissions with no dependencies.
    pub root_count: usize,
    /// Permissions nothing depends on.
    pub leaf_count: usize,
    /// Longest dependency chain, in edges.
    pub max_depth: usize,
}

impl GraphStatistics {
    fn compute(
        permissions: impl IntoIterator<Item = (PermissionId, String)>,
        graph: &DependencyGraph,
    ) -> Self {
        let mut stats = Self {
            edge_count: graph.edge_count(),
            max_depth: graph.max_depth(),
            ..Self::default()
        };
        for (id, module) in permissions {
            stats.permission_count += 1;
            *stats.module_counts.entry(module).or_default() += 1;
            if graph.direct_dependencies(id).is_empty() {
                stats.root_count += 1;
            }
            if graph.direct_dependents(id).is_empty() {
                stats.leaf_count += 1;
            }
        }
        stats
    }
}

/// How widely a permission is referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PermissionUsage {
    /// Permissions that directly depend on it.
    pub dependent_count: usize,
    /// Roles it is directly assigned to.
    pub role_count: usize,
}

impl PermissionUsage {
    /// Returns `true` if anything references the permission.
    #[must_use]
    pub const fn is_in_use(&self) -> bool {
        self.dependent_count > 0 || self.role_count > 0
    }
}

impl<S: PermissionStore + EdgeStore> DependencyService<S> {
    /// Graph statistics, memoized until the next graph or catalog write.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Store`] if the catalog or edges cannot be read.
    pub fn statistics(&self) -> Result<GraphStatistics, GraphError> {
        let cache = self.cache();
        let generation = cache.generation();
        {
            let memo = self.stats_memo.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((memo_generation, stats)) = memo.as_ref() {
                if *memo_generation == generation {
                    debug!(generation, "Statistics served from memo");
                    return Ok(stats.clone());
                }
            }
        }

        let graph = self.snapshot()?;
        let permissions = self.store().permissions()?;
        let stats = GraphStatistics::compute(
            permissions.into_iter().map(|p| (p.id, p.module)),
            &graph,
        );

        let mut memo = self.stats_memo.lock().unwrap_or_else(PoisonError::into_inner);
        if cache.generation() == generation {
            *memo = Some((generation, stats.clone()));
        }
        Ok(stats)
    }
}

impl<S: PermissionStore + EdgeStore + RoleStore> DependencyService<S> {
    /// Direct dependents and role assignments of `permission`.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::PermissionNotFound`] for unknown ids.
    pub fn usage(&self, permission: PermissionId) -> Result<PermissionUsage, GraphError> {
        self.require(permission)?;
        let graph = self.snapshot()?;
        let roles = self.store().roles_with_permission(permission)?;
        Ok(PermissionUsage {
            dependent_count: graph.direct_dependents(permission).len(),
            role_count: roles.len(),
        })
    }

    /// Returns `true` if `permission` has dependents or is assigned to a role.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::PermissionNotFound`] for unknown ids.
    pub fn is_in_use(&self, permission: PermissionId) -> Result<bool, GraphError> {
        Ok(self.usage(permission)?.is_in_use())
    }
}

//! Permission dependency graph.
//!
//! An edge `users.delete -> users.edit` means `users.delete` cannot be granted
//! unless `users.edit` is granted too. The edge set must stay a DAG:
//!
//! ```text
//! users.delete -> users.edit -> users.view -> dashboard.view
//!                                                   |
//!             (dashboard.view -> users.delete)  ----x  rejected: CycleDetected
//! ```
//!
//! # Layers
//!
//! - [`DependencyGraph`]: adjacency lists plus the algorithms (closure BFS,
//!   shortest path, tri-colour cycle scan). Pure, no I/O.
//! - [`DependencyService`]: the engine callers use. It loads edges through
//!   an [`EdgeStore`](crate::store::EdgeStore), validates inserts inside the
//!   store's write transaction, memoizes closures in a
//!   [`ClosureCache`](crate::cache::ClosureCache), and resolves ids to
//!   [`Permission`]s.
//!
//! # Invariants
//!
//! - No self-loops, no duplicate ordered pairs, no directed cycles. The cycle
//!   check runs on every insert, atomically with the write.
//! - [`DependencyService::validate_integrity`] re-checks the whole stored edge
//!   set, so cycles written around the engine are still found.

mod dag;
mod service;

#[cfg(test)]
mod proptests;
#[cfg(test)]
mod tests;

use std::collections::BTreeSet;

use serde::Serialize;
use thiserror::Error;

use crate::permission::{Permission, PermissionId};
use crate::store::StoreError;

pub use dag::{DependencyEdge, DependencyGraph};
pub use service::DependencyService;

/// Permissions whose cross-module dependencies are expected.
pub const DEFAULT_CROSS_MODULE_ALLOWLIST: [&str; 2] =
    ["users.assign_roles", "roles.manage_permissions"];

/// Errors from dependency graph operations.
///
/// All variants except [`GraphError::Store`] are caller-correctable and
/// should be surfaced as validation failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GraphError {
    /// A permission cannot depend on itself.
    #[error("permission {permission} cannot depend on itself")]
    SelfDependency {
        /// The permission.
        permission: PermissionId,
    },

    /// The edge already exists.
    #[error("dependency {permission} -> {depends_on} already exists")]
    DuplicateEdge {
        /// The dependent permission.
        permission: PermissionId,
        /// The required permission.
        depends_on: PermissionId,
    },

    /// The edge would close a cycle.
    #[error(
        "dependency {permission} -> {depends_on} would create a cycle via existing path {}",
        format_path(.path)
    )]
    CycleDetected {
        /// The dependent permission of the rejected edge.
        permission: PermissionId,
        /// The required permission of the rejected edge.
        depends_on: PermissionId,
        /// Existing path `depends_on -> ... -> permission`.
        path: Vec<PermissionId>,
    },

    /// A referenced permission does not exist or was deleted.
    #[error("permission not found: {id}")]
    PermissionNotFound {
        /// The missing identifier.
        id: PermissionId,
    },

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn format_path(path: &[PermissionId]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Soft lint for dependencies that cross module boundaries.
///
/// A finding is a diagnostic only; it never rejects an edge and never makes
/// an [`IntegrityReport`] invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossModuleLint {
    /// Whether the lint runs at all.
    pub enabled: bool,
    /// Dependent permission names exempt from the lint.
    pub allowlist: BTreeSet<String>,
}

impl Default for CrossModuleLint {
    fn default() -> Self {
        Self {
            enabled: true,
            allowlist: DEFAULT_CROSS_MODULE_ALLOWLIST
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

impl CrossModuleLint {
    /// A lint that reports nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            allowlist: BTreeSet::new(),
        }
    }

    /// Returns `true` if `permission -> depends_on` should be reported.
    #[must_use]
    pub fn flags(&self, permission: &Permission, depends_on: &Permission) -> bool {
        self.enabled
            && permission.module != depends_on.module
            && !self.allowlist.contains(&permission.name)
    }
}

/// A dependency between permissions of different modules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrossModuleDependency {
    /// The dependent permission.
    pub permission: Permission,
    /// The required permission in another module.
    pub depends_on: Permission,
}

/// Result of a full-graph consistency audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    /// `true` when there are no cycles and no dangling edges.
    pub is_valid: bool,
    /// Every cycle found; `[a, b, c]` means `a -> b -> c -> a`.
    pub cycles: Vec<Vec<Permission>>,
    /// Edges referencing a missing or soft-deleted permission.
    pub dangling_edges: Vec<DependencyEdge>,
    /// Cross-module lint findings (informational).
    pub cross_module: Vec<CrossModuleDependency>,
}

impl Permission {
    /// Placeholder for an id that an edge references but the catalog does
    /// not contain.
    #[must_use]
    pub fn unresolved(id: PermissionId) -> Self {
        Self {
            id,
            name: format!("#{id}"),
            module: String::new(),
            display_name: "(missing permission)".to_string(),
        }
    }
}

//! Persistence boundary.
//!
//! The graph engine, role service, audit guard, and settings log never
//! traverse storage directly. They load what they need through the traits in
//! this module and run their algorithms in memory.
//!
//! Two implementations are provided:
//!
//! - [`MemoryStore`]: a single mutex-guarded state, used by tests and
//!   embedders that persist elsewhere
//! - [`SqliteStore`]: `SQLite` in WAL mode, with immediate transactions around
//!   every check-then-write sequence
//!
//! # Atomic check-then-write
//!
//! Edge insertion and role re-parenting must run their acyclicity check and
//! their write as one unit, otherwise two concurrent "safe" writes can jointly
//! close a cycle. The `*_checked` methods take the check as a callback and
//! invoke it while holding the write lock, against a snapshot read inside the
//! same transaction.

mod memory;
mod sqlite;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::audit::{Activity, ActivityId};
use crate::graph::{DependencyEdge, DependencyGraph, GraphError};
use crate::permission::{NewPermission, Permission, PermissionId};
use crate::role::{Role, RoleError, RoleId};
use crate::settings::{NewSettingChange, SettingChange};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Errors raised by a store implementation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON column could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A uniqueness constraint rejected the write.
    #[error("conflict: {details}")]
    Conflict {
        /// Which constraint was violated.
        details: String,
    },

    /// A stored row could not be decoded into its domain type.
    #[error("corrupt row: {details}")]
    Corrupt {
        /// Details about the decode failure.
        details: String,
    },

    /// Internal lock was poisoned (a thread panicked while holding it).
    #[error("store lock poisoned: {context}")]
    LockPoisoned {
        /// Which lock was poisoned.
        context: String,
    },
}

/// Permission rows.
pub trait PermissionStore: Send + Sync {
    /// Inserts a permission.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the name was ever used, including
    /// by a soft-deleted permission.
    fn insert_permission(&self, draft: &NewPermission) -> Result<Permission, StoreError>;

    /// Active permission by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn permission(&self, id: PermissionId) -> Result<Option<Permission>, StoreError>;

    /// Active permission by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn permission_by_name(&self, name: &str) -> Result<Option<Permission>, StoreError>;

    /// All active permissions, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn permissions(&self) -> Result<Vec<Permission>, StoreError>;

    /// Marks a permission deleted and removes every dependency edge and role
    /// assignment that references it, atomically.
    ///
    /// Returns `false` if no active permission had `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails; nothing is changed in that case.
    fn soft_delete_permission(
        &self,
        id: PermissionId,
        deleted_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

/// Dependency edges (`permission_dependencies`).
pub trait EdgeStore: Send + Sync {
    /// Every stored edge in insertion order, including edges that violate
    /// the graph invariants (for integrity audits).
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn edges(&self) -> Result<Vec<DependencyEdge>, StoreError>;

    /// Inserts `edge` if `check` accepts the current graph.
    ///
    /// Within one write transaction the store verifies that both endpoints
    /// are active permissions, loads every edge into a [`DependencyGraph`],
    /// invokes `check`, and inserts. No other writer can interleave.
    ///
    /// # Errors
    ///
    /// - [`GraphError::PermissionNotFound`] if either endpoint is missing
    /// - whatever `check` returns
    /// - [`GraphError::Store`] on storage failure
    fn insert_edge_checked(
        &self,
        edge: DependencyEdge,
        check: &dyn Fn(&DependencyGraph) -> Result<(), GraphError>,
    ) -> Result<(), GraphError>;

    /// Deletes an edge. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn delete_edge(&self, edge: DependencyEdge) -> Result<bool, StoreError>;
}

/// Roles, their parent links, and their permission assignments.
pub trait RoleStore: Send + Sync {
    /// Inserts a role without a parent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the name is taken.
    fn insert_role(&self, name: &str) -> Result<Role, StoreError>;

    /// Role by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn role(&self, id: RoleId) -> Result<Option<Role>, StoreError>;

    /// Role by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn role_by_name(&self, name: &str) -> Result<Option<Role>, StoreError>;

    /// All roles, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn roles(&self) -> Result<Vec<Role>, StoreError>;

    /// Sets (or clears) a role's parent if `check` accepts the current role
    /// set, atomically.
    ///
    /// # Errors
    ///
    /// - [`RoleError::NotFound`] if the role or parent is missing
    /// - whatever `check` returns
    /// - [`RoleError::Store`] on storage failure
    fn set_parent_checked(
        &self,
        role: RoleId,
        parent: Option<RoleId>,
        check: &dyn Fn(&[Role]) -> Result<(), RoleError>,
    ) -> Result<(), RoleError>;

    /// Grants a permission to a role. Returns `false` if already granted.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn assign_permission(&self, role: RoleId, permission: PermissionId)
    -> Result<bool, StoreError>;

    /// Revokes a permission from a role. Returns `false` if it was not
    /// granted.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn revoke_permission(&self, role: RoleId, permission: PermissionId)
    -> Result<bool, StoreError>;

    /// Roles that directly hold `permission`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn roles_with_permission(&self, permission: PermissionId) -> Result<Vec<RoleId>, StoreError>;
}

/// Activity (audit) rows.
///
/// The store is deliberately dumb: immutability and deletion protection are
/// enforced by [`AuditGuard`](crate::audit::AuditGuard), which is the only
/// write path.
pub trait ActivityStore: Send + Sync {
    /// Inserts an activity and returns its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn insert_activity(&self, activity: &Activity) -> Result<ActivityId, StoreError>;

    /// Activity by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn activity(&self, id: ActivityId) -> Result<Option<Activity>, StoreError>;

    /// All activities, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn activities(&self) -> Result<Vec<Activity>, StoreError>;

    /// Overwrites the stored row for `activity.id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if `activity.id` is unset, or an error
    /// if the write fails.
    fn replace_activity(&self, activity: &Activity) -> Result<(), StoreError>;

    /// Deletes an activity. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn delete_activity(&self, id: ActivityId) -> Result<bool, StoreError>;
}

/// Append-only configuration change log.
///
/// There is intentionally no update or delete method.
pub trait SettingChangeStore: Send + Sync {
    /// Appends a change and returns the stored row.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn append_setting_change(&self, change: &NewSettingChange)
    -> Result<SettingChange, StoreError>;

    /// Changes for `key` (or every key), oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn setting_changes(&self, key: Option<&str>) -> Result<Vec<SettingChange>, StoreError>;
}

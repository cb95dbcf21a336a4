//! `SQLite` store.
//!
//! Reads go through the shared connection. Every check-then-write sequence
//! runs inside a `BEGIN IMMEDIATE` transaction, which takes the database
//! write lock up front: a second process opening the same file blocks (up
//! to the busy timeout) instead of interleaving its own check.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{
    Connection, ErrorCode, OpenFlags, OptionalExtension, Row, TransactionBehavior, params,
};

use super::{
    ActivityStore, EdgeStore, PermissionStore, RoleStore, SettingChangeStore, StoreError,
};
use crate::audit::{Activity, ActivityId};
use crate::clock::{format_timestamp, parse_timestamp};
use crate::graph::{DependencyEdge, DependencyGraph, GraphError};
use crate::permission::{NewPermission, Permission, PermissionId};
use crate::role::{Role, RoleError, RoleId};
use crate::settings::{NewSettingChange, SettingChange};

/// Schema SQL embedded at compile time. Includes the connection pragmas.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// How long a writer waits for another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ACTIVITY_COLUMNS: &str = "id, type, description, module, causer_type, user_id, \
     subject_type, subject_id, properties, ip_address, user_agent, result, risk_level, \
     signature, created_at";

/// A store backed by a `SQLite` database file (or an in-memory database).
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens or creates a database at `path` and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates a store over a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Database file path, or `None` for an in-memory store.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn initialize_connection(conn: &Connection) -> Result<(), StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned {
            context: "sqlite connection".to_string(),
        })
    }

    /// Inserts an edge row without endpoint or cycle checks.
    ///
    /// Only the schema constraints apply (no self-loop, no duplicate). Used
    /// to simulate rows written around the engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn insert_edge_unchecked(&self, edge: DependencyEdge) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO permission_dependencies (permission_id, depends_on_permission_id)
             VALUES (?1, ?2)",
            params![edge.permission.0, edge.depends_on.0],
        )
        .map_err(|e| conflict(e, || format!("edge {edge} already exists")))?;
        Ok(())
    }
}

// =============================================================================
// Row helpers
// =============================================================================

fn conflict(err: rusqlite::Error, details: impl FnOnce() -> String) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            StoreError::Conflict { details: details() }
        },
        other => StoreError::Database(other),
    }
}

fn get_u64(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(idx)?;
    u64::try_from(raw).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, raw))
}

fn get_opt_u64(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<u64>> {
    let raw: Option<i64> = row.get(idx)?;
    raw.map(|raw| {
        u64::try_from(raw).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, raw))
    })
    .transpose()
}

fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    parse_timestamp(raw).map_err(|e| StoreError::Corrupt {
        details: format!("invalid timestamp '{raw}': {e}"),
    })
}

fn permission_from_row(row: &Row<'_>) -> rusqlite::Result<Permission> {
    Ok(Permission {
        id: PermissionId(get_u64(row, 0)?),
        name: row.get(1)?,
        module: row.get(2)?,
        display_name: row.get(3)?,
    })
}

fn load_permission(conn: &Connection, id: PermissionId) -> Result<Option<Permission>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT id, name, module, display_name FROM permissions
             WHERE id = ?1 AND deleted_at IS NULL",
            params![id.0],
            permission_from_row,
        )
        .optional()?)
}

fn load_edges(conn: &Connection) -> Result<Vec<DependencyEdge>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT permission_id, depends_on_permission_id FROM permission_dependencies
         ORDER BY id ASC",
    )?;
    let edges = stmt
        .query_map([], |row| {
            Ok(DependencyEdge::new(
                PermissionId(get_u64(row, 0)?),
                PermissionId(get_u64(row, 1)?),
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(edges)
}

fn load_roles(conn: &Connection) -> Result<Vec<Role>, StoreError> {
    let mut roles: BTreeMap<RoleId, Role> = {
        let mut stmt = conn.prepare("SELECT id, name, parent_id FROM roles ORDER BY id ASC")?;
        stmt.query_map([], |row| {
            Ok(Role {
                id: RoleId(get_u64(row, 0)?),
                name: row.get(1)?,
                parent: get_opt_u64(row, 2)?.map(RoleId),
                permissions: BTreeSet::new(),
            })
        })?
        .map(|role| role.map(|r| (r.id, r)))
        .collect::<Result<_, _>>()?
    };

    let mut stmt = conn.prepare("SELECT role_id, permission_id FROM role_permissions")?;
    let grants = stmt
        .query_map([], |row| {
            Ok((RoleId(get_u64(row, 0)?), PermissionId(get_u64(row, 1)?)))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (role, permission) in grants {
        if let Some(role) = roles.get_mut(&role) {
            role.permissions.insert(permission);
        }
    }
    Ok(roles.into_values().collect())
}

fn role_exists(conn: &Connection, id: RoleId) -> Result<bool, StoreError> {
    Ok(conn
        .query_row("SELECT 1 FROM roles WHERE id = ?1", params![id.0], |_| Ok(()))
        .optional()?
        .is_some())
}

/// Activity columns as stored, before domain decoding.
struct ActivityRow {
    id: u64,
    activity_type: String,
    description: String,
    module: Option<String>,
    causer_type: Option<String>,
    causer_id: Option<u64>,
    subject_type: Option<String>,
    subject_id: Option<u64>,
    properties: String,
    ip_address: Option<String>,
    user_agent: Option<String>,
    result: String,
    risk_level: u8,
    signature: Option<String>,
    created_at: String,
}

impl ActivityRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: get_u64(row, 0)?,
            activity_type: row.get(1)?,
            description: row.get(2)?,
            module: row.get(3)?,
            causer_type: row.get(4)?,
            causer_id: get_opt_u64(row, 5)?,
            subject_type: row.get(6)?,
            subject_id: get_opt_u64(row, 7)?,
            properties: row.get(8)?,
            ip_address: row.get(9)?,
            user_agent: row.get(10)?,
            result: row.get(11)?,
            risk_level: row.get(12)?,
            signature: row.get(13)?,
            created_at: row.get(14)?,
        })
    }

    fn decode(self) -> Result<Activity, StoreError> {
        let result = self.result.parse().map_err(|reason| StoreError::Corrupt {
            details: format!("activity {}: {reason}", self.id),
        })?;
        Ok(Activity {
            id: Some(ActivityId(self.id)),
            activity_type: self.activity_type,
            description: self.description,
            module: self.module,
            causer_type: self.causer_type,
            causer_id: self.causer_id,
            subject_type: self.subject_type,
            subject_id: self.subject_id,
            properties: serde_json::from_str(&self.properties)?,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            result,
            risk_level: self.risk_level,
            signature: self.signature,
            created_at: decode_timestamp(&self.created_at)?,
        })
    }
}

/// Setting change columns as stored.
struct SettingChangeRow {
    id: u64,
    key: String,
    old_value: Option<String>,
    new_value: Option<String>,
    changed_by: Option<u64>,
    reason: Option<String>,
    created_at: String,
}

impl SettingChangeRow {
    fn decode(self) -> Result<SettingChange, StoreError> {
        Ok(SettingChange {
            id: self.id,
            key: self.key,
            old_value: self
                .old_value
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            new_value: self
                .new_value
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            changed_by: self.changed_by,
            reason: self.reason,
            created_at: decode_timestamp(&self.created_at)?,
        })
    }
}

// =============================================================================
// Trait implementations
// =============================================================================

impl PermissionStore for SqliteStore {
    fn insert_permission(&self, draft: &NewPermission) -> Result<Permission, StoreError> {
        let conn = self.lock()?;
        let display_name = draft.display_name_or_name();
        conn.execute(
            "INSERT INTO permissions (name, module, display_name) VALUES (?1, ?2, ?3)",
            params![draft.name, draft.module, display_name],
        )
        .map_err(|e| conflict(e, || format!("permission name '{}' already used", draft.name)))?;

        let id = u64::try_from(conn.last_insert_rowid()).map_err(|_| StoreError::Corrupt {
            details: "negative permission rowid".to_string(),
        })?;
        Ok(Permission {
            id: PermissionId(id),
            name: draft.name.clone(),
            module: draft.module.clone(),
            display_name: display_name.to_string(),
        })
    }

    fn permission(&self, id: PermissionId) -> Result<Option<Permission>, StoreError> {
        let conn = self.lock()?;
        load_permission(&conn, id)
    }

    fn permission_by_name(&self, name: &str) -> Result<Option<Permission>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT id, name, module, display_name FROM permissions
                 WHERE name = ?1 AND deleted_at IS NULL",
                params![name],
                permission_from_row,
            )
            .optional()?)
    }

    fn permissions(&self) -> Result<Vec<Permission>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, module, display_name FROM permissions
             WHERE deleted_at IS NULL ORDER BY id ASC",
        )?;
        let permissions = stmt
            .query_map([], permission_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(permissions)
    }

    fn soft_delete_permission(
        &self,
        id: PermissionId,
        deleted_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = tx.execute(
            "UPDATE permissions SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            params![format_timestamp(&deleted_at), id.0],
        )?;
        if updated == 0 {
            return Ok(false);
        }
        tx.execute(
            "DELETE FROM permission_dependencies
             WHERE permission_id = ?1 OR depends_on_permission_id = ?1",
            params![id.0],
        )?;
        tx.execute(
            "DELETE FROM role_permissions WHERE permission_id = ?1",
            params![id.0],
        )?;
        tx.commit()?;
        Ok(true)
    }
}

impl EdgeStore for SqliteStore {
    fn edges(&self) -> Result<Vec<DependencyEdge>, StoreError> {
        let conn = self.lock()?;
        load_edges(&conn)
    }

    fn insert_edge_checked(
        &self,
        edge: DependencyEdge,
        check: &dyn Fn(&DependencyGraph) -> Result<(), GraphError>,
    ) -> Result<(), GraphError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;

        for id in [edge.permission, edge.depends_on] {
            if load_permission(&tx, id)?.is_none() {
                return Err(GraphError::PermissionNotFound { id });
            }
        }
        let graph = DependencyGraph::from_edges(load_edges(&tx)?);
        check(&graph)?;

        tx.execute(
            "INSERT INTO permission_dependencies (permission_id, depends_on_permission_id)
             VALUES (?1, ?2)",
            params![edge.permission.0, edge.depends_on.0],
        )
        .map_err(|e| conflict(e, || format!("edge {edge} already exists")))?;
        tx.commit().map_err(StoreError::from)?;
        Ok(())
    }

    fn delete_edge(&self, edge: DependencyEdge) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM permission_dependencies
             WHERE permission_id = ?1 AND depends_on_permission_id = ?2",
            params![edge.permission.0, edge.depends_on.0],
        )?;
        Ok(deleted > 0)
    }
}

impl RoleStore for SqliteStore {
    fn insert_role(&self, name: &str) -> Result<Role, StoreError> {
        let conn = self.lock()?;
        conn.execute("INSERT INTO roles (name) VALUES (?1)", params![name])
            .map_err(|e| conflict(e, || format!("role name '{name}' already used")))?;
        let id = u64::try_from(conn.last_insert_rowid()).map_err(|_| StoreError::Corrupt {
            details: "negative role rowid".to_string(),
        })?;
        Ok(Role {
            id: RoleId(id),
            name: name.to_string(),
            parent: None,
            permissions: BTreeSet::new(),
        })
    }

    fn role(&self, id: RoleId) -> Result<Option<Role>, StoreError> {
        let conn = self.lock()?;
        Ok(load_roles(&conn)?.into_iter().find(|r| r.id == id))
    }

    fn role_by_name(&self, name: &str) -> Result<Option<Role>, StoreError> {
        let conn = self.lock()?;
        Ok(load_roles(&conn)?.into_iter().find(|r| r.name == name))
    }

    fn roles(&self) -> Result<Vec<Role>, StoreError> {
        let conn = self.lock()?;
        load_roles(&conn)
    }

    fn set_parent_checked(
        &self,
        role: RoleId,
        parent: Option<RoleId>,
        check: &dyn Fn(&[Role]) -> Result<(), RoleError>,
    ) -> Result<(), RoleError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;

        for id in std::iter::once(role).chain(parent) {
            if !role_exists(&tx, id)? {
                return Err(RoleError::NotFound { id });
            }
        }
        let snapshot = load_roles(&tx)?;
        check(&snapshot)?;

        tx.execute(
            "UPDATE roles SET parent_id = ?1 WHERE id = ?2",
            params![parent.map(|p| p.0), role.0],
        )
        .map_err(StoreError::from)?;
        tx.commit().map_err(StoreError::from)?;
        Ok(())
    }

    fn assign_permission(
        &self,
        role: RoleId,
        permission: PermissionId,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO role_permissions (role_id, permission_id) VALUES (?1, ?2)",
            params![role.0, permission.0],
        )?;
        Ok(inserted > 0)
    }

    fn revoke_permission(
        &self,
        role: RoleId,
        permission: PermissionId,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM role_permissions WHERE role_id = ?1 AND permission_id = ?2",
            params![role.0, permission.0],
        )?;
        Ok(deleted > 0)
    }

    fn roles_with_permission(&self, permission: PermissionId) -> Result<Vec<RoleId>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT role_id FROM role_permissions WHERE permission_id = ?1 ORDER BY role_id ASC",
        )?;
        let roles = stmt
            .query_map(params![permission.0], |row| Ok(RoleId(get_u64(row, 0)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(roles)
    }
}

impl ActivityStore for SqliteStore {
    fn insert_activity(&self, activity: &Activity) -> Result<ActivityId, StoreError> {
        let properties = serde_json::to_string(&activity.properties)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO activities (type, description, module, causer_type, user_id,
                 subject_type, subject_id, properties, ip_address, user_agent, result,
                 risk_level, signature, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                activity.activity_type,
                activity.description,
                activity.module,
                activity.causer_type,
                activity.causer_id,
                activity.subject_type,
                activity.subject_id,
                properties,
                activity.ip_address,
                activity.user_agent,
                activity.result.as_str(),
                activity.risk_level,
                activity.signature,
                format_timestamp(&activity.created_at),
            ],
        )?;
        let id = u64::try_from(conn.last_insert_rowid()).map_err(|_| StoreError::Corrupt {
            details: "negative activity rowid".to_string(),
        })?;
        Ok(ActivityId(id))
    }

    fn activity(&self, id: ActivityId) -> Result<Option<Activity>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {ACTIVITY_COLUMNS} FROM activities WHERE id = ?1"),
                params![id.0],
                ActivityRow::read,
            )
            .optional()?;
        row.map(ActivityRow::decode).transpose()
    }

    fn activities(&self) -> Result<Vec<Activity>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {ACTIVITY_COLUMNS} FROM activities ORDER BY id ASC"))?;
        let rows = stmt
            .query_map([], ActivityRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(ActivityRow::decode).collect()
    }

    fn replace_activity(&self, activity: &Activity) -> Result<(), StoreError> {
        let Some(id) = activity.id else {
            return Err(StoreError::Corrupt {
                details: "cannot replace an activity without an id".to_string(),
            });
        };
        let properties = serde_json::to_string(&activity.properties)?;
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE activities SET type = ?1, description = ?2, module = ?3, causer_type = ?4,
                 user_id = ?5, subject_type = ?6, subject_id = ?7, properties = ?8,
                 ip_address = ?9, user_agent = ?10, result = ?11, risk_level = ?12,
                 signature = ?13, created_at = ?14
             WHERE id = ?15",
            params![
                activity.activity_type,
                activity.description,
                activity.module,
                activity.causer_type,
                activity.causer_id,
                activity.subject_type,
                activity.subject_id,
                properties,
                activity.ip_address,
                activity.user_agent,
                activity.result.as_str(),
                activity.risk_level,
                activity.signature,
                format_timestamp(&activity.created_at),
                id.0,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::Corrupt {
                details: format!("activity {id} does not exist"),
            });
        }
        Ok(())
    }

    fn delete_activity(&self, id: ActivityId) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM activities WHERE id = ?1", params![id.0])?;
        Ok(deleted > 0)
    }
}

impl SettingChangeStore for SqliteStore {
    fn append_setting_change(
        &self,
        change: &NewSettingChange,
    ) -> Result<SettingChange, StoreError> {
        let old_value = change
            .old_value
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let new_value = change
            .new_value
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO setting_changes (key, old_value, new_value, changed_by, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                change.key,
                old_value,
                new_value,
                change.changed_by,
                change.reason,
                format_timestamp(&change.created_at),
            ],
        )?;
        let id = u64::try_from(conn.last_insert_rowid()).map_err(|_| StoreError::Corrupt {
            details: "negative setting change rowid".to_string(),
        })?;

        Ok(SettingChange {
            id,
            key: change.key.clone(),
            old_value: change.old_value.clone(),
            new_value: change.new_value.clone(),
            changed_by: change.changed_by,
            reason: change.reason.clone(),
            created_at: change.created_at,
        })
    }

    fn setting_changes(&self, key: Option<&str>) -> Result<Vec<SettingChange>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, key, old_value, new_value, changed_by, reason, created_at
             FROM setting_changes
             WHERE ?1 IS NULL OR key = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![key], |row| {
                Ok(SettingChangeRow {
                    id: get_u64(row, 0)?,
                    key: row.get(1)?,
                    old_value: row.get(2)?,
                    new_value: row.get(3)?,
                    changed_by: get_opt_u64(row, 4)?,
                    reason: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(SettingChangeRow::decode).collect()
    }
}

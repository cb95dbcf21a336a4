//! Permission identities.
//!
//! A [`Permission`] is the node type of the dependency graph. Names follow the
//! `module.action` convention (`users.edit`, `dashboard.view`) and are globally
//! unique, including across soft-deleted rows.
//!
//! The [`PermissionCatalog`] owns the create/delete lifecycle. Deleting a
//! permission cascades to every dependency edge and role assignment that
//! references it.

mod catalog;

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

pub use catalog::PermissionCatalog;

/// Maximum length of a permission name.
pub const MAX_PERMISSION_NAME_LEN: usize = 128;

static PERMISSION_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9_-]*(\.[a-z0-9][a-z0-9_-]*)+$")
        .expect("invalid permission name pattern")
});

/// Stable identifier of a permission.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PermissionId(pub u64);

impl fmt::Display for PermissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PermissionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A permission as stored in the catalog.
///
/// Ordering is by `id` first, so sets of permissions iterate in creation
/// order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Permission {
    /// Catalog identifier.
    pub id: PermissionId,
    /// Unique `module.action` name.
    pub name: String,
    /// Owning module (`users`, `roles`, ...).
    pub module: String,
    /// Human-readable label.
    pub display_name: String,
}

/// Input for [`PermissionCatalog::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPermission {
    /// Unique `module.action` name.
    pub name: String,
    /// Owning module.
    pub module: String,
    /// Human-readable label. Defaults to `name` when absent.
    pub display_name: Option<String>,
}

impl NewPermission {
    /// Creates a permission draft; the module is the part of `name` before
    /// the first dot.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let module = name.split('.').next().unwrap_or_default().to_string();
        Self {
            name,
            module,
            display_name: None,
        }
    }

    /// Overrides the module.
    #[must_use]
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    /// Display name, falling back to the permission name.
    #[must_use]
    pub fn display_name_or_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

/// Errors from permission catalog operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PermissionError {
    /// A permission with this name already exists (possibly soft-deleted).
    #[error("permission name already taken: {name}")]
    DuplicateName {
        /// The conflicting name.
        name: String,
    },

    /// The name does not follow the `module.action` convention.
    #[error("invalid permission name '{name}': {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// No active permission has this identifier.
    #[error("permission not found: {id}")]
    NotFound {
        /// The missing identifier.
        id: PermissionId,
    },

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validates a permission name against the `module.action` convention.
///
/// # Errors
///
/// Returns [`PermissionError::InvalidName`] for empty, over-long, or
/// malformed names.
pub fn validate_permission_name(name: &str) -> Result<(), PermissionError> {
    let invalid = |reason: &str| PermissionError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_PERMISSION_NAME_LEN {
        return Err(invalid("name exceeds 128 bytes"));
    }
    if !PERMISSION_NAME.is_match(name) {
        return Err(invalid(
            "expected lowercase 'module.action' segments separated by dots",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_conventional_names() {
        for name in [
            "users.view",
            "users.assign_roles",
            "roles.manage_permissions",
            "reports.export-csv",
            "settings.mail.edit",
        ] {
            validate_permission_name(name).unwrap_or_else(|e| panic!("{name}: {e}"));
        }
    }

    #[test]
    fn rejects_malformed_names() {
        for name in ["", "users", "Users.View", ".view", "users.", "users..view", "users view"] {
            assert!(
                matches!(
                    validate_permission_name(name),
                    Err(PermissionError::InvalidName { .. })
                ),
                "accepted {name:?}"
            );
        }
    }

    #[test]
    fn rejects_overlong_names() {
        let name = format!("users.{}", "a".repeat(MAX_PERMISSION_NAME_LEN));
        assert!(validate_permission_name(&name).is_err());
    }

    #[test]
    fn new_permission_derives_module() {
        let draft = NewPermission::new("users.edit");
        assert_eq!(draft.module, "users");
        assert_eq!(draft.display_name_or_name(), "users.edit");

        let draft = draft.with_module("accounts").with_display_name("Edit users");
        assert_eq!(draft.module, "accounts");
        assert_eq!(draft.display_name_or_name(), "Edit users");
    }

    #[test]
    fn permissions_order_by_id() {
        let a = Permission {
            id: PermissionId(2),
            name: "a.a".into(),
            module: "a".into(),
            display_name: "a".into(),
        };
        let b = Permission {
            id: PermissionId(1),
            name: "z.z".into(),
            module: "z".into(),
            display_name: "z".into(),
        };
        assert!(b < a);
    }
}

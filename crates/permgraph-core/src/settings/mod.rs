//! Append-only configuration change log.
//!
//! Every change to an application setting is recorded with who made it and
//! why. Entries are never updated or deleted: the store trait has no method
//! for it, and the `SQLite` schema rejects both with triggers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::clock::{Clock, SystemClock, to_record_precision};
use crate::store::{SettingChangeStore, StoreError};

/// Maximum length of a setting key.
pub const MAX_SETTING_KEY_LEN: usize = 191;

/// A recorded setting change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingChange {
    /// Sequence id, increasing with time.
    pub id: u64,
    /// Setting key, e.g. `mail.from_address`.
    pub key: String,
    /// Value before the change (`None` when first set).
    pub old_value: Option<Value>,
    /// Value after the change (`None` when removed).
    pub new_value: Option<Value>,
    /// User who made the change.
    pub changed_by: Option<u64>,
    /// Free-text justification.
    pub reason: Option<String>,
    /// When the change was recorded.
    pub created_at: DateTime<Utc>,
}

/// A change to append.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSettingChange {
    /// Setting key.
    pub key: String,
    /// Previous value.
    pub old_value: Option<Value>,
    /// New value.
    pub new_value: Option<Value>,
    /// Actor.
    pub changed_by: Option<u64>,
    /// Justification.
    pub reason: Option<String>,
    /// Timestamp at record precision.
    pub created_at: DateTime<Utc>,
}

/// Errors from the settings log.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SettingsError {
    /// The key is empty or too long.
    #[error("invalid setting key '{key}': {reason}")]
    InvalidKey {
        /// The rejected key.
        key: String,
        /// Why.
        reason: String,
    },

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Records and queries setting changes.
#[derive(Debug)]
pub struct SettingChangeLog<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: SettingChangeStore> SettingChangeLog<S> {
    /// Creates a log over `store`.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Appends a change.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::InvalidKey`] for an empty or oversized key.
    pub fn record(
        &self,
        key: &str,
        old_value: Option<Value>,
        new_value: Option<Value>,
        changed_by: Option<u64>,
        reason: Option<&str>,
    ) -> Result<SettingChange, SettingsError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(SettingsError::InvalidKey {
                key: key.to_string(),
                reason: "key must not be empty".to_string(),
            });
        }
        if key.len() > MAX_SETTING_KEY_LEN {
            return Err(SettingsError::InvalidKey {
                key: key.to_string(),
                reason: format!("key exceeds {MAX_SETTING_KEY_LEN} characters"),
            });
        }

        let change = self.store.append_setting_change(&NewSettingChange {
            key: key.to_string(),
            old_value,
            new_value,
            changed_by,
            reason: reason.map(ToString::to_string),
            created_at: to_record_precision(self.clock.now()),
        })?;
        info!(
            setting = %change.key,
            change_id = change.id,
            changed_by = change.changed_by,
            "Setting change recorded"
        );
        Ok(change)
    }

    /// Changes to `key`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn history(&self, key: &str) -> Result<Vec<SettingChange>, SettingsError> {
        Ok(self.store.setting_changes(Some(key))?)
    }

    /// Most recent change to `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn latest(&self, key: &str) -> Result<Option<SettingChange>, SettingsError> {
        Ok(self.history(key)?.pop())
    }

    /// Every change, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn all(&self) -> Result<Vec<SettingChange>, SettingsError> {
        Ok(self.store.setting_changes(None)?)
    }
}

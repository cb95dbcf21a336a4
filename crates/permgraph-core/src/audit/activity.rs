//! Activity records, drafts, and patches.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::CanonicalFields;

/// Activity identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityId(pub u64);

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of the audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityResult {
    /// The action succeeded.
    #[default]
    Success,
    /// The action was refused or failed validation.
    Failed,
    /// The action succeeded with a caveat.
    Warning,
    /// The action errored.
    Error,
}

impl ActivityResult {
    /// Stored and signed representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    /// Returns `true` for `failed` and `error`.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Error)
    }
}

impl fmt::Display for ActivityResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown activity result: {other}")),
        }
    }
}

/// Activity types that are never deletable.
pub const SENSITIVE_ACTIVITY_TYPES: [&str; 6] = [
    "login_failed",
    "permission_escalation",
    "sensitive_data_access",
    "system_config_change",
    "security_incident",
    "unauthorized_access",
];

/// Returns `true` if `activity_type` is a security-sensitive type.
#[must_use]
pub fn is_sensitive_type(activity_type: &str) -> bool {
    SENSITIVE_ACTIVITY_TYPES.contains(&activity_type)
}

/// A column of an activity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityField {
    /// `type`
    Type,
    /// `description`
    Description,
    /// `module`
    Module,
    /// `causer_type`
    CauserType,
    /// `user_id`: the causer id.
    UserId,
    /// `subject_type`
    SubjectType,
    /// `subject_id`
    SubjectId,
    /// `properties`
    Properties,
    /// `ip_address`
    IpAddress,
    /// `user_agent`
    UserAgent,
    /// `result`
    Result,
    /// `risk_level`
    RiskLevel,
    /// `signature`
    Signature,
    /// `created_at`
    CreatedAt,
}

/// Fields that may never change once a record is persisted.
pub const PROTECTED_FIELDS: [ActivityField; 6] = [
    ActivityField::Type,
    ActivityField::Description,
    ActivityField::UserId,
    ActivityField::SubjectId,
    ActivityField::CreatedAt,
    ActivityField::Signature,
];

impl ActivityField {
    /// Column name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Type => "type",
            Self::Description => "description",
            Self::Module => "module",
            Self::CauserType => "causer_type",
            Self::UserId => "user_id",
            Self::SubjectType => "subject_type",
            Self::SubjectId => "subject_id",
            Self::Properties => "properties",
            Self::IpAddress => "ip_address",
            Self::UserAgent => "user_agent",
            Self::Result => "result",
            Self::RiskLevel => "risk_level",
            Self::Signature => "signature",
            Self::CreatedAt => "created_at",
        }
    }

    /// Returns `true` for members of [`PROTECTED_FIELDS`].
    #[must_use]
    pub fn is_protected(self) -> bool {
        PROTECTED_FIELDS.contains(&self)
    }
}

impl fmt::Display for ActivityField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted (or about to be persisted) audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    /// Assigned by the store on insert.
    pub id: Option<ActivityId>,
    /// Activity type, e.g. `role_assigned`.
    #[serde(rename = "type")]
    pub activity_type: String,
    /// Human-readable summary (sanitized).
    pub description: String,
    /// Feature area that produced the record.
    pub module: Option<String>,
    /// Kind of actor, e.g. `user`.
    pub causer_type: Option<String>,
    /// Actor id, stored in the `user_id` column.
    pub causer_id: Option<u64>,
    /// Kind of affected entity.
    pub subject_type: Option<String>,
    /// Affected entity id.
    pub subject_id: Option<u64>,
    /// Structured payload (sanitized).
    pub properties: BTreeMap<String, Value>,
    /// Client address.
    pub ip_address: Option<String>,
    /// Client user agent.
    pub user_agent: Option<String>,
    /// Outcome.
    pub result: ActivityResult,
    /// Risk score 1..=10.
    pub risk_level: u8,
    /// `v1:<hex>` integrity signature; `None` only for records persisted in
    /// degraded mode.
    pub signature: Option<String>,
    /// Creation time at microsecond precision.
    pub created_at: DateTime<Utc>,
}

impl Activity {
    /// The signed subset of this record.
    #[must_use]
    pub fn canonical_fields(&self) -> CanonicalFields<'_> {
        CanonicalFields {
            activity_type: &self.activity_type,
            description: &self.description,
            subject_type: self.subject_type.as_deref(),
            subject_id: self.subject_id,
            causer_type: self.causer_type.as_deref(),
            causer_id: self.causer_id,
            properties: &self.properties,
            ip_address: self.ip_address.as_deref(),
            user_agent: self.user_agent.as_deref(),
            result: self.result.as_str(),
            risk_level: self.risk_level,
            created_at: CanonicalFields::timestamp(self.created_at),
        }
    }

    /// Returns `true` if the type is security-sensitive.
    #[must_use]
    pub fn is_sensitive(&self) -> bool {
        is_sensitive_type(&self.activity_type)
    }
}

/// Input for [`AuditGuard::create`](super::AuditGuard::create).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewActivity {
    /// Activity type.
    pub activity_type: String,
    /// Summary; sanitized before storage.
    pub description: String,
    /// Feature area.
    pub module: Option<String>,
    /// Kind of actor.
    pub causer_type: Option<String>,
    /// Actor id.
    pub causer_id: Option<u64>,
    /// Kind of affected entity.
    pub subject_type: Option<String>,
    /// Affected entity id.
    pub subject_id: Option<u64>,
    /// Payload; sanitized before storage.
    pub properties: BTreeMap<String, Value>,
    /// Client address.
    pub ip_address: Option<String>,
    /// Client user agent.
    pub user_agent: Option<String>,
    /// Outcome.
    pub result: ActivityResult,
    /// Explicit risk score; computed when `None`.
    pub risk_level: Option<u8>,
    /// Explicit creation time; the guard's clock when `None`.
    pub created_at: Option<DateTime<Utc>>,
}

impl NewActivity {
    /// Starts a draft.
    #[must_use]
    pub fn new(activity_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            activity_type: activity_type.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    /// Sets the feature area.
    #[must_use]
    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    /// Sets the actor.
    #[must_use]
    pub fn causer(mut self, causer_type: impl Into<String>, causer_id: u64) -> Self {
        self.causer_type = Some(causer_type.into());
        self.causer_id = Some(causer_id);
        self
    }

    /// Sets the affected entity.
    #[must_use]
    pub fn subject(mut self, subject_type: impl Into<String>, subject_id: u64) -> Self {
        self.subject_type = Some(subject_type.into());
        self.subject_id = Some(subject_id);
        self
    }

    /// Adds one payload entry.
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Sets the client address and user agent.
    #[must_use]
    pub fn client(mut self, ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Sets the outcome.
    #[must_use]
    pub const fn result(mut self, result: ActivityResult) -> Self {
        self.result = result;
        self
    }

    /// Pins the risk score instead of computing it.
    #[must_use]
    pub const fn risk_level(mut self, risk_level: u8) -> Self {
        self.risk_level = Some(risk_level);
        self
    }

    /// Pins the creation time.
    #[must_use]
    pub const fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }
}

/// A requested change to a persisted activity.
///
/// `None` leaves a field untouched; for nullable columns `Some(None)` clears
/// it.
#[derive(Debug, Clone, Default, PartialEq)]
#[allow(clippy::option_option)]
pub struct ActivityPatch {
    /// New type.
    pub activity_type: Option<String>,
    /// New description.
    pub description: Option<String>,
    /// New module.
    pub module: Option<Option<String>>,
    /// New causer kind.
    pub causer_type: Option<Option<String>>,
    /// New causer id (`user_id`).
    pub causer_id: Option<Option<u64>>,
    /// New subject kind.
    pub subject_type: Option<Option<String>>,
    /// New subject id.
    pub subject_id: Option<Option<u64>>,
    /// Replacement payload.
    pub properties: Option<BTreeMap<String, Value>>,
    /// New client address.
    pub ip_address: Option<Option<String>>,
    /// New user agent.
    pub user_agent: Option<Option<String>>,
    /// New outcome.
    pub result: Option<ActivityResult>,
    /// New risk score.
    pub risk_level: Option<u8>,
    /// New signature.
    pub signature: Option<Option<String>>,
    /// New creation time.
    pub created_at: Option<DateTime<Utc>>,
}

fn differs<T: PartialEq>(patch: Option<&T>, current: &T) -> bool {
    patch.is_some_and(|value| value != current)
}

impl ActivityPatch {
    /// Fields whose requested value differs from `current`.
    #[must_use]
    pub fn changed_fields(&self, current: &Activity) -> BTreeSet<ActivityField> {
        let checks = [
            (ActivityField::Type, differs(self.activity_type.as_ref(), &current.activity_type)),
            (ActivityField::Description, differs(self.description.as_ref(), &current.description)),
            (ActivityField::Module, differs(self.module.as_ref(), &current.module)),
            (ActivityField::CauserType, differs(self.causer_type.as_ref(), &current.causer_type)),
            (ActivityField::UserId, differs(self.causer_id.as_ref(), &current.causer_id)),
            (ActivityField::SubjectType, differs(self.subject_type.as_ref(), &current.subject_type)),
            (ActivityField::SubjectId, differs(self.subject_id.as_ref(), &current.subject_id)),
            (ActivityField::Properties, differs(self.properties.as_ref(), &current.properties)),
            (ActivityField::IpAddress, differs(self.ip_address.as_ref(), &current.ip_address)),
            (ActivityField::UserAgent, differs(self.user_agent.as_ref(), &current.user_agent)),
            (ActivityField::Result, differs(self.result.as_ref(), &current.result)),
            (ActivityField::RiskLevel, differs(self.risk_level.as_ref(), &current.risk_level)),
            (ActivityField::Signature, differs(self.signature.as_ref(), &current.signature)),
            (ActivityField::CreatedAt, differs(self.created_at.as_ref(), &current.created_at)),
        ];
        checks
            .into_iter()
            .filter_map(|(field, changed)| changed.then_some(field))
            .collect()
    }

    /// Writes every requested value into `target`.
    pub fn apply_to(self, target: &mut Activity) {
        if let Some(v) = self.activity_type {
            target.activity_type = v;
        }
        if let Some(v) = self.description {
            target.description = v;
        }
        if let Some(v) = self.module {
            target.module = v;
        }
        if let Some(v) = self.causer_type {
            target.causer_type = v;
        }
        if let Some(v) = self.causer_id {
            target.causer_id = v;
        }
        if let Some(v) = self.subject_type {
            target.subject_type = v;
        }
        if let Some(v) = self.subject_id {
            target.subject_id = v;
        }
        if let Some(v) = self.properties {
            target.properties = v;
        }
        if let Some(v) = self.ip_address {
            target.ip_address = v;
        }
        if let Some(v) = self.user_agent {
            target.user_agent = v;
        }
        if let Some(v) = self.result {
            target.result = v;
        }
        if let Some(v) = self.risk_level {
            target.risk_level = v;
        }
        if let Some(v) = self.signature {
            target.signature = v;
        }
        if let Some(v) = self.created_at {
            target.created_at = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn sample() -> Activity {
        Activity {
            id: Some(ActivityId(1)),
            activity_type: "user_updated".to_string(),
            description: "Updated".to_string(),
            module: Some("users".to_string()),
            causer_type: Some("user".to_string()),
            causer_id: Some(3),
            subject_type: Some("user".to_string()),
            subject_id: Some(9),
            properties: BTreeMap::new(),
            ip_address: None,
            user_agent: None,
            result: ActivityResult::Success,
            risk_level: 2,
            signature: Some("v1:00".to_string()),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn patch_with_same_values_changes_nothing() {
        let current = sample();
        let patch = ActivityPatch {
            description: Some("Updated".to_string()),
            causer_id: Some(Some(3)),
            ..ActivityPatch::default()
        };
        assert!(patch.changed_fields(&current).is_empty());
    }

    #[test]
    fn patch_reports_changed_columns() {
        let current = sample();
        let patch = ActivityPatch {
            causer_id: Some(None),
            properties: Some(BTreeMap::from([("k".to_string(), json!(1))])),
            ..ActivityPatch::default()
        };
        let changed = patch.changed_fields(&current);
        assert_eq!(
            changed.into_iter().collect::<Vec<_>>(),
            vec![ActivityField::UserId, ActivityField::Properties]
        );
    }

    #[test]
    fn protected_set_is_exact() {
        let protected: Vec<&str> = PROTECTED_FIELDS.iter().map(|f| f.as_str()).collect();
        assert_eq!(
            protected,
            vec!["type", "description", "user_id", "subject_id", "created_at", "signature"]
        );
        assert!(!ActivityField::Properties.is_protected());
    }

    #[test]
    fn result_parses() {
        assert_eq!("error".parse::<ActivityResult>().unwrap(), ActivityResult::Error);
        assert!("nope".parse::<ActivityResult>().is_err());
        assert!(ActivityResult::Failed.is_failure());
        assert!(!ActivityResult::Warning.is_failure());
    }
}

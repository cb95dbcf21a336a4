//! Tamper-evident activity log.
//!
//! [`AuditGuard`] is the only write path for activity records. It runs each
//! mutation through an explicit pipeline:
//!
//! - create: validate, sanitize, score, sign, persist
//! - update: diff, reject if a protected field changes, apply, re-sign,
//!   persist
//! - delete: reject unless the record is unprotected
//!
//! Rejections that matter for security are logged and reported to a
//! [`SecurityEventSink`] whether or not the caller handles the error.

mod activity;
mod event;
mod filter;
mod guard;
mod risk;


use std::fmt;

use chrono::Duration;
use serde::Serialize;
use thiserror::Error;

use crate::crypto::IntegrityError;
use crate::store::StoreError;

pub use activity::{
    Activity, ActivityField, ActivityId, ActivityPatch, ActivityResult, NewActivity,
    PROTECTED_FIELDS, SENSITIVE_ACTIVITY_TYPES, is_sensitive_type,
};
pub use event::{
    MemorySink, SecurityEvent, SecurityEventKind, SecurityEventSink, Severity, TracingSink,
};
pub use filter::{REDACTED, SensitiveDataFilter};
pub use guard::{AuditGuard, SignatureAudit, SignatureStatus};
pub use risk::{
    DenylistReputation, HIGH_RISK_THRESHOLD, IpReputation, MAX_RISK_LEVEL, MIN_RISK_LEVEL,
    RiskScorer, base_score, risk_distribution,
};

/// Minimum age before a non-sensitive, low-risk record may be deleted.
pub const DELETION_MIN_AGE_DAYS: i64 = 30;

/// Why a record may not be deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProtectionReason {
    /// The activity type is security-sensitive.
    SensitiveType {
        /// The type.
        activity_type: String,
    },
    /// The risk level is at or above [`HIGH_RISK_THRESHOLD`].
    HighRisk {
        /// The record's risk level.
        risk_level: u8,
    },
    /// The record is younger than [`DELETION_MIN_AGE_DAYS`].
    TooRecent {
        /// Whole days since creation.
        age_days: i64,
    },
}

impl ProtectionReason {
    /// Evaluates the deletion rules for a record of the given `age`.
    #[must_use]
    pub fn evaluate(activity: &Activity, age: Duration) -> Option<Self> {
        if activity.is_sensitive() {
            return Some(Self::SensitiveType {
                activity_type: activity.activity_type.clone(),
            });
        }
        if activity.risk_level >= HIGH_RISK_THRESHOLD {
            return Some(Self::HighRisk {
                risk_level: activity.risk_level,
            });
        }
        if age < Duration::days(DELETION_MIN_AGE_DAYS) {
            return Some(Self::TooRecent {
                age_days: age.num_days(),
            });
        }
        None
    }
}

impl fmt::Display for ProtectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SensitiveType { activity_type } => write!(
                f,
                "'{activity_type}' is a security-sensitive activity type and is kept permanently"
            ),
            Self::HighRisk { risk_level } => write!(
                f,
                "risk level {risk_level} is at or above {HIGH_RISK_THRESHOLD} and is kept permanently"
            ),
            Self::TooRecent { age_days } => write!(
                f,
                "record is {age_days} day(s) old; activities can be deleted after {DELETION_MIN_AGE_DAYS} days"
            ),
        }
    }
}

/// Errors from the audit guard.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuditError {
    /// An update tried to change protected fields.
    #[error("tampering detected on activity {activity_id}: protected field(s) {} cannot change", join(.fields))]
    TamperingDetected {
        /// The record.
        activity_id: ActivityId,
        /// Protected fields the update tried to change.
        fields: Vec<ActivityField>,
    },

    /// A delete was refused.
    #[error("activity {activity_id} cannot be deleted: {reason}")]
    DeletionProtected {
        /// The record.
        activity_id: ActivityId,
        /// Why.
        reason: ProtectionReason,
    },

    /// No record with this id.
    #[error("activity not found: {id}")]
    NotFound {
        /// The missing id.
        id: ActivityId,
    },

    /// The draft or patch is invalid.
    #[error("invalid activity: {reason}")]
    Validation {
        /// What is wrong.
        reason: String,
    },

    /// Signing or verification failed.
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn join(fields: &[ActivityField]) -> String {
    fields
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

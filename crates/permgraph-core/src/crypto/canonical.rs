//! Canonical byte representation of a signed activity.
//!
//! The encoding is part of the external format: RFC 8785 (JCS) over a fixed
//! object of twelve keys. Absent values are explicit `null`, `risk_level` is
//! an integer, and `created_at` is RFC 3339 UTC with microseconds and a `Z`
//! suffix. Changing any of this invalidates every stored signature.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::IntegrityError;
use crate::clock::format_timestamp;

/// The signed subset of an activity record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalFields<'a> {
    /// Activity type.
    #[serde(rename = "type")]
    pub activity_type: &'a str,
    /// Sanitized description.
    pub description: &'a str,
    /// Kind of the affected entity.
    pub subject_type: Option<&'a str>,
    /// Id of the affected entity.
    pub subject_id: Option<u64>,
    /// Kind of the actor.
    pub causer_type: Option<&'a str>,
    /// Id of the actor.
    pub causer_id: Option<u64>,
    /// Sanitized structured payload.
    pub properties: &'a BTreeMap<String, Value>,
    /// Client address.
    pub ip_address: Option<&'a str>,
    /// Client user agent.
    pub user_agent: Option<&'a str>,
    /// `success`, `failed`, `warning` or `error`.
    pub result: &'a str,
    /// Risk score 1..=10.
    pub risk_level: u8,
    /// Creation time, already formatted.
    pub created_at: String,
}

impl CanonicalFields<'_> {
    /// Formats a creation timestamp the way it is signed.
    #[must_use]
    pub fn timestamp(created_at: DateTime<Utc>) -> String {
        format_timestamp(&created_at)
    }

    /// JCS bytes of the record.
    ///
    /// # Errors
    ///
    /// Returns [`IntegrityError::SignatureComputationFailed`] if `properties`
    /// contains a value JCS cannot encode (e.g. a non-finite float).
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, IntegrityError> {
        serde_jcs::to_vec(self).map_err(|e| IntegrityError::SignatureComputationFailed {
            reason: format!("canonical encoding failed: {e}"),
        })
    }
}

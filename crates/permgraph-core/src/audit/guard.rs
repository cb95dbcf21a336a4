//! The activity write path.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use super::{
    Activity, ActivityField, ActivityId, ActivityPatch, AuditError, HIGH_RISK_THRESHOLD,
    MAX_RISK_LEVEL, MIN_RISK_LEVEL, NewActivity, ProtectionReason, RiskScorer, SecurityEvent, SecurityEventKind,
    SecurityEventSink, SensitiveDataFilter, Severity, TracingSink,
};
use crate::clock::{Clock, SystemClock, to_record_precision};
use crate::config::{ConfigError, PermgraphConfig};
use crate::crypto::{IntegrityError, IntegritySigner, SigningPolicy};
use crate::store::ActivityStore;

/// Maximum length of an activity type.
const MAX_TYPE_LEN: usize = 64;

/// Result of checking one record's signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureStatus {
    /// The signature matches the record.
    Valid,
    /// The signature does not match, is malformed, or uses an unknown
    /// version.
    Invalid,
    /// The record carries no signature.
    Unsigned,
}

/// Summary of a bulk signature check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SignatureAudit {
    /// Records examined.
    pub checked: usize,
    /// Records whose signature verified.
    pub valid: usize,
    /// Records whose signature did not verify. Under
    /// [`SigningPolicy::FailClosed`] this includes records with no signature.
    pub tampered: Vec<ActivityId>,
    /// Records with no signature, tolerated under [`SigningPolicy::Degrade`].
    pub unsigned: Vec<ActivityId>,
}

impl SignatureAudit {
    /// Returns `true` if no tampered record was found.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.tampered.is_empty()
    }
}

/// Guards creation, update, and deletion of activity records.
#[derive(Debug)]
pub struct AuditGuard<S> {
    store: Arc<S>,
    signer: IntegritySigner,
    policy: SigningPolicy,
    filter: SensitiveDataFilter,
    scorer: RiskScorer,
    sink: Arc<dyn SecurityEventSink>,
    clock: Arc<dyn Clock>,
}

impl<S: ActivityStore> AuditGuard<S> {
    /// Creates a guard with default filter, scorer, tracing sink, and system
    /// clock.
    #[must_use]
    pub fn new(store: Arc<S>, signer: IntegritySigner, policy: SigningPolicy) -> Self {
        Self {
            store,
            signer,
            policy,
            filter: SensitiveDataFilter::new(),
            scorer: RiskScorer::default(),
            sink: Arc::new(TracingSink),
            clock: Arc::new(SystemClock),
        }
    }

    /// Creates a guard from `[integrity]` and `[audit]`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the audit section is invalid.
    pub fn from_config(
        store: Arc<S>,
        config: &PermgraphConfig,
        signer: IntegritySigner,
    ) -> Result<Self, ConfigError> {
        let scorer = config.audit.risk_scorer()?;
        Ok(Self::new(store, signer, config.integrity.signing_policy()).with_scorer(scorer))
    }

    /// Replaces the sensitive-data filter.
    #[must_use]
    pub fn with_filter(mut self, filter: SensitiveDataFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Replaces the risk scorer.
    #[must_use]
    pub fn with_scorer(mut self, scorer: RiskScorer) -> Self {
        self.scorer = scorer;
        self
    }

    /// Replaces the security event sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn SecurityEventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The signing policy in force.
    #[must_use]
    pub const fn policy(&self) -> SigningPolicy {
        self.policy
    }

    /// Validates, sanitizes, scores, signs, and persists a new activity.
    ///
    /// # Errors
    ///
    /// - [`AuditError::Validation`] for an empty or oversized type, or a
    ///   pinned risk level outside `1..=10`
    /// - [`AuditError::Integrity`] if signing fails under
    ///   [`SigningPolicy::FailClosed`]; nothing is persisted
    /// - [`AuditError::Store`] if the insert fails
    pub fn create(&self, draft: NewActivity) -> Result<Activity, AuditError> {
        validate(&draft)?;

        let created_at = to_record_precision(draft.created_at.unwrap_or_else(|| self.clock.now()));
        let risk_level = draft.risk_level.unwrap_or_else(|| {
            self.scorer.score(
                &draft.activity_type,
                draft.result,
                draft.ip_address.as_deref(),
                created_at,
            )
        });

        let mut activity = Activity {
            id: None,
            description: self.filter.redact_text(&draft.description).into_owned(),
            properties: self.filter.sanitize_properties(&draft.properties),
            activity_type: draft.activity_type,
            module: draft.module,
            causer_type: draft.causer_type,
            causer_id: draft.causer_id,
            subject_type: draft.subject_type,
            subject_id: draft.subject_id,
            ip_address: draft.ip_address,
            user_agent: draft.user_agent,
            result: draft.result,
            risk_level,
            signature: None,
            created_at,
        };

        let unsigned_reason = match self.signer.sign(&activity.canonical_fields()) {
            Ok(signature) => {
                activity.signature = Some(signature.into_string());
                None
            },
            Err(e) => match self.policy {
                SigningPolicy::FailClosed => {
                    error!(
                        severity = "critical",
                        activity_type = %activity.activity_type,
                        error = %e,
                        "Refusing to persist unsigned activity"
                    );
                    return Err(e.into());
                },
                SigningPolicy::Degrade => Some(e),
            },
        };

        let id = self.store.insert_activity(&activity)?;
        activity.id = Some(id);

        if let Some(e) = unsigned_reason {
            error!(
                severity = "critical",
                activity_id = id.0,
                error = %e,
                "Activity persisted without signature"
            );
            self.emit(
                &activity,
                SecurityEventKind::UnsignedRecordPersisted,
                Severity::Critical,
                Vec::new(),
                e.to_string(),
            );
        }
        info!(
            activity_id = id.0,
            activity_type = %activity.activity_type,
            risk_level = activity.risk_level,
            "Activity recorded"
        );
        Ok(activity)
    }

    /// Applies `patch` unless it touches a protected field.
    ///
    /// The whole update is rejected if any protected field would change; a
    /// patch that only repeats current values is a no-op for those fields.
    ///
    /// # Errors
    ///
    /// - [`AuditError::NotFound`] if the record does not exist
    /// - [`AuditError::TamperingDetected`] if a protected field would change,
    ///   a high-risk record would drop below [`HIGH_RISK_THRESHOLD`], or the
    ///   stored signature no longer verifies
    /// - [`AuditError::Validation`] for a risk level outside `1..=10`
    /// - [`AuditError::Integrity`] if re-signing fails under
    ///   [`SigningPolicy::FailClosed`]
    pub fn update(&self, id: ActivityId, patch: ActivityPatch) -> Result<Activity, AuditError> {
        let current = self.get(id)?;
        let changed = patch.changed_fields(&current);
        let protected: Vec<_> = changed.iter().copied().filter(|f| f.is_protected()).collect();

        if !protected.is_empty() {
            let names: Vec<&str> = protected.iter().map(|f| f.as_str()).collect();
            error!(
                severity = "critical",
                activity_id = id.0,
                fields = ?names,
                "Tampering attempt on protected activity fields"
            );
            self.emit(
                &current,
                SecurityEventKind::TamperingAttempt,
                Severity::Critical,
                protected.clone(),
                format!("attempted change to protected field(s): {}", names.join(", ")),
            );
            return Err(AuditError::TamperingDetected {
                activity_id: id,
                fields: protected,
            });
        }
        if changed.is_empty() {
            return Ok(current);
        }
        if let Some(level) = patch.risk_level {
            check_risk_level(level)?;
            if current.risk_level >= HIGH_RISK_THRESHOLD && level < HIGH_RISK_THRESHOLD {
                error!(
                    severity = "critical",
                    activity_id = id.0,
                    from = current.risk_level,
                    to = level,
                    "Attempt to lower a high-risk activity below the retention threshold"
                );
                self.emit(
                    &current,
                    SecurityEventKind::TamperingAttempt,
                    Severity::Critical,
                    vec![ActivityField::RiskLevel],
                    format!(
                        "risk level {} may not drop below {HIGH_RISK_THRESHOLD}",
                        current.risk_level
                    ),
                );
                return Err(AuditError::TamperingDetected {
                    activity_id: id,
                    fields: vec![ActivityField::RiskLevel],
                });
            }
        }
        self.require_intact(&current)?;

        let mut updated = current;
        patch.apply_to(&mut updated);
        updated.properties = self.filter.sanitize_properties(&updated.properties);

        match self.signer.sign(&updated.canonical_fields()) {
            Ok(signature) => updated.signature = Some(signature.into_string()),
            Err(e) => {
                if self.policy == SigningPolicy::FailClosed {
                    error!(
                        severity = "critical",
                        activity_id = id.0,
                        error = %e,
                        "Refusing to persist activity update without signature"
                    );
                    return Err(e.into());
                }
                error!(
                    severity = "critical",
                    activity_id = id.0,
                    error = %e,
                    "Activity update persisted without signature"
                );
                updated.signature = None;
                self.emit(
                    &updated,
                    SecurityEventKind::UnsignedRecordPersisted,
                    Severity::Critical,
                    Vec::new(),
                    e.to_string(),
                );
            },
        }

        self.store.replace_activity(&updated)?;
        info!(
            activity_id = id.0,
            fields = ?changed.iter().map(|f| f.as_str()).collect::<Vec<_>>(),
            "Activity updated"
        );
        Ok(updated)
    }

    /// Deletes a record if it is unprotected: not a sensitive type, below
    /// the high-risk threshold, and at least 30 days old.
    ///
    /// # Errors
    ///
    /// - [`AuditError::NotFound`] if the record does not exist
    /// - [`AuditError::DeletionProtected`] with the reason otherwise
    pub fn delete(&self, id: ActivityId) -> Result<(), AuditError> {
        let activity = self.get(id)?;
        if let Some(reason) = self.protection_reason(&activity) {
            warn!(
                activity_id = id.0,
                activity_type = %activity.activity_type,
                reason = %reason,
                "Activity deletion blocked"
            );
            self.emit(
                &activity,
                SecurityEventKind::DeletionBlocked,
                Severity::Warning,
                Vec::new(),
                reason.to_string(),
            );
            return Err(AuditError::DeletionProtected {
                activity_id: id,
                reason,
            });
        }
        if !self.store.delete_activity(id)? {
            return Err(AuditError::NotFound { id });
        }
        info!(activity_id = id.0, "Activity deleted");
        Ok(())
    }

    /// Why `activity` may not be deleted right now, if anything.
    #[must_use]
    pub fn protection_reason(&self, activity: &Activity) -> Option<ProtectionReason> {
        ProtectionReason::evaluate(activity, self.clock.now() - activity.created_at)
    }

    /// Record by id.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::NotFound`] if absent.
    pub fn get(&self, id: ActivityId) -> Result<Activity, AuditError> {
        self.store.activity(id)?.ok_or(AuditError::NotFound { id })
    }

    /// Every record, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Store`] if the read fails.
    pub fn list(&self) -> Result<Vec<Activity>, AuditError> {
        Ok(self.store.activities()?)
    }

    /// Checks one record's signature.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Integrity`] if the expected signature cannot be
    /// computed (e.g. no key configured).
    pub fn verify(&self, activity: &Activity) -> Result<SignatureStatus, AuditError> {
        let Some(signature) = activity.signature.as_deref() else {
            return Ok(SignatureStatus::Unsigned);
        };
        match self.signer.verify(&activity.canonical_fields(), signature) {
            Ok(true) => Ok(SignatureStatus::Valid),
            Ok(false)
            | Err(
                IntegrityError::MalformedSignature { .. } | IntegrityError::UnsupportedVersion { .. },
            ) => Ok(SignatureStatus::Invalid),
            Err(e) => Err(e.into()),
        }
    }

    /// Refuses to build on a stored record whose signature no longer holds.
    ///
    /// An unsigned record is only acceptable under [`SigningPolicy::Degrade`].
    /// When the key is unavailable in degraded mode the check is skipped.
    fn require_intact(&self, current: &Activity) -> Result<(), AuditError> {
        let Some(id) = current.id else {
            return Ok(());
        };
        let status = match self.verify(current) {
            Ok(status) => status,
            Err(e) if self.policy == SigningPolicy::Degrade => {
                warn!(activity_id = id.0, error = %e, "Stored signature not checked");
                return Ok(());
            },
            Err(e) => return Err(e),
        };
        if status == SignatureStatus::Valid
            || (status == SignatureStatus::Unsigned && self.policy == SigningPolicy::Degrade)
        {
            return Ok(());
        }

        error!(
            severity = "critical",
            activity_id = id.0,
            status = ?status,
            "Refusing to update activity with a broken signature"
        );
        self.emit(
            current,
            SecurityEventKind::SignatureMismatch,
            Severity::Critical,
            vec![ActivityField::Signature],
            "stored signature does not match record contents; update refused".to_string(),
        );
        Err(AuditError::TamperingDetected {
            activity_id: id,
            fields: vec![ActivityField::Signature],
        })
    }

    /// Verifies every stored record.
    ///
    /// Each mismatch is logged at critical severity and reported as a
    /// [`SecurityEventKind::SignatureMismatch`] event. Under
    /// [`SigningPolicy::FailClosed`] nothing is ever persisted unsigned, so an
    /// unsigned record is counted as tampered.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be read or the signer has no
    /// key.
    pub fn audit_signatures(&self) -> Result<SignatureAudit, AuditError> {
        let mut report = SignatureAudit::default();
        for activity in self.store.activities()? {
            report.checked += 1;
            let Some(id) = activity.id else {
                continue;
            };
            let reason = match self.verify(&activity)? {
                SignatureStatus::Valid => {
                    report.valid += 1;
                    continue;
                },
                SignatureStatus::Unsigned if self.policy == SigningPolicy::Degrade => {
                    report.unsigned.push(id);
                    continue;
                },
                SignatureStatus::Unsigned => "record has no signature under fail-closed signing",
                SignatureStatus::Invalid => "stored signature does not match record contents",
            };
            error!(
                severity = "critical",
                activity_id = id.0,
                reason,
                "Activity signature mismatch"
            );
            self.emit(
                &activity,
                SecurityEventKind::SignatureMismatch,
                Severity::Critical,
                Vec::new(),
                reason.to_string(),
            );
            report.tampered.push(id);
        }
        info!(
            checked = report.checked,
            valid = report.valid,
            tampered = report.tampered.len(),
            unsigned = report.unsigned.len(),
            "Activity signature audit complete"
        );
        Ok(report)
    }

    fn emit(
        &self,
        activity: &Activity,
        kind: SecurityEventKind,
        severity: Severity,
        fields: Vec<ActivityField>,
        reason: String,
    ) {
        self.sink.emit(&SecurityEvent {
            kind,
            severity,
            activity_id: activity.id,
            actor: activity.causer_id,
            fields,
            reason,
            occurred_at: self.clock.now(),
        });
    }
}

fn validate(draft: &NewActivity) -> Result<(), AuditError> {
    if draft.activity_type.trim().is_empty() {
        return Err(AuditError::Validation {
            reason: "activity type must not be empty".to_string(),
        });
    }
    if draft.activity_type.len() > MAX_TYPE_LEN {
        return Err(AuditError::Validation {
            reason: format!("activity type exceeds {MAX_TYPE_LEN} characters"),
        });
    }
    if let Some(level) = draft.risk_level {
        check_risk_level(level)?;
    }
    Ok(())
}

fn check_risk_level(level: u8) -> Result<(), AuditError> {
    if (MIN_RISK_LEVEL..=MAX_RISK_LEVEL).contains(&level) {
        Ok(())
    } else {
        Err(AuditError::Validation {
            reason: format!("risk level {level} outside {MIN_RISK_LEVEL}..={MAX_RISK_LEVEL}"),
        })
    }
}

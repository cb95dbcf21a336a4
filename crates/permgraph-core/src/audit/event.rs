//! Structured security events emitted by the guard for downstream routing
//! (alerting, dashboards).

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, warn};

use super::{ActivityField, ActivityId};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    /// An update tried to change protected fields.
    TamperingAttempt,
    /// A delete was refused.
    DeletionBlocked,
    /// A stored signature no longer matches its record.
    SignatureMismatch,
    /// A record was persisted without a signature in degraded mode.
    UnsignedRecordPersisted,
}

/// How urgently the event needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Expected policy enforcement.
    Warning,
    /// Possible compromise.
    Critical,
}

/// One security event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityEvent {
    /// Event kind.
    pub kind: SecurityEventKind,
    /// Severity.
    pub severity: Severity,
    /// Affected record, if it has an id.
    pub activity_id: Option<ActivityId>,
    /// Actor recorded on the affected activity.
    pub actor: Option<u64>,
    /// Fields involved (tampering attempts).
    pub fields: Vec<ActivityField>,
    /// Human-readable explanation.
    pub reason: String,
    /// When the guard observed it.
    pub occurred_at: DateTime<Utc>,
}

/// Receives security events.
pub trait SecurityEventSink: Send + Sync + std::fmt::Debug {
    /// Handles one event. Must not fail the guarded operation.
    fn emit(&self, event: &SecurityEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl SecurityEventSink for TracingSink {
    fn emit(&self, event: &SecurityEvent) {
        let activity_id = event.activity_id.map(|id| id.0);
        match event.severity {
            Severity::Critical => error!(
                severity = "critical",
                kind = ?event.kind,
                activity_id,
                actor = event.actor,
                reason = %event.reason,
                "Security event"
            ),
            Severity::Warning => warn!(
                kind = ?event.kind,
                activity_id,
                actor = event.actor,
                reason = %event.reason,
                "Security event"
            ),
        }
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<SecurityEvent>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event received so far.
    #[must_use]
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Removes and returns every event received so far.
    pub fn drain(&self) -> Vec<SecurityEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl SecurityEventSink for MemorySink {
    fn emit(&self, event: &SecurityEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

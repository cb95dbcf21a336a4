//! Risk scoring.
//!
//! `score = base(type) + 2 (failed/error) + 1 (off-hours) + 3 (suspicious IP)`,
//! clamped to `1..=10`. Off-hours means a local hour before 06:00 or after
//! 22:59.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Offset, Timelike, Utc};

use super::{Activity, ActivityResult};

/// Lowest possible score.
pub const MIN_RISK_LEVEL: u8 = 1;
/// Highest possible score.
pub const MAX_RISK_LEVEL: u8 = 10;
/// Records at or above this score cannot be deleted.
pub const HIGH_RISK_THRESHOLD: u8 = 7;

const FAILURE_MODIFIER: u8 = 2;
const OFF_HOURS_MODIFIER: u8 = 1;
const SUSPICIOUS_IP_MODIFIER: u8 = 3;

/// Number of records per risk level.
#[must_use]
pub fn risk_distribution<'a>(
    activities: impl IntoIterator<Item = &'a Activity>,
) -> BTreeMap<u8, usize> {
    let mut counts = BTreeMap::new();
    for activity in activities {
        *counts.entry(activity.risk_level).or_default() += 1;
    }
    counts
}

/// Base score for an activity type.
#[must_use]
pub fn base_score(activity_type: &str) -> u8 {
    match activity_type {
        "security_incident" => 9,
        "permission_escalation" | "unauthorized_access" => 8,
        "system_config_change" => 7,
        "sensitive_data_access" => 6,
        "login_failed" | "user_deleted" | "role_deleted" | "permission_deleted" => 5,
        "role_assigned" | "permission_changed" | "data_export" => 4,
        "user_created" | "role_created" | "permission_created" => 3,
        "user_updated" | "role_updated" | "settings_updated" => 2,
        _ => 1,
    }
}

/// Source of "is this address suspicious".
pub trait IpReputation: Send + Sync + std::fmt::Debug {
    /// Returns `true` if requests from `ip` deserve extra scrutiny.
    fn is_suspicious(&self, ip: IpAddr) -> bool;
}

/// Static denylist of addresses.
#[derive(Debug, Clone, Default)]
pub struct DenylistReputation {
    denied: HashSet<IpAddr>,
}

impl DenylistReputation {
    /// Creates a denylist.
    pub fn new(denied: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            denied: denied.into_iter().collect(),
        }
    }
}

impl IpReputation for DenylistReputation {
    fn is_suspicious(&self, ip: IpAddr) -> bool {
        self.denied.contains(&ip)
    }
}

/// Computes risk levels for new activities.
#[derive(Debug, Clone)]
pub struct RiskScorer {
    local_offset: FixedOffset,
    reputation: Arc<dyn IpReputation>,
}

impl Default for RiskScorer {
    fn default() -> Self {
        Self::new(utc(), Arc::new(DenylistReputation::default()))
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}

impl RiskScorer {
    /// Creates a scorer that evaluates off-hours in `local_offset`.
    #[must_use]
    pub fn new(local_offset: FixedOffset, reputation: Arc<dyn IpReputation>) -> Self {
        Self {
            local_offset,
            reputation,
        }
    }

    /// Returns `true` if `at` falls outside 06:00..=22:59 local time.
    #[must_use]
    pub fn is_off_hours(&self, at: DateTime<Utc>) -> bool {
        let hour = at.with_timezone(&self.local_offset).hour();
        hour < 6 || hour > 22
    }

    /// Scores one activity.
    ///
    /// An `ip_address` that does not parse is treated as unknown, not
    /// suspicious.
    #[must_use]
    pub fn score(
        &self,
        activity_type: &str,
        result: ActivityResult,
        ip_address: Option<&str>,
        at: DateTime<Utc>,
    ) -> u8 {
        let mut score = base_score(activity_type);
        if result.is_failure() {
            score += FAILURE_MODIFIER;
        }
        if self.is_off_hours(at) {
            score += OFF_HOURS_MODIFIER;
        }
        let suspicious = ip_address
            .and_then(|raw| raw.parse::<IpAddr>().ok())
            .is_some_and(|ip| self.reputation.is_suspicious(ip));
        if suspicious {
            score += SUSPICIOUS_IP_MODIFIER;
        }
        score.clamp(MIN_RISK_LEVEL, MAX_RISK_LEVEL)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, hour, 15, 0).unwrap()
    }

    fn scorer_with(ip: &str) -> RiskScorer {
        RiskScorer::new(
            utc(),
            Arc::new(DenylistReputation::new([ip.parse().unwrap()])),
        )
    }

    #[test]
    fn base_table() {
        assert_eq!(base_score("security_incident"), 9);
        assert_eq!(base_score("login_failed"), 5);
        assert_eq!(base_score("settings_updated"), 2);
        assert_eq!(base_score("view_dashboard"), 1);
    }

    #[test]
    fn modifiers_add_up() {
        let scorer = scorer_with("203.0.113.7");
        assert_eq!(scorer.score("role_assigned", ActivityResult::Success, None, at(12)), 4);
        assert_eq!(scorer.score("role_assigned", ActivityResult::Failed, None, at(12)), 6);
        assert_eq!(scorer.score("role_assigned", ActivityResult::Error, None, at(3)), 7);
        assert_eq!(
            scorer.score("role_assigned", ActivityResult::Warning, Some("203.0.113.7"), at(23)),
            8
        );
    }

    #[test]
    fn score_is_capped() {
        let scorer = scorer_with("203.0.113.7");
        assert_eq!(
            scorer.score("security_incident", ActivityResult::Failed, Some("203.0.113.7"), at(2)),
            MAX_RISK_LEVEL
        );
    }

    #[test]
    fn off_hours_boundaries() {
        let scorer = RiskScorer::default();
        assert!(scorer.is_off_hours(at(5)));
        assert!(!scorer.is_off_hours(at(6)));
        assert!(!scorer.is_off_hours(at(22)));
        assert!(scorer.is_off_hours(at(23)));
    }

    #[test]
    fn off_hours_uses_local_offset() {
        // 04:15 UTC is 13:15 at UTC+9.
        let tokyo = FixedOffset::east_opt(9 * 3600).unwrap();
        let scorer = RiskScorer::new(tokyo, Arc::new(DenylistReputation::default()));
        assert!(!scorer.is_off_hours(at(4)));
    }

    #[test]
    fn unparsable_ip_is_not_suspicious() {
        let scorer = scorer_with("203.0.113.7");
        assert_eq!(
            scorer.score("view_dashboard", ActivityResult::Success, Some("not-an-ip"), at(12)),
            1
        );
    }
}

//! Configuration parsing.
//!
//! Everything that varies per deployment is read from one TOML file into
//! [`PermgraphConfig`] and handed to the services at construction time.
//! Nothing consults global state while handling a call.
//!
//! ```toml
//! [database]
//! path = "permgraph.db"
//!
//! [integrity]
//! environment = "production"
//! signing_key_env = "PERMGRAPH_SIGNING_KEY"
//!
//! [audit]
//! local_utc_offset_minutes = 0
//! suspicious_ips = ["203.0.113.7"]
//!
//! [graph]
//! cache_enabled = true
//! cross_module_lint = true
//! cross_module_allowlist = ["users.assign_roles", "roles.manage_permissions"]
//! ```

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::FixedOffset;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::{DenylistReputation, RiskScorer};
use crate::crypto::SigningPolicy;
use crate::graph::{CrossModuleLint, DEFAULT_CROSS_MODULE_ALLOWLIST};

/// Largest accepted UTC offset, in minutes (UTC+14:00).
const MAX_UTC_OFFSET_MINUTES: u32 = 14 * 60;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermgraphConfig {
    /// Storage settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Signing settings.
    #[serde(default)]
    pub integrity: IntegrityConfig,

    /// Risk scoring settings.
    #[serde(default)]
    pub audit: AuditConfig,

    /// Dependency graph settings.
    #[serde(default)]
    pub graph: GraphConfig,
}

impl PermgraphConfig {
    /// Loads and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses and validates a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails [`Self::validate`].
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks cross-field constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.integrity.validate()?;
        self.audit.validate()?;
        Ok(())
    }
}

/// `[database]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `SQLite` database file.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("permgraph.db")
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Signing failures are fatal.
    #[default]
    Production,
    /// Pre-production.
    Staging,
    /// Local development.
    Development,
    /// Automated tests.
    Testing,
}

/// `[integrity]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityConfig {
    /// Selects the signing failure policy.
    #[serde(default)]
    pub environment: Environment,

    /// Name of the environment variable holding the HMAC key.
    #[serde(default = "default_signing_key_env")]
    pub signing_key_env: String,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            signing_key_env: default_signing_key_env(),
        }
    }
}

fn default_signing_key_env() -> String {
    "PERMGRAPH_SIGNING_KEY".to_string()
}

impl IntegrityConfig {
    /// Production fails closed; everything else degrades.
    #[must_use]
    pub const fn signing_policy(&self) -> SigningPolicy {
        match self.environment {
            Environment::Production => SigningPolicy::FailClosed,
            Environment::Staging | Environment::Development | Environment::Testing => {
                SigningPolicy::Degrade
            },
        }
    }

    /// Reads the signing key through `lookup`. Empty values count as absent.
    pub fn signing_key_from(&self, lookup: impl Fn(&str) -> Option<String>) -> Option<SecretString> {
        lookup(&self.signing_key_env)
            .filter(|key| !key.is_empty())
            .map(SecretString::from)
    }

    /// Reads the signing key from the process environment.
    #[must_use]
    pub fn signing_key(&self) -> Option<SecretString> {
        self.signing_key_from(|name| std::env::var(name).ok())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.signing_key_env.trim().is_empty() {
            return Err(ConfigError::Validation(
                "integrity.signing_key_env must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// `[audit]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Offset from UTC that defines "local" hours for off-hours scoring.
    #[serde(default)]
    pub local_utc_offset_minutes: i32,

    /// Addresses that raise the risk of every activity they originate.
    #[serde(default)]
    pub suspicious_ips: Vec<String>,
}

impl AuditConfig {
    /// Builds the risk scorer described by this section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for an out-of-range offset or an
    /// unparsable address.
    pub fn risk_scorer(&self) -> Result<RiskScorer, ConfigError> {
        let offset = self.local_offset()?;
        let denied = self
            .suspicious_ips
            .iter()
            .map(|raw| {
                raw.parse::<IpAddr>().map_err(|e| {
                    ConfigError::Validation(format!("audit.suspicious_ips: '{raw}': {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RiskScorer::new(offset, Arc::new(DenylistReputation::new(denied))))
    }

    fn local_offset(&self) -> Result<FixedOffset, ConfigError> {
        let minutes = self.local_utc_offset_minutes;
        if minutes.unsigned_abs() > MAX_UTC_OFFSET_MINUTES {
            return Err(ConfigError::Validation(format!(
                "audit.local_utc_offset_minutes must be within +/-{MAX_UTC_OFFSET_MINUTES}, got {minutes}"
            )));
        }
        minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                ConfigError::Validation(format!("invalid UTC offset of {minutes} minutes"))
            })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.risk_scorer().map(|_| ())
    }
}

/// `[graph]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Memoize closures between writes.
    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    /// Report dependencies that cross module boundaries.
    #[serde(default = "default_true")]
    pub cross_module_lint: bool,

    /// Dependent permissions exempt from the cross-module lint.
    #[serde(default = "default_cross_module_allowlist")]
    pub cross_module_allowlist: BTreeSet<String>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cross_module_lint: true,
            cross_module_allowlist: default_cross_module_allowlist(),
        }
    }
}

const fn default_true() -> bool {
    true
}

fn default_cross_module_allowlist() -> BTreeSet<String> {
    DEFAULT_CROSS_MODULE_ALLOWLIST
        .iter()
        .map(ToString::to_string)
        .collect()
}

impl GraphConfig {
    /// Lint settings for the dependency service.
    #[must_use]
    pub fn lint(&self) -> CrossModuleLint {
        if !self.cross_module_lint {
            return CrossModuleLint::disabled();
        }
        CrossModuleLint {
            enabled: true,
            allowlist: self.cross_module_allowlist.clone(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

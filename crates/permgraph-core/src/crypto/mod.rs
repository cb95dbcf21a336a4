//! Keyed integrity signatures for activity records.
//!
//! Signatures are `v1:` followed by the lowercase hex HMAC-SHA256 of the
//! record's [`CanonicalFields`]. The version prefix allows the encoding to
//! change later without misreading old signatures.
//!
//! Records signed by earlier, non-Rust deployments used a different byte
//! encoding and will report as invalid; they must be re-signed during
//! migration.

mod canonical;
mod signer;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use canonical::CanonicalFields;
pub use signer::IntegritySigner;

/// Current signature format version prefix.
pub const SIGNATURE_VERSION: &str = "v1";

/// Errors from signing and verification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum IntegrityError {
    /// The signature could not be computed.
    #[error("signature computation failed: {reason}")]
    SignatureComputationFailed {
        /// What went wrong.
        reason: String,
    },

    /// The stored signature is not `<version>:<hex>` of the right length.
    #[error("malformed signature: {reason}")]
    MalformedSignature {
        /// What is wrong with it.
        reason: String,
    },

    /// The signature uses a version this build cannot verify.
    #[error("unsupported signature version: {version}")]
    UnsupportedVersion {
        /// The version prefix found.
        version: String,
    },
}

/// What to do when a new record cannot be signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningPolicy {
    /// Refuse to persist the record.
    FailClosed,
    /// Persist unsigned and raise a critical security event.
    Degrade,
}

/// An encoded record signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(String);

impl Signature {
    /// Wraps an already-encoded signature.
    #[must_use]
    pub const fn from_encoded(encoded: String) -> Self {
        Self(encoded)
    }

    /// The encoded form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes into the encoded form.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

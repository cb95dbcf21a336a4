//! HMAC-SHA256 signer.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::{CanonicalFields, IntegrityError, SIGNATURE_VERSION, Signature};

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 digest length in bytes.
const DIGEST_LEN: usize = 32;

/// Signs and verifies canonical activity fields with an application secret.
///
/// The key never appears in `Debug` output.
#[derive(Debug, Clone)]
pub struct IntegritySigner {
    key: SecretString,
}

impl IntegritySigner {
    /// Creates a signer keyed by `key`.
    #[must_use]
    pub const fn new(key: SecretString) -> Self {
        Self { key }
    }

    /// Returns `true` if the key is usable.
    #[must_use]
    pub fn has_key(&self) -> bool {
        !self.key.expose_secret().is_empty()
    }

    /// Computes the signature of `fields`.
    ///
    /// # Errors
    ///
    /// Returns [`IntegrityError::SignatureComputationFailed`] if the key is
    /// empty or the fields cannot be encoded.
    pub fn sign(&self, fields: &CanonicalFields<'_>) -> Result<Signature, IntegrityError> {
        let digest = self.digest(fields)?;
        Ok(Signature::from_encoded(format!(
            "{SIGNATURE_VERSION}:{}",
            hex::encode(digest)
        )))
    }

    /// Checks `signature` against `fields` in constant time.
    ///
    /// # Errors
    ///
    /// - [`IntegrityError::UnsupportedVersion`] for an unknown prefix
    /// - [`IntegrityError::MalformedSignature`] if the digest is not hex of
    ///   the right length
    /// - [`IntegrityError::SignatureComputationFailed`] if the expected digest
    ///   cannot be computed
    pub fn verify(
        &self,
        fields: &CanonicalFields<'_>,
        signature: &str,
    ) -> Result<bool, IntegrityError> {
        let Some((version, encoded)) = signature.split_once(':') else {
            return Err(IntegrityError::MalformedSignature {
                reason: "missing version prefix".to_string(),
            });
        };
        if version != SIGNATURE_VERSION {
            return Err(IntegrityError::UnsupportedVersion {
                version: version.to_string(),
            });
        }
        let provided = hex::decode(encoded).map_err(|e| IntegrityError::MalformedSignature {
            reason: format!("invalid hex: {e}"),
        })?;
        if provided.len() != DIGEST_LEN {
            return Err(IntegrityError::MalformedSignature {
                reason: format!("expected {DIGEST_LEN} bytes, got {}", provided.len()),
            });
        }

        let expected = self.digest(fields)?;
        Ok(expected.ct_eq(provided.as_slice()).into())
    }

    fn digest(&self, fields: &CanonicalFields<'_>) -> Result<Vec<u8>, IntegrityError> {
        let key = self.key.expose_secret();
        if key.is_empty() {
            return Err(IntegrityError::SignatureComputationFailed {
                reason: "signing key is not configured".to_string(),
            });
        }
        let payload = fields.to_canonical_bytes()?;
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).map_err(|e| {
            IntegrityError::SignatureComputationFailed {
                reason: format!("invalid signing key: {e}"),
            }
        })?;
        mac.update(&payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use serde_json::{Value, json};

    use super::*;

    fn signer() -> IntegritySigner {
        IntegritySigner::new(SecretString::from("test-signing-key".to_string()))
    }

    fn fields(properties: &BTreeMap<String, Value>) -> CanonicalFields<'_> {
        CanonicalFields {
            activity_type: "role_assigned",
            description: "Assigned editor",
            subject_type: Some("user"),
            subject_id: Some(42),
            causer_type: Some("user"),
            causer_id: Some(1),
            properties,
            ip_address: Some("192.0.2.10"),
            user_agent: Some("curl/8.0"),
            result: "success",
            risk_level: 4,
            created_at: CanonicalFields::timestamp(
                Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap(),
            ),
        }
    }

    #[test]
    fn sign_then_verify() {
        let props = BTreeMap::from([("role".to_string(), json!("editor"))]);
        let record = fields(&props);
        let sig = signer().sign(&record).unwrap();

        assert!(sig.as_str().starts_with("v1:"));
        assert_eq!(sig.as_str().len(), 3 + 64);
        assert!(signer().verify(&record, sig.as_str()).unwrap());
    }

    #[test]
    fn signing_is_deterministic() {
        let props = BTreeMap::new();
        let a = signer().sign(&fields(&props)).unwrap();
        let b = signer().sign(&fields(&props)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_key_does_not_verify() {
        let props = BTreeMap::new();
        let sig = signer().sign(&fields(&props)).unwrap();
        let other = IntegritySigner::new(SecretString::from("another-key".to_string()));
        assert!(!other.verify(&fields(&props), sig.as_str()).unwrap());
    }

    #[test]
    fn empty_key_fails() {
        let props = BTreeMap::new();
        let empty = IntegritySigner::new(SecretString::from(String::new()));
        assert!(!empty.has_key());
        assert!(matches!(
            empty.sign(&fields(&props)),
            Err(IntegrityError::SignatureComputationFailed { .. })
        ));
    }

    #[test]
    fn malformed_signatures_are_errors() {
        let props = BTreeMap::new();
        let record = fields(&props);
        assert!(matches!(
            signer().verify(&record, "deadbeef"),
            Err(IntegrityError::MalformedSignature { .. })
        ));
        assert!(matches!(
            signer().verify(&record, "v1:zz"),
            Err(IntegrityError::MalformedSignature { .. })
        ));
        assert!(matches!(
            signer().verify(&record, "v1:abcd"),
            Err(IntegrityError::MalformedSignature { .. })
        ));
        assert!(matches!(
            signer().verify(&record, "v2:abcd"),
            Err(IntegrityError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn debug_does_not_leak_key() {
        let rendered = format!("{:?}", signer());
        assert!(!rendered.contains("test-signing-key"));
    }

    proptest! {
        #[test]
        fn any_field_change_breaks_signature(
            description in "[a-zA-Z ]{0,24}",
            subject in proptest::option::of(0u64..1000),
            risk in 1u8..=10,
        ) {
            let props = BTreeMap::new();
            let original = fields(&props);
            let sig = signer().sign(&original).unwrap();

            let mut changed = original.clone();
            changed.description = &description;
            changed.subject_id = subject;
            changed.risk_level = risk;

            let same = changed == original;
            prop_assert_eq!(signer().verify(&changed, sig.as_str()).unwrap(), same);
        }
    }
}

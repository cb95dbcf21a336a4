//! Sensitive-data filter applied to activity descriptions and payloads before
//! they are signed and stored.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Replacement text for redacted values.
pub const REDACTED: &str = "[REDACTED]";

/// Property keys whose values are always masked, whatever they contain.
///
/// Matched against the normalized key (see [`normalize_key`]), so each term
/// must be a whole `_`-separated word: `user_password` and `accessToken` are
/// masked, `passport` and `tokens_used` are not.
static SENSITIVE_KEYS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(^|_)(pass|password|passwd|passphrase|pwd)(_|$)",
        r"(^|_)token(_|$)",
        r"(^|_)secret(_|$)",
        r"(^|_)(api_?key|private_?key)(_|$)",
        r"(^|_)(credit_?card|card_?number|cvv|cvc)(_|$)",
        r"(^|_)(ssn|social_?security)(_|$)",
        r"^(authorization|cookie)$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid sensitive key pattern"))
    .collect()
});

/// Lowercases `key` and turns camelCase humps, `-`, `.` and spaces into `_`.
fn normalize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let mut prev_lower = false;
    for c in key.chars() {
        if c.is_uppercase() && prev_lower {
            out.push('_');
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        match c {
            '-' | '.' | ' ' => out.push('_'),
            _ => out.extend(c.to_lowercase()),
        }
    }
    out
}

/// Secrets that are masked wherever they appear in free text.
static SECRET_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // key=value / key: value assignments
        r#"(?i)(password|passwd|pwd|secret)['"]?\s*[:=]\s*['"]?[^\s'",]{4,}['"]?"#,
        r#"(?i)(api[_-]?key|apikey|access[_-]?token|auth[_-]?token)['"]?\s*[:=]\s*['"]?[a-zA-Z0-9_.=-]{12,}['"]?"#,
        r"(?i)bearer\s+[a-zA-Z0-9_.=-]{12,}",
        r"-----BEGIN\s+(RSA\s+|EC\s+)?PRIVATE\s+KEY-----",
        r"AKIA[A-Z0-9]{16}",
        r"gh[pousr]_[A-Za-z0-9_]{36,}",
        // 16-digit card numbers, optionally grouped
        r"\b\d{4}[ -]?\d{4}[ -]?\d{4}[ -]?\d{4}\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid secret pattern"))
    .collect()
});

/// Redacts passwords, tokens, and other secrets with [`REDACTED`].
#[derive(Debug, Clone, Default)]
pub struct SensitiveDataFilter {
    extra_keys: Vec<Regex>,
}

impl SensitiveDataFilter {
    /// Creates a filter with the built-in rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Also masks property keys matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns the regex error if `pattern` is invalid.
    pub fn with_sensitive_key(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.extra_keys.push(Regex::new(pattern)?);
        Ok(self)
    }

    /// Returns `true` if values under `key` must be masked.
    #[must_use]
    pub fn is_sensitive_key(&self, key: &str) -> bool {
        let normalized = normalize_key(key);
        SENSITIVE_KEYS.iter().any(|re| re.is_match(&normalized))
            || self.extra_keys.iter().any(|re| re.is_match(key))
    }

    /// Masks secrets embedded in free text.
    #[must_use]
    pub fn redact_text<'a>(&self, input: &'a str) -> Cow<'a, str> {
        let mut result = Cow::Borrowed(input);
        for pattern in SECRET_PATTERNS.iter() {
            if pattern.is_match(&result) {
                result = Cow::Owned(pattern.replace_all(&result, REDACTED).into_owned());
            }
        }
        result
    }

    /// Returns a sanitized copy of an activity payload.
    #[must_use]
    pub fn sanitize_properties(&self, properties: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        properties
            .iter()
            .map(|(key, value)| (key.clone(), self.sanitize_entry(key, value)))
            .collect()
    }

    fn sanitize_entry(&self, key: &str, value: &Value) -> Value {
        if self.is_sensitive_key(key) && !value.is_null() {
            return Value::String(REDACTED.to_string());
        }
        self.sanitize_value(value)
    }

    fn sanitize_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.redact_text(s).into_owned()),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.sanitize_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.sanitize_entry(k, v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

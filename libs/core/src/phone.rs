//! Phone number normalization into canonical WhatsApp recipient identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default country calling code applied to bare local numbers.
pub const DEFAULT_COUNTRY_CODE: &str = "91";
/// Length of a local subscriber number for the default numbering plan.
pub const DEFAULT_LOCAL_LEN: usize = 10;
/// Domain marker WhatsApp Web expects on individual chat ids.
pub const RECIPIENT_SUFFIX: &str = "@c.us";

/// Canonical, network-suffixed recipient identifier (`919876543210@c.us`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipientId(String);

impl RecipientId {
    /// Wraps an identifier returned by the automation client without re-validating it.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The digit portion without the domain marker.
    pub fn digits(&self) -> &str {
        self.0
            .split_once('@')
            .map(|(digits, _)| digits)
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhoneRejection {
    #[error("no digits found in mobile number")]
    EmptyNumber,
    #[error("invalid number length {len} (expected {expected} digits)")]
    InvalidLength { len: usize, expected: usize },
}

/// Numbering plan used when inferring country codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneRules {
    pub country_code: String,
    pub local_len: usize,
    pub suffix: String,
}

impl Default for PhoneRules {
    fn default() -> Self {
        Self {
            country_code: DEFAULT_COUNTRY_CODE.to_string(),
            local_len: DEFAULT_LOCAL_LEN,
            suffix: RECIPIENT_SUFFIX.to_string(),
        }
    }
}

impl PhoneRules {
    fn full_len(&self) -> usize {
        self.country_code.len() + self.local_len
    }

    /// Normalizes free-form input into a [`RecipientId`].
    ///
    /// ```
    /// use wa_core::phone::PhoneRules;
    ///
    /// let rules = PhoneRules::default();
    /// let id = rules.normalize("091-98765 43210").unwrap();
    /// assert_eq!(id.as_str(), "919876543210@c.us");
    /// ```
    pub fn normalize(&self, raw: &str) -> Result<RecipientId, PhoneRejection> {
        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            return Err(PhoneRejection::EmptyNumber);
        }

        let cc = self.country_code.as_str();
        let len = digits.len();
        let canonical = if len == self.local_len {
            format!("{cc}{digits}")
        } else if len == self.local_len + 1 && digits.starts_with('0') {
            format!("{cc}{}", &digits[1..])
        } else if len == self.full_len() && digits.starts_with(cc) {
            digits
        } else if len == self.full_len() + 1 && digits.starts_with(&format!("0{cc}")) {
            digits[1..].to_string()
        } else {
            tracing::debug!(len, "unusual mobile number length");
            digits
        };

        if canonical.len() != self.full_len() {
            return Err(PhoneRejection::InvalidLength {
                len: canonical.len(),
                expected: self.full_len(),
            });
        }
        Ok(RecipientId(format!("{canonical}{}", self.suffix)))
    }
}

/// Normalizes with the default numbering plan.
pub fn normalize(raw: &str) -> Result<RecipientId, PhoneRejection> {
    PhoneRules::default().normalize(raw)
}

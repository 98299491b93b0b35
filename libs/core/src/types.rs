use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::phone::PhoneRejection;

/// A recipient row as submitted by callers.
///
/// Unknown keys are retained in `extra` so they can be echoed back in reports.
///
/// ```
/// use wa_core::Contact;
///
/// let contact: Contact = serde_json::from_str(
///     r#"{"name":"Asha","mobile":9876543210,"interestedArea":"Solar","city":"Pune"}"#,
/// ).unwrap();
/// assert_eq!(contact.mobile, "9876543210");
/// assert_eq!(contact.field("interestedArea"), Some("Solar"));
/// assert_eq!(contact.extra["city"], "Pune");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub mobile: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interested_area: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Contact {
    pub fn with_mobile(mobile: impl Into<String>) -> Self {
        Self {
            mobile: mobile.into(),
            ..Self::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Looks up a template field by its placeholder key.
    pub fn field(&self, key: &str) -> Option<&str> {
        match key {
            "name" => self.name.as_deref(),
            "company" => self.company.as_deref(),
            "email" => self.email.as_deref(),
            "mobile" => Some(self.mobile.as_str()),
            "interestedArea" => self.interested_area.as_deref(),
            "contactType" => self.contact_type.as_deref(),
            _ => None,
        }
    }

    /// Label used in reports: the name when present, otherwise the raw mobile.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.mobile)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "mobile must be a string or number, got {other}"
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Sent,
    Failed,
}

/// Machine-readable failure code carried next to the human reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    InvalidPhoneNumber,
    NotRegistered,
    SessionNotReady,
    SendFailed,
    Processing,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::InvalidPhoneNumber => "invalid_phone_number",
            FailureCode::NotRegistered => "not_registered",
            FailureCode::SessionNotReady => "session_not_ready",
            FailureCode::SendFailed => "send_failed",
            FailureCode::Processing => "processing",
        }
    }
}

/// Why a single recipient did not receive its message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("Invalid phone number format")]
    InvalidPhoneNumber(#[source] PhoneRejection),
    #[error("Number not registered on WhatsApp")]
    NotRegistered,
    #[error("WhatsApp session not ready")]
    SessionNotReady,
    #[error("Send error: {0}")]
    SendFailed(String),
    #[error("Processing error: {0}")]
    Processing(String),
}

impl FailureReason {
    pub fn code(&self) -> FailureCode {
        match self {
            FailureReason::InvalidPhoneNumber(_) => FailureCode::InvalidPhoneNumber,
            FailureReason::NotRegistered => FailureCode::NotRegistered,
            FailureReason::SessionNotReady => FailureCode::SessionNotReady,
            FailureReason::SendFailed(_) => FailureCode::SendFailed,
            FailureReason::Processing(_) => FailureCode::Processing,
        }
    }
}

/// Outcome for one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub contact: String,
    pub mobile: String,
    pub status: SendStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<FailureCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<usize>,
    #[serde(default)]
    pub has_text: bool,
    #[serde(default)]
    pub has_url: bool,
}

impl SendResult {
    pub fn sent(contact: &Contact) -> Self {
        Self {
            contact: contact.display_name().to_string(),
            mobile: contact.mobile.clone(),
            status: SendStatus::Sent,
            reason: None,
            code: None,
            attachments: None,
            has_text: false,
            has_url: false,
        }
    }

    pub fn failed(contact: &Contact, reason: FailureReason) -> Self {
        Self {
            contact: contact.display_name().to_string(),
            mobile: contact.mobile.clone(),
            status: SendStatus::Failed,
            reason: Some(reason.to_string()),
            code: Some(reason.code()),
            attachments: None,
            has_text: false,
            has_url: false,
        }
    }

    pub fn with_content(mut self, attachments: Option<usize>, has_text: bool, has_url: bool) -> Self {
        self.attachments = attachments;
        self.has_text = has_text;
        self.has_url = has_url;
        self
    }

    pub fn is_sent(&self) -> bool {
        self.status == SendStatus::Sent
    }
}

/// Aggregate of a bulk send; `details` keeps input order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkReport {
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub details: Vec<SendResult>,
}

impl BulkReport {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            details: Vec::with_capacity(total),
            ..Self::default()
        }
    }

    pub fn record(&mut self, result: SendResult) {
        if result.is_sent() {
            self.sent += 1;
        } else {
            self.failed += 1;
        }
        self.details.push(result);
    }

    pub fn all_sent(&self) -> bool {
        self.failed == 0
    }
}

//! Relay envelope: the JSON payload published on the `sms` topic
//!
//! ```json
//! {"phoneNumber": "+15551234567", "message": "hi"}
//! ```
//!
//! Both fields are mandatory. Numeric values are accepted and rendered as
//! text (senders commonly emit phone numbers as JSON numbers); anything else
//! in those fields, or a payload that is not a JSON object, is malformed.
//! Other top-level fields are ignored.

use crate::carrier::split_for_carrier;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing or non-text field {0:?}")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    #[serde(rename = "phoneNumber")]
    pub phone_number: String,
    pub message: String,
}

impl RelayEnvelope {
    pub fn new(phone_number: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            phone_number: phone_number.into(),
            message: message.into(),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_slice(payload)?;
        let object = value.as_object().ok_or(EnvelopeError::NotAnObject)?;

        let text_field = |name: &'static str| match object.get(name) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(EnvelopeError::MissingField(name)),
        };

        Ok(Self {
            phone_number: text_field("phoneNumber")?,
            message: text_field("message")?,
        })
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Outbound segment sequence for this envelope's body
    pub fn segments(&self, max_part_len: usize) -> Vec<String> {
        split_for_carrier(&self.message, max_part_len)
    }
}

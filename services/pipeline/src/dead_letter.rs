//! Dead letter envelope.
//!
//! Messages that exhausted their delivery budget are wrapped in a
//! [`DeadLetter`] and published to the dead letter topic, where they stay
//! until an operator inspects or redrives them.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message that failed every delivery attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetter {
    /// Topic the message was originally consumed from
    pub original_topic: String,
    /// Original message key (if any)
    pub original_key: Option<String>,
    /// Original payload, base64 encoded
    pub original_message_base64: String,
    /// Error reported by the last failed attempt
    pub error: String,
    /// Number of deliveries made before giving up
    pub attempts: u32,
    /// When the message was dead-lettered
    pub timestamp: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        original_topic: impl Into<String>,
        original_key: Option<String>,
        payload: &[u8],
        error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            original_topic: original_topic.into(),
            original_key,
            original_message_base64: STANDARD.encode(payload),
            error: error.into(),
            attempts,
            timestamp: Utc::now(),
        }
    }

    /// Decode the original payload
    pub fn payload(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.original_message_base64)
    }
}

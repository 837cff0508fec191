//! Wire envelope for draft-generation jobs
//!
//! ```json
//! {"job_id": "...", "user_id": "...", "idea_id": "...",
//!  "timestamp": "2024-05-01T10:00:00Z", "retry_count": 0}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Field carrying the transport-level redelivery counter
pub const RETRY_COUNT_FIELD: &str = "retry_count";

/// One draft-generation request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DraftJobMessage {
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub idea_id: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Transport-level redelivery counter; never touched by in-process retries
    #[serde(default)]
    pub retry_count: u32,
}

/// Envelope validation failures. All of them are permanent.
#[derive(Debug, Error, PartialEq)]
pub enum EnvelopeError {
    #[error("user_id is required")]
    MissingUserId,
    #[error("idea_id is required")]
    MissingIdeaId,
    #[error("timestamp is required")]
    MissingTimestamp,
}

impl DraftJobMessage {
    pub fn new(
        job_id: impl Into<String>,
        user_id: impl Into<String>,
        idea_id: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            user_id: user_id.into(),
            idea_id: idea_id.into(),
            timestamp: Some(Utc::now()),
            retry_count: 0,
        }
    }

    /// Decode and validate a raw payload
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let message: Self = serde_json::from_slice(payload)?;
        message.validate()?;
        Ok(message)
    }

    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.user_id.trim().is_empty() {
            return Err(EnvelopeError::MissingUserId);
        }
        if self.idea_id.trim().is_empty() {
            return Err(EnvelopeError::MissingIdeaId);
        }
        match self.timestamp {
            Some(ts) if ts.timestamp() > 0 => Ok(()),
            _ => Err(EnvelopeError::MissingTimestamp),
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid envelope: {0}")]
    Invalid(#[from] EnvelopeError),
}

/// Read `retry_count` from a payload that must be a JSON object.
///
/// Missing or non-integer values count as 0.
pub fn read_retry_count(payload: &[u8]) -> Result<u32, serde_json::Error> {
    let object: Map<String, Value> = serde_json::from_slice(payload)?;
    Ok(object
        .get(RETRY_COUNT_FIELD)
        .and_then(Value::as_u64)
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
        .unwrap_or(0))
}

/// Payload to re-publish on negative acknowledgement: `retry_count` + 1.
///
/// Payloads that are not JSON objects are returned unchanged.
pub fn redelivery_payload(payload: &[u8]) -> Vec<u8> {
    let Ok(mut object) = serde_json::from_slice::<Map<String, Value>>(payload) else {
        return payload.to_vec();
    };
    let current = object
        .get(RETRY_COUNT_FIELD)
        .and_then(Value::as_u64)
        .unwrap_or(0);
    object.insert(
        RETRY_COUNT_FIELD.to_string(),
        Value::from(current.saturating_add(1)),
    );
    serde_json::to_vec(&object).unwrap_or_else(|_| payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_valid_envelope() {
        let payload = br#"{"job_id":"j1","user_id":"u1","idea_id":"i1","timestamp":"2024-05-01T10:00:00Z"}"#;
        let message = DraftJobMessage::decode(payload).unwrap();

        assert_eq!(message.job_id, "j1");
        assert_eq!(message.user_id, "u1");
        assert_eq!(message.idea_id, "i1");
        assert_eq!(message.retry_count, 0);
    }

    #[test]
    fn test_missing_fields_rejected() {
        let no_user = br#"{"idea_id":"i1","timestamp":"2024-05-01T10:00:00Z"}"#;
        let no_idea = br#"{"user_id":"u1","timestamp":"2024-05-01T10:00:00Z"}"#;
        let no_ts = br#"{"user_id":"u1","idea_id":"i1"}"#;
        let zero_ts = br#"{"user_id":"u1","idea_id":"i1","timestamp":"1970-01-01T00:00:00Z"}"#;

        assert!(matches!(
            DraftJobMessage::decode(no_user),
            Err(DecodeError::Invalid(EnvelopeError::MissingUserId))
        ));
        assert!(matches!(
            DraftJobMessage::decode(no_idea),
            Err(DecodeError::Invalid(EnvelopeError::MissingIdeaId))
        ));
        assert!(matches!(
            DraftJobMessage::decode(no_ts),
            Err(DecodeError::Invalid(EnvelopeError::MissingTimestamp))
        ));
        assert!(matches!(
            DraftJobMessage::decode(zero_ts),
            Err(DecodeError::Invalid(EnvelopeError::MissingTimestamp))
        ));
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(
            DraftJobMessage::decode(b"{not json"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_read_retry_count() {
        assert_eq!(read_retry_count(br#"{"retry_count":3}"#).unwrap(), 3);
        assert_eq!(read_retry_count(br#"{"user_id":"u"}"#).unwrap(), 0);
        assert_eq!(read_retry_count(br#"{"retry_count":"two"}"#).unwrap(), 0);
        assert!(read_retry_count(b"[1,2,3]").is_err());
        assert!(read_retry_count(b"garbage").is_err());
    }

    #[test]
    fn test_redelivery_payload_increments_counter() {
        let next = redelivery_payload(br#"{"user_id":"u1","retry_count":1}"#);
        assert_eq!(read_retry_count(&next).unwrap(), 2);

        let first = redelivery_payload(br#"{"user_id":"u1"}"#);
        assert_eq!(read_retry_count(&first).unwrap(), 1);
    }

    #[test]
    fn test_redelivery_payload_keeps_non_objects() {
        assert_eq!(redelivery_payload(b"garbage"), b"garbage".to_vec());
    }

    #[test]
    fn test_new_envelope_is_valid() {
        let message = DraftJobMessage::new("j", "u", "i");
        assert!(message.validate().is_ok());
    }
}

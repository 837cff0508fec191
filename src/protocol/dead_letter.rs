//! Dead-letter record published for messages the consumer gives up on

use crate::error::{sanitize_error_message, truncate_chars};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cap on the error text carried by a dead-letter record
pub const MAX_DEAD_LETTER_ERROR_CHARS: usize = 2_048;

/// Machine-readable reason a message was dead-lettered
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterCode {
    MaxRetriesExceeded,
    PermanentFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetter {
    /// Subject the message was originally consumed from
    pub subject: String,
    /// Original payload; JSON payloads are embedded as-is, anything else as a string
    pub payload: serde_json::Value,
    /// Sanitized and capped at [`MAX_DEAD_LETTER_ERROR_CHARS`]
    pub error: String,
    pub error_code: DeadLetterCode,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        subject: &str,
        payload: &[u8],
        error: &str,
        error_code: DeadLetterCode,
        retry_count: u32,
    ) -> Self {
        let payload = serde_json::from_slice(payload).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(payload).into_owned())
        });
        Self {
            subject: subject.to_string(),
            payload,
            error: truncate_chars(&sanitize_error_message(error), MAX_DEAD_LETTER_ERROR_CHARS),
            error_code,
            retry_count,
            failed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_payload_embedded() {
        let record = DeadLetter::new(
            "jobs/drafts",
            br#"{"job_id":"j1"}"#,
            "boom",
            DeadLetterCode::MaxRetriesExceeded,
            3,
        );
        assert_eq!(record.payload["job_id"], "j1");

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["error_code"], "MAX_RETRIES_EXCEEDED");
        assert_eq!(json["retry_count"], 3);
    }

    #[test]
    fn test_non_json_payload_kept_as_string() {
        let record = DeadLetter::new(
            "jobs/drafts",
            b"not json",
            "bad",
            DeadLetterCode::PermanentFailure,
            0,
        );
        assert_eq!(record.payload, serde_json::Value::String("not json".into()));
    }

    #[test]
    fn test_error_text_is_redacted_and_capped() {
        let error = format!("upstream rejected api_key=sk-live-123 {}", "é".repeat(5_000));
        let record = DeadLetter::new(
            "jobs/drafts",
            br#"{"job_id":"j1"}"#,
            &error,
            DeadLetterCode::PermanentFailure,
            0,
        );

        assert!(!record.error.contains("sk-live-123"));
        assert_eq!(record.error.chars().count(), MAX_DEAD_LETTER_ERROR_CHARS);
    }
}

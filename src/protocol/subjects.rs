//! Subject canonicalization and validation
//!
//! A subject is an MQTT topic name. Subjects are stored without a leading
//! slash so they compose with shared-subscription filters (`$share/<group>/<subject>`).

use thiserror::Error;

/// Subject validation errors
#[derive(Debug, Error, PartialEq)]
pub enum SubjectError {
    #[error("Subject cannot be empty")]
    Empty,
    #[error("Subject contains wildcard character: '{0}'")]
    Wildcard(char),
    #[error("Subject cannot start with '$'")]
    Reserved,
}

/// Canonicalize a subject: no leading or trailing slash, no empty segments
pub fn canonicalize_subject(subject: &str) -> String {
    subject
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Reject subjects that are empty, contain wildcards or use the reserved `$` prefix
pub fn validate_subject(subject: &str) -> Result<(), SubjectError> {
    let canonical = canonicalize_subject(subject);
    if canonical.is_empty() {
        return Err(SubjectError::Empty);
    }
    if canonical.starts_with('$') {
        return Err(SubjectError::Reserved);
    }
    if let Some(ch) = canonical.chars().find(|c| matches!(c, '+' | '#')) {
        return Err(SubjectError::Wildcard(ch));
    }
    Ok(())
}

/// Build the subscription filter, as a shared subscription when a queue group is given
pub fn subscription_filter(subject: &str, queue_group: Option<&str>) -> String {
    match queue_group {
        Some(group) => format!("$share/{group}/{subject}"),
        None => subject.to_string(),
    }
}

//! Wire formats for the draft-generation queue
//!
//! The job envelope, the dead-letter record and subject naming rules.

pub mod dead_letter;
pub mod envelope;
pub mod subjects;

pub use dead_letter::{DeadLetter, DeadLetterCode};
pub use envelope::{
    read_retry_count, redelivery_payload, DecodeError, DraftJobMessage, EnvelopeError,
};
pub use subjects::{canonicalize_subject, subscription_filter, validate_subject, SubjectError};

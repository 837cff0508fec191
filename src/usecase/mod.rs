//! Draft-generation use case
//!
//! The worker depends only on [`GenerateDrafts`]; [`LlmDraftGenerator`] is the
//! production implementation backed by an [`LlmProvider`](crate::llm::LlmProvider).

pub mod generator;

pub use generator::LlmDraftGenerator;

use crate::jobs::Draft;
use crate::llm::LlmError;
use async_trait::async_trait;
use thiserror::Error;

/// Input for one draft-generation run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftRequest {
    pub user_id: String,
    pub idea_id: String,
}

/// Model output that was received but could not be used
#[derive(Debug, Clone, Error, PartialEq)]
#[error("invalid LLM response: {reason}")]
pub struct LlmResponseError {
    pub reason: String,
    pub prompt: String,
    pub raw_response: String,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum UseCaseError {
    #[error(transparent)]
    LlmResponse(#[from] LlmResponseError),

    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("{0}")]
    Other(String),
}

impl UseCaseError {
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other(message.into())
    }

    /// Structured details when the failure was an unusable model response
    pub fn as_llm_response(&self) -> Option<&LlmResponseError> {
        match self {
            UseCaseError::LlmResponse(details) => Some(details),
            _ => None,
        }
    }
}

/// Generates drafts for one idea
#[async_trait]
pub trait GenerateDrafts: Send + Sync {
    async fn execute(&self, request: DraftRequest) -> Result<Vec<Draft>, UseCaseError>;
}

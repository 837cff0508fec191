//! Narrow persistence interfaces consumed by the worker

use super::model::{Job, JobError, JobStatus};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RepositoryError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl RepositoryError {
    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage(message.into())
    }
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn find_by_id(&self, job_id: &str) -> Result<Option<Job>, RepositoryError>;

    /// Unconditional write of the whole record
    async fn update(&self, job: &Job) -> Result<(), RepositoryError>;

    /// Compare-and-swap write: persists `job` only if the stored status still
    /// equals `expected`. Returns whether the write happened.
    async fn update_if_status(
        &self,
        job: &Job,
        expected: JobStatus,
    ) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait JobErrorRepository: Send + Sync {
    /// Append a record, returning its id
    async fn create(&self, record: &JobError) -> Result<String, RepositoryError>;
}

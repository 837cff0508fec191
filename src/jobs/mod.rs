//! Job records and their persistence interfaces

pub mod memory;
pub mod model;
pub mod repository;

pub use memory::{InMemoryJobErrorRepository, InMemoryJobRepository};
pub use model::{
    Draft, Job, JobError, JobStatus, DRAFT_GENERATION, MAX_DIAGNOSTIC_CHARS, MAX_JOB_ERROR_CHARS,
};
pub use repository::{JobErrorRepository, JobRepository, RepositoryError};

//! In-memory repositories for development and tests

use super::model::{Job, JobError, JobStatus};
use super::repository::{JobErrorRepository, JobRepository, RepositoryError};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<String, Job>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a job
    pub async fn insert(&self, job: Job) {
        self.jobs.write().await.insert(job.id.clone(), job);
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.read().await.get(job_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn find_by_id(&self, job_id: &str) -> Result<Option<Job>, RepositoryError> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(job.id.clone())),
        }
    }

    async fn update_if_status(
        &self,
        job: &Job,
        expected: JobStatus,
    ) -> Result<bool, RepositoryError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(stored) if stored.status == expected => {
                *stored = job.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound(job.id.clone())),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryJobErrorRepository {
    records: RwLock<Vec<(String, JobError)>>,
}

impl InMemoryJobErrorRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<JobError> {
        self.records
            .read()
            .await
            .iter()
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub async fn records_for(&self, job_id: &str) -> Vec<JobError> {
        self.records
            .read()
            .await
            .iter()
            .filter(|(_, record)| record.job_id == job_id)
            .map(|(_, record)| record.clone())
            .collect()
    }
}

#[async_trait]
impl JobErrorRepository for InMemoryJobErrorRepository {
    async fn create(&self, record: &JobError) -> Result<String, RepositoryError> {
        let id = Uuid::new_v4().to_string();
        self.records.write().await.push((id.clone(), record.clone()));
        Ok(id)
    }
}

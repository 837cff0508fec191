//! Builder for [`DraftWorker`]

use super::DraftWorker;
use crate::config::WorkerConfig;
use crate::jobs::{JobErrorRepository, JobRepository};
use crate::messaging::Consumer;
use crate::observability::metrics::{LatencyWindow, WorkerMetrics};
use crate::usecase::GenerateDrafts;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq)]
pub enum BuildError {
    #[error("Missing required dependency: {0}")]
    MissingDependency(&'static str),
}

/// Collects collaborators; only the use case and the consumer are required
pub struct DraftWorkerBuilder {
    worker_id: String,
    max_retries: u32,
    processing_timeout: Option<Duration>,
    use_case: Option<Arc<dyn GenerateDrafts>>,
    consumer: Option<Arc<Consumer>>,
    jobs: Option<Arc<dyn JobRepository>>,
    job_errors: Option<Arc<dyn JobErrorRepository>>,
    shutdown: CancellationToken,
}

impl Default for DraftWorkerBuilder {
    fn default() -> Self {
        Self {
            worker_id: "draft-worker".to_string(),
            max_retries: 2,
            processing_timeout: None,
            use_case: None,
            consumer: None,
            jobs: None,
            job_errors: None,
            shutdown: CancellationToken::new(),
        }
    }
}

impl DraftWorkerBuilder {
    /// Worker id, retry budget and processing deadline from `[worker]`
    pub fn with_config(mut self, config: &WorkerConfig) -> Self {
        self.worker_id = config.worker.id.clone();
        self.max_retries = config.worker.max_retries;
        self.processing_timeout = Some(config.processing_timeout());
        self
    }

    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// In-process attempts per message are `max_retries + 1`
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = Some(timeout);
        self
    }

    pub fn use_case(mut self, use_case: Arc<dyn GenerateDrafts>) -> Self {
        self.use_case = Some(use_case);
        self
    }

    pub fn consumer(mut self, consumer: Arc<Consumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn job_repository(mut self, jobs: Arc<dyn JobRepository>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn job_error_repository(mut self, job_errors: Arc<dyn JobErrorRepository>) -> Self {
        self.job_errors = Some(job_errors);
        self
    }

    /// Token that aborts in-flight retry loops on shutdown
    pub fn shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn build(self) -> Result<DraftWorker, BuildError> {
        let use_case = self
            .use_case
            .ok_or(BuildError::MissingDependency("use_case"))?;
        let consumer = self
            .consumer
            .ok_or(BuildError::MissingDependency("consumer"))?;

        Ok(DraftWorker {
            worker_id: self.worker_id,
            max_retries: self.max_retries,
            processing_timeout: self.processing_timeout,
            use_case,
            consumer,
            jobs: self.jobs,
            job_errors: self.job_errors,
            shutdown: self.shutdown,
            metrics: Arc::new(WorkerMetrics::new()),
            latency: Arc::new(LatencyWindow::default()),
        })
    }
}

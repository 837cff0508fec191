//! Draft-generation worker
//!
//! Turns one queue message into a durable job outcome:
//!
//! 1. decode and validate the envelope; undecodable messages are dropped
//! 2. move the job `pending -> processing` with a compare-and-swap write
//!    (jobs already `completed`/`failed` are skipped)
//! 3. call the use case up to `max_retries + 1` times, checking for
//!    cancellation before each attempt
//! 4. persist `completed` with the draft ids, or `failed` with a capped error
//!    and, for unusable model output, a [`JobError`] record
//!
//! The worker owns retries: once its attempts are exhausted it reports a
//! permanent failure so the consumer acknowledges instead of redelivering.
//! Cancellation and deadline expiry are not failures; they leave the job in
//! `processing` and ask for redelivery. On the last delivery the consumer
//! allows, a cancelled job is marked `failed` instead, since nothing would
//! redeliver it.

mod builder;

pub use builder::{BuildError, DraftWorkerBuilder};

use crate::error::{sanitize_error_message, truncate_chars};
use crate::job_span;
use crate::jobs::{
    Job, JobError, JobErrorRepository, JobRepository, JobStatus, DRAFT_GENERATION,
    MAX_DIAGNOSTIC_CHARS, MAX_JOB_ERROR_CHARS,
};
use crate::messaging::{Consumer, ConsumerError, HandlerError, MessageHandler};
use crate::observability::metrics::{LatencyWindow, MetricsSource, Snapshot, WorkerMetrics};
use crate::protocol::DraftJobMessage;
use crate::usecase::{DraftRequest, GenerateDrafts, LlmResponseError, UseCaseError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

const CANCELLED: &str = "processing cancelled";
/// Recorded when a cancelled delivery has no redelivery left
const CANCELLED_FINAL: &str = "cancelled: retry budget exhausted";

/// Result of handling one message that did not need redelivery
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Envelope could not be decoded or validated
    Dropped,
    /// Job already finished or claimed by another delivery
    Skipped(JobStatus),
    Completed { draft_ids: Vec<String> },
}

/// Outcome of a conditional job write
#[derive(Debug)]
enum JobUpdate {
    Written,
    /// The mutation decided nothing needed persisting
    Unchanged(Job),
    /// Stored status moved between load and write
    Conflict,
    /// No repository, no such job, or a storage error (logged)
    Unavailable,
}

enum AttemptsOutcome {
    Succeeded(Vec<String>),
    Exhausted(UseCaseError),
    Cancelled { attempt: u32 },
}

pub struct DraftWorker {
    worker_id: String,
    max_retries: u32,
    processing_timeout: Option<Duration>,
    use_case: Arc<dyn GenerateDrafts>,
    consumer: Arc<Consumer>,
    jobs: Option<Arc<dyn JobRepository>>,
    job_errors: Option<Arc<dyn JobErrorRepository>>,
    shutdown: CancellationToken,
    metrics: Arc<WorkerMetrics>,
    latency: Arc<LatencyWindow>,
}

impl DraftWorker {
    pub fn builder() -> DraftWorkerBuilder {
        DraftWorkerBuilder::default()
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn consumer(&self) -> &Arc<Consumer> {
        &self.consumer
    }

    pub fn metrics(&self) -> Arc<WorkerMetrics> {
        self.metrics.clone()
    }

    /// Counters plus processing-time percentiles
    pub fn snapshot(&self) -> Snapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.extend(self.latency.percentiles());
        snapshot
    }

    /// Subscribe this worker as the consumer's handler
    pub async fn start(self: &Arc<Self>) -> Result<(), ConsumerError> {
        self.consumer.subscribe(self.clone()).await?;
        info!(
            worker_id = %self.worker_id,
            subject = %self.consumer.subject(),
            max_retries = self.max_retries,
            "Draft worker started"
        );
        Ok(())
    }

    /// Stop consuming, draining in-flight jobs for up to `drain_timeout`
    pub async fn stop(&self, drain_timeout: Duration) -> Result<(), ConsumerError> {
        self.consumer.unsubscribe(drain_timeout).await?;
        info!(worker_id = %self.worker_id, "Draft worker stopped");
        Ok(())
    }

    /// Handle one raw message
    pub async fn process_message(
        &self,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, HandlerError> {
        self.metrics.messages_processed.incr();

        let message = match DraftJobMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.processing_errors.incr();
                warn!(error = %e, "Dropping job message that can never succeed");
                return Ok(ProcessOutcome::Dropped);
            }
        };

        let span = job_span!(
            job_id = %message.job_id,
            user_id = %message.user_id,
            idea_id = %message.idea_id,
            retry_count = message.retry_count
        );
        self.process_job(message, cancel).instrument(span).await
    }

    async fn process_job(
        &self,
        message: DraftJobMessage,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, HandlerError> {
        let started = Instant::now();

        match self.update_job(&message.job_id, Job::mark_processing).await {
            JobUpdate::Written | JobUpdate::Unavailable => {}
            JobUpdate::Unchanged(job) if job.status == JobStatus::Processing => {
                debug!("Job already processing, resuming after redelivery");
            }
            JobUpdate::Unchanged(job) => {
                self.metrics.jobs_skipped.incr();
                info!(status = %job.status, "Job already finished, skipping");
                return Ok(ProcessOutcome::Skipped(job.status));
            }
            JobUpdate::Conflict => {
                self.metrics.jobs_skipped.incr();
                info!("Job claimed by another delivery, skipping");
                return Ok(ProcessOutcome::Skipped(JobStatus::Processing));
            }
        }

        let request = DraftRequest {
            user_id: message.user_id.clone(),
            idea_id: message.idea_id.clone(),
        };

        match self.run_attempts(request, cancel).await {
            AttemptsOutcome::Succeeded(draft_ids) => {
                self.update_job(&message.job_id, |job| {
                    job.mark_processing();
                    job.mark_completed(draft_ids.clone())
                })
                .await;
                self.metrics.jobs_completed.incr();
                self.latency.record(started.elapsed());
                info!(drafts = draft_ids.len(), "Job completed");
                Ok(ProcessOutcome::Completed { draft_ids })
            }
            AttemptsOutcome::Exhausted(error) => {
                self.metrics.generation_failures.incr();
                let attempts = self.max_retries + 1;
                if let Some(details) = error.as_llm_response() {
                    self.capture_job_error(&message, details, attempts).await;
                }

                let job_error = failure_message(&error);
                self.update_job(&message.job_id, |job| {
                    job.mark_processing();
                    job.mark_failed(job_error.clone())
                })
                .await;
                self.latency.record(started.elapsed());
                error!(attempts, error = %job_error, "Draft generation failed");
                Err(HandlerError::Permanent(job_error))
            }
            AttemptsOutcome::Cancelled { attempt } => {
                self.metrics.cancellations.incr();
                if message.retry_count < self.consumer.max_retries() {
                    info!(attempt, "Job processing cancelled, leaving for redelivery");
                    return Err(HandlerError::Retryable(CANCELLED.to_string()));
                }

                self.update_job(&message.job_id, |job| {
                    job.mark_processing();
                    job.mark_failed(CANCELLED_FINAL.to_string())
                })
                .await;
                warn!(
                    attempt,
                    retry_count = message.retry_count,
                    "Job processing cancelled on its last delivery, marking failed"
                );
                Err(HandlerError::Permanent(CANCELLED_FINAL.to_string()))
            }
        }
    }

    /// Bounded in-process retry loop; no delay between attempts
    async fn run_attempts(
        &self,
        request: DraftRequest,
        cancel: &CancellationToken,
    ) -> AttemptsOutcome {
        let attempts = self.max_retries + 1;
        let deadline = self
            .processing_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);
        let mut last_error = UseCaseError::other("no attempts made");

        for attempt in 1..=attempts {
            if self.is_cancelled(cancel, deadline) {
                return AttemptsOutcome::Cancelled { attempt };
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return AttemptsOutcome::Cancelled { attempt },
                _ = self.shutdown.cancelled() => return AttemptsOutcome::Cancelled { attempt },
                _ = wait_for_deadline(deadline) => return AttemptsOutcome::Cancelled { attempt },
                result = self.use_case.execute(request.clone()) => result,
            };

            match result {
                Ok(drafts) => {
                    debug!(attempt, "Use case succeeded");
                    return AttemptsOutcome::Succeeded(
                        drafts.into_iter().map(|draft| draft.id).collect(),
                    );
                }
                Err(e) => {
                    self.metrics.processing_errors.incr();
                    if attempt < attempts {
                        self.metrics.retries.incr();
                    }
                    warn!(attempt, max_attempts = attempts, error = %e, "Draft generation attempt failed");
                    last_error = e;
                }
            }
        }

        AttemptsOutcome::Exhausted(last_error)
    }

    fn is_cancelled(
        &self,
        cancel: &CancellationToken,
        deadline: Option<tokio::time::Instant>,
    ) -> bool {
        cancel.is_cancelled()
            || self.shutdown.is_cancelled()
            || deadline.is_some_and(|deadline| tokio::time::Instant::now() >= deadline)
    }

    /// Load, mutate, and conditionally persist a job.
    ///
    /// `mutate` returns whether anything changed. The write only lands if the
    /// stored status still matches the one observed at load time. Failures are
    /// logged and never propagated.
    async fn update_job<F>(&self, job_id: &str, mutate: F) -> JobUpdate
    where
        F: FnOnce(&mut Job) -> bool + Send,
    {
        let Some(jobs) = &self.jobs else {
            return JobUpdate::Unavailable;
        };
        if job_id.is_empty() {
            return JobUpdate::Unavailable;
        }

        let mut job = match jobs.find_by_id(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id, "Job not found, continuing without status updates");
                return JobUpdate::Unavailable;
            }
            Err(e) => {
                warn!(job_id, error = %e, "Failed to load job");
                return JobUpdate::Unavailable;
            }
        };

        let expected = job.status;
        if !mutate(&mut job) {
            return JobUpdate::Unchanged(job);
        }

        match jobs.update_if_status(&job, expected).await {
            Ok(true) => {
                debug!(job_id, from = %expected, to = %job.status, "Job status updated");
                JobUpdate::Written
            }
            Ok(false) => {
                warn!(job_id, expected = %expected, "Job status changed concurrently, write skipped");
                JobUpdate::Conflict
            }
            Err(e) => {
                warn!(job_id, error = %e, "Failed to persist job");
                JobUpdate::Unavailable
            }
        }
    }

    async fn capture_job_error(
        &self,
        message: &DraftJobMessage,
        details: &LlmResponseError,
        attempt: u32,
    ) {
        let Some(job_errors) = &self.job_errors else {
            return;
        };

        let metadata = BTreeMap::from([
            ("worker_id".to_string(), self.worker_id.clone()),
            ("max_retries".to_string(), self.max_retries.to_string()),
            ("retry_count".to_string(), message.retry_count.to_string()),
            ("reason".to_string(), details.reason.clone()),
        ]);
        let record = JobError {
            job_id: message.job_id.clone(),
            user_id: message.user_id.clone(),
            idea_id: Some(message.idea_id.clone()),
            stage: DRAFT_GENERATION.to_string(),
            error: truncate_chars(&details.to_string(), MAX_DIAGNOSTIC_CHARS),
            raw_response: truncate_chars(&details.raw_response, MAX_DIAGNOSTIC_CHARS),
            prompt: truncate_chars(&details.prompt, MAX_DIAGNOSTIC_CHARS),
            attempt,
            metadata,
            created_at: Utc::now(),
        };

        match job_errors.create(&record).await {
            Ok(id) => {
                self.metrics.job_errors_captured.incr();
                info!(job_error_id = %id, reason = %details.reason, "Captured job error");
            }
            Err(e) => warn!(error = %e, "Failed to persist job error"),
        }
    }
}

/// Sanitized, length-capped text stored on a failed job; never empty
fn failure_message(error: &UseCaseError) -> String {
    let message = sanitize_error_message(&error.to_string());
    if message.trim().is_empty() {
        return "draft generation failed".to_string();
    }
    truncate_chars(&message, MAX_JOB_ERROR_CHARS)
}

async fn wait_for_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl MessageHandler for DraftWorker {
    async fn handle(&self, payload: &[u8], cancel: &CancellationToken) -> Result<(), HandlerError> {
        self.process_message(payload, cancel).await.map(|_| ())
    }
}

impl MetricsSource for DraftWorker {
    fn snapshot(&self) -> Snapshot {
        DraftWorker::snapshot(self)
    }
}

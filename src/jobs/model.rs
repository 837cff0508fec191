//! Job, JobError and Draft records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Job type handled by this worker
pub const DRAFT_GENERATION: &str = "draft_generation";

/// Maximum length of `Job::error`, in code points
pub const MAX_JOB_ERROR_CHARS: usize = 2_048;

/// Maximum length of each JobError text field, in code points
pub const MAX_DIAGNOSTIC_CHARS: usize = 20_000;

/// Job lifecycle status.
///
/// Transitions are monotonic: `Pending -> Processing -> {Completed | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One draft-generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    pub idea_id: Option<String>,
    /// Set only on success, in the order the drafts were produced
    #[serde(default)]
    pub draft_ids: Vec<String>,
    /// Last failure message, sanitized and length-capped
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// New pending draft-generation job
    pub fn pending(
        id: impl Into<String>,
        user_id: impl Into<String>,
        idea_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id: user_id.into(),
            job_type: DRAFT_GENERATION.to_string(),
            status: JobStatus::Pending,
            idea_id,
            draft_ids: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// `Pending -> Processing`. Returns false (and changes nothing) from any other state.
    pub fn mark_processing(&mut self) -> bool {
        if !self.status.can_transition_to(JobStatus::Processing) {
            return false;
        }
        let now = Utc::now();
        self.status = JobStatus::Processing;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.updated_at = now;
        true
    }

    /// `Processing -> Completed`, attaching the draft ids and clearing any previous error
    pub fn mark_completed(&mut self, draft_ids: Vec<String>) -> bool {
        if !self.status.can_transition_to(JobStatus::Completed) {
            return false;
        }
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.draft_ids = draft_ids;
        self.error = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        true
    }

    /// `Processing -> Failed` with an error message already capped by the caller
    pub fn mark_failed(&mut self, error: String) -> bool {
        if !self.status.can_transition_to(JobStatus::Failed) {
            return false;
        }
        let now = Utc::now();
        self.status = JobStatus::Failed;
        self.draft_ids.clear();
        self.error = Some(error);
        self.completed_at = Some(now);
        self.updated_at = now;
        true
    }
}

/// Append-only diagnostic record for a terminal structured LLM-response failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub job_id: String,
    pub user_id: String,
    pub idea_id: Option<String>,
    pub stage: String,
    pub error: String,
    pub raw_response: String,
    pub prompt: String,
    /// 1-based attempt number
    pub attempt: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// A generated LinkedIn post draft
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub id: String,
    pub user_id: String,
    pub idea_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Draft {
    pub fn new(
        user_id: impl Into<String>,
        idea_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            idea_id: idea_id.into(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

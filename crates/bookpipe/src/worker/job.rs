use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kinds of background job. At most one run per kind is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    BookGeneration,
    PendingBooksGeneration,
    KdpDataGeneration,
    Upload,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::BookGeneration,
        JobKind::PendingBooksGeneration,
        JobKind::KdpDataGeneration,
        JobKind::Upload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::BookGeneration => "book_generation",
            JobKind::PendingBooksGeneration => "pending_books_generation",
            JobKind::KdpDataGeneration => "kdp_data_generation",
            JobKind::Upload => "upload",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a worker should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSpec {
    GenerateBook {
        prompt: String,
        count: u32,
        book_ids: Vec<String>,
    },
    /// Generates every pending book on the backend; `book_ids` are the local
    /// books expected to be affected.
    GeneratePendingBooks { book_ids: Vec<String> },
    GenerateKdpData { book_ids: Vec<String> },
    UploadBook { book_id: String },
}

impl JobSpec {
    pub fn kind(&self) -> JobKind {
        match self {
            JobSpec::GenerateBook { .. } => JobKind::BookGeneration,
            JobSpec::GeneratePendingBooks { .. } => JobKind::PendingBooksGeneration,
            JobSpec::GenerateKdpData { .. } => JobKind::KdpDataGeneration,
            JobSpec::UploadBook { .. } => JobKind::Upload,
        }
    }

    /// Local books this job acts on.
    pub fn book_ids(&self) -> Vec<String> {
        match self {
            JobSpec::GenerateBook { book_ids, .. }
            | JobSpec::GeneratePendingBooks { book_ids }
            | JobSpec::GenerateKdpData { book_ids } => book_ids.clone(),
            JobSpec::UploadBook { book_id } => vec![book_id.clone()],
        }
    }

    /// Units of work reported in progress.
    pub fn total(&self) -> u32 {
        match self {
            JobSpec::GenerateBook { count, .. } => *count,
            JobSpec::GeneratePendingBooks { book_ids } => book_ids.len() as u32,
            JobSpec::GenerateKdpData { book_ids } => book_ids.len() as u32,
            JobSpec::UploadBook { .. } => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
    /// Stopped locally; the remote outcome is unknown.
    Stopped,
}

impl JobRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobRunStatus::Succeeded | JobRunStatus::Failed | JobRunStatus::Stopped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunStatus::Idle => "idle",
            JobRunStatus::Running => "running",
            JobRunStatus::Succeeded => "succeeded",
            JobRunStatus::Failed => "failed",
            JobRunStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for JobRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of the latest run of one job kind. Only its worker mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub job_id: Option<String>,
    pub kind: JobKind,
    pub status: JobRunStatus,
    pub current_step: Option<String>,
    pub processed_count: u32,
    pub total_count: u32,
    pub success_count: u32,
    pub failure_count: u32,
    pub logs: VecDeque<String>,
    /// Log lines evicted once `logs` reached capacity.
    pub dropped_logs: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    #[serde(skip)]
    log_capacity: usize,
}

impl JobRun {
    pub fn idle(kind: JobKind, log_capacity: usize) -> Self {
        Self {
            job_id: None,
            kind,
            status: JobRunStatus::Idle,
            current_step: None,
            processed_count: 0,
            total_count: 0,
            success_count: 0,
            failure_count: 0,
            logs: VecDeque::new(),
            dropped_logs: 0,
            started_at: None,
            duration_ms: None,
            log_capacity: log_capacity.max(1),
        }
    }

    /// Resets the run for a new invocation.
    pub(crate) fn begin(&mut self, job_id: &str, total: u32) {
        let capacity = self.log_capacity;
        *self = Self::idle(self.kind, capacity);
        self.job_id = Some(job_id.to_string());
        self.status = JobRunStatus::Running;
        self.total_count = total;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn push_log(&mut self, line: String) {
        if self.logs.len() >= self.log_capacity {
            self.logs.pop_front();
            self.dropped_logs += 1;
        }
        self.logs.push_back(line);
    }

    /// Applies progress. Counters never decrease within a run.
    pub(crate) fn apply_progress(&mut self, progress: &JobProgress) {
        self.processed_count = self.processed_count.max(progress.processed);
        self.total_count = self.total_count.max(progress.total);
        if let Some(step) = &progress.step {
            self.current_step = Some(step.clone());
        }
    }

    pub(crate) fn finish(&mut self, result: &JobResult) {
        self.status = result.status;
        self.processed_count = self.processed_count.max(result.processed);
        self.total_count = self.total_count.max(result.total);
        self.success_count = result.success_count;
        self.failure_count = result.failure_count;
        self.current_step = None;
        self.duration_ms = self
            .started_at
            .map(|start| (Utc::now() - start).num_milliseconds().max(0) as u64);
    }

    pub fn is_running(&self) -> bool {
        self.status == JobRunStatus::Running
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub processed: u32,
    pub total: u32,
    pub step: Option<String>,
}

/// Outcome of one book within a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub book_id: String,
    pub success: bool,
    pub error: Option<String>,
}

impl ItemOutcome {
    pub fn succeeded(book_id: impl Into<String>) -> Self {
        Self {
            book_id: book_id.into(),
            success: true,
            error: None,
        }
    }

    pub fn failed(book_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            book_id: book_id.into(),
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Terminal report of a run. Always emitted, including on failure and stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub kind: JobKind,
    pub status: JobRunStatus,
    pub processed: u32,
    pub total: u32,
    pub success_count: u32,
    pub failure_count: u32,
    /// Per-book outcomes, when the backend's answer allows attributing them.
    pub items: Vec<ItemOutcome>,
    pub message: Option<String>,
    pub error: Option<String>,
    /// The backend rejected the KDP session.
    pub requires_reauth: bool,
}

impl JobResult {
    pub(crate) fn new(job_id: &str, kind: JobKind, status: JobRunStatus, total: u32) -> Self {
        Self {
            job_id: job_id.to_string(),
            kind,
            status,
            processed: 0,
            total,
            success_count: 0,
            failure_count: 0,
            items: Vec::new(),
            message: None,
            error: None,
            requires_reauth: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobRunStatus::Succeeded
    }

    pub fn outcome_for(&self, book_id: &str) -> Option<&ItemOutcome> {
        self.items.iter().find(|item| item.book_id == book_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Progress(JobProgress),
    Log(String),
    Finished(JobResult),
}

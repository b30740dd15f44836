use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::RemoteQueueEntry;
use crate::worker::JobKind;

use super::error::PipelineError;

/// Lifecycle position of a book. Ordered by progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookStatus {
    Pending,
    Review,
    Uploaded,
}

impl BookStatus {
    /// Parses a queue status, ignoring case and surrounding whitespace.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(BookStatus::Pending),
            "review" => Some(BookStatus::Review),
            "uploaded" => Some(BookStatus::Uploaded),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookStatus::Pending => "pending",
            BookStatus::Review => "review",
            BookStatus::Uploaded => "uploaded",
        }
    }

    /// The status one step further, if any.
    pub fn next(&self) -> Option<Self> {
        match self {
            BookStatus::Pending => Some(BookStatus::Review),
            BookStatus::Review => Some(BookStatus::Uploaded),
            BookStatus::Uploaded => None,
        }
    }
}

impl fmt::Display for BookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optimistic "in progress" marker awaiting confirmation by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provisional {
    pub target: BookStatus,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub niche: Option<String>,
    #[serde(default)]
    pub target_audience: Option<String>,
    #[serde(default)]
    pub word_count: Option<u32>,
    #[serde(default)]
    pub chapters: Option<u32>,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub manuscript_filename: Option<String>,
    #[serde(default)]
    pub cover_filename: Option<String>,
    #[serde(default)]
    pub proofread_report: Option<String>,
    #[serde(default)]
    pub kdp_form_data: BTreeMap<String, serde_json::Value>,
    status: BookStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    failed_stage: Option<JobKind>,
    /// Error the queue reported at the last merge.
    #[serde(default)]
    remote_error: Option<String>,
    #[serde(default)]
    provisional: Option<Provisional>,
    #[serde(default)]
    kdp_data_ready: bool,
    #[serde(default)]
    regeneration_requested: bool,
    /// UI hints, not authoritative.
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub estimated_time: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Book {
    /// A new pending book created locally from a prompt.
    pub fn new(title: impl Into<String>, prompt: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            prompt,
            niche: None,
            target_audience: None,
            word_count: None,
            chapters: None,
            author_name: None,
            price: None,
            manuscript_filename: None,
            cover_filename: None,
            proofread_report: None,
            kdp_form_data: BTreeMap::new(),
            status: BookStatus::Pending,
            error: None,
            failed_stage: None,
            remote_error: None,
            provisional: None,
            kdp_data_ready: false,
            regeneration_requested: false,
            progress: None,
            estimated_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A book first seen in the remote queue.
    pub fn from_remote(entry: &RemoteQueueEntry, status: BookStatus) -> Self {
        let mut book = Self::new(entry.title.clone(), None);
        if let Some(id) = entry.id.as_deref().filter(|id| !id.is_empty()) {
            book.id = id.to_string();
        }
        book.status = status;
        book.apply_remote_fields(entry);
        book
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> BookStatus {
        self.status
    }

    /// Status to show: the provisional target while one is pending.
    pub fn display_status(&self) -> BookStatus {
        self.provisional
            .as_ref()
            .map(|p| p.target)
            .unwrap_or(self.status)
    }

    pub fn provisional(&self) -> Option<&Provisional> {
        self.provisional.as_ref()
    }

    pub fn failed_stage(&self) -> Option<JobKind> {
        self.failed_stage
    }

    pub fn remote_error(&self) -> Option<&str> {
        self.remote_error.as_deref()
    }

    pub fn kdp_data_ready(&self) -> bool {
        self.kdp_data_ready
    }

    pub fn regeneration_requested(&self) -> bool {
        self.regeneration_requested
    }

    /// Moves exactly one step forward. Staying put is a no-op.
    pub fn advance_to(&mut self, target: BookStatus) -> Result<(), PipelineError> {
        if target == self.status {
            return Ok(());
        }
        if self.status.next() != Some(target) {
            return Err(self.invalid(target));
        }
        self.status = target;
        if target == BookStatus::Review {
            self.regeneration_requested = false;
        }
        Ok(())
    }

    /// The only backward move: Review back to Pending for regeneration.
    pub fn request_regeneration(&mut self) -> Result<(), PipelineError> {
        if self.status != BookStatus::Review {
            return Err(self.invalid(BookStatus::Pending));
        }
        self.status = BookStatus::Pending;
        self.regeneration_requested = true;
        self.kdp_data_ready = false;
        self.clear_error();
        Ok(())
    }

    /// The backend regenerated the book; the next Review may be accepted.
    pub(crate) fn complete_regeneration(&mut self) {
        self.regeneration_requested = false;
    }

    pub fn mark_provisional(&mut self, target: BookStatus) {
        self.provisional = Some(Provisional {
            target,
            since: Utc::now(),
        });
    }

    /// Clears the marker if the status reached its target. Returns true if it did.
    pub fn confirm_provisional(&mut self) -> bool {
        match &self.provisional {
            Some(p) if self.status >= p.target => {
                self.provisional = None;
                true
            }
            _ => false,
        }
    }

    pub fn revert_provisional(&mut self) -> Option<Provisional> {
        self.provisional.take()
    }

    pub fn mark_failed(&mut self, stage: JobKind, error: impl Into<String>) {
        self.error = Some(error.into());
        self.failed_stage = Some(stage);
    }

    pub fn clear_error(&mut self) {
        self.error = None;
        self.failed_stage = None;
    }

    pub(crate) fn set_kdp_data_ready(&mut self) {
        self.kdp_data_ready = true;
    }

    /// Copies descriptive fields the remote entry carries. Status is merged
    /// separately and first: a remote error is charged to the stage the
    /// merged status points at.
    pub fn apply_remote_fields(&mut self, entry: &RemoteQueueEntry) {
        if !entry.title.is_empty() {
            self.title = entry.title.clone();
        }
        fn copy<T: Clone>(target: &mut Option<T>, source: &Option<T>) {
            if source.is_some() {
                *target = source.clone();
            }
        }
        copy(&mut self.niche, &entry.niche);
        copy(&mut self.target_audience, &entry.target_audience);
        copy(&mut self.word_count, &entry.word_count);
        copy(&mut self.chapters, &entry.chapters);
        copy(&mut self.author_name, &entry.author_name);
        copy(&mut self.price, &entry.price);
        copy(&mut self.manuscript_filename, &entry.manuscript_filename);
        copy(&mut self.cover_filename, &entry.cover_filename);
        copy(&mut self.proofread_report, &entry.proofread_report);

        if let Some(form) = entry.kdp_form_data.as_ref().filter(|f| !f.is_empty()) {
            self.kdp_form_data = form.clone();
            if entry.error.as_deref().map_or(true, |e| e.trim().is_empty()) {
                self.kdp_data_ready = true;
            }
        }

        let remote_error = entry
            .error
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string);
        let previous = std::mem::replace(&mut self.remote_error, remote_error.clone());
        match remote_error {
            Some(error) => {
                if self.failed_stage.is_none() {
                    self.failed_stage = self.stage_for_remote_error();
                }
                self.error = Some(error);
            }
            // The queue dropped an error it reported before.
            None if previous.is_some() && self.error == previous => self.clear_error(),
            None => {}
        }
    }

    /// The stage a queue-reported error belongs to, given the current status.
    fn stage_for_remote_error(&self) -> Option<JobKind> {
        match self.status {
            BookStatus::Pending => Some(JobKind::PendingBooksGeneration),
            BookStatus::Review if self.kdp_data_ready => Some(JobKind::Upload),
            BookStatus::Review => Some(JobKind::KdpDataGeneration),
            BookStatus::Uploaded => None,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn invalid(&self, to: BookStatus) -> PipelineError {
        PipelineError::InvalidTransition {
            book_id: self.id.clone(),
            from: self.status,
            to,
        }
    }
}

//! Job progress broadcaster for real-time job status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::worker::{JobKind, JobResult, JobRunStatus};

/// Phase of a job run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Queued,
    Submitting,
    Retrying,
    Completed,
    Failed,
    Stopped,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Queued => write!(f, "Queued"),
            JobPhase::Submitting => write!(f, "Submitting"),
            JobPhase::Retrying => write!(f, "Retrying"),
            JobPhase::Completed => write!(f, "Completed"),
            JobPhase::Failed => write!(f, "Failed"),
            JobPhase::Stopped => write!(f, "Stopped"),
        }
    }
}

impl From<JobRunStatus> for JobPhase {
    fn from(status: JobRunStatus) -> Self {
        match status {
            JobRunStatus::Succeeded => JobPhase::Completed,
            JobRunStatus::Failed => JobPhase::Failed,
            JobRunStatus::Stopped => JobPhase::Stopped,
            JobRunStatus::Idle | JobRunStatus::Running => JobPhase::Submitting,
        }
    }
}

/// Progress event for a job run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    pub job_id: String,
    pub kind: JobKind,
    pub phase: JobPhase,
    pub message: String,
    pub processed: u32,
    pub total: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobProgressEvent {
    pub fn new(job_id: &str, kind: JobKind, phase: JobPhase, message: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            kind,
            phase,
            message: message.to_string(),
            processed: 0,
            total: 0,
            timestamp: Utc::now(),
            success_count: None,
            failure_count: None,
            error: None,
        }
    }

    /// Terminal event mirroring a [`JobResult`].
    pub fn finished(result: &JobResult) -> Self {
        let message = result
            .message
            .clone()
            .unwrap_or_else(|| format!("Job {}", result.status));
        Self {
            job_id: result.job_id.clone(),
            kind: result.kind,
            phase: result.status.into(),
            message,
            processed: result.processed,
            total: result.total,
            timestamp: Utc::now(),
            success_count: Some(result.success_count),
            failure_count: Some(result.failure_count),
            error: result.error.clone(),
        }
    }
}

/// Broadcasts job progress events for streaming.
#[derive(Clone)]
pub struct JobProgressBroadcaster {
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: JobProgressEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.sender.subscribe()
    }

    /// Creates a tracker for one run and announces it as queued.
    pub fn start_job(&self, job_id: &str, kind: JobKind, total: u32) -> JobProgressTracker {
        let tracker = JobProgressTracker {
            job_id: job_id.to_string(),
            kind,
            total,
            sender: Arc::clone(&self.sender),
        };
        tracker.update(JobPhase::Queued, 0, "Job queued");
        tracker
    }
}

impl Default for JobProgressBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Tracks progress for a single run.
pub struct JobProgressTracker {
    job_id: String,
    kind: JobKind,
    total: u32,
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressTracker {
    pub fn update(&self, phase: JobPhase, processed: u32, message: &str) {
        let mut event = JobProgressEvent::new(&self.job_id, self.kind, phase, message);
        event.processed = processed;
        event.total = self.total;
        let _ = self.sender.send(event);
    }

    pub fn finished(&self, result: &JobResult) {
        let _ = self.sender.send(JobProgressEvent::finished(result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_job_announces_queued() {
        let broadcaster = JobProgressBroadcaster::new(10);
        let mut rx = broadcaster.subscribe();

        let tracker = broadcaster.start_job("job-1", JobKind::KdpDataGeneration, 5);
        let received = rx.try_recv().unwrap();
        assert_eq!(received.job_id, "job-1");
        assert_eq!(received.phase, JobPhase::Queued);
        assert_eq!(received.total, 5);

        tracker.update(JobPhase::Submitting, 2, "Submitting 5 books");
        let received = rx.try_recv().unwrap();
        assert_eq!(received.phase, JobPhase::Submitting);
        assert_eq!(received.processed, 2);
        assert_eq!(received.message, "Submitting 5 books");
    }

    #[test]
    fn test_finished_event_carries_counts() {
        let broadcaster = JobProgressBroadcaster::new(10);
        let mut rx = broadcaster.subscribe();
        let tracker = broadcaster.start_job("job-2", JobKind::KdpDataGeneration, 5);
        let _ = rx.try_recv();

        let mut result =
            JobResult::new("job-2", JobKind::KdpDataGeneration, JobRunStatus::Succeeded, 5);
        result.processed = 5;
        result.success_count = 3;
        result.failure_count = 2;
        tracker.finished(&result);

        let received = rx.try_recv().unwrap();
        assert_eq!(received.phase, JobPhase::Completed);
        assert_eq!(received.success_count, Some(3));
        assert_eq!(received.failure_count, Some(2));
    }

    #[test]
    fn test_send_without_subscribers_is_ignored() {
        let broadcaster = JobProgressBroadcaster::default();
        broadcaster.send(JobProgressEvent::new("x", JobKind::Upload, JobPhase::Failed, "boom"));
    }
}

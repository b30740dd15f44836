use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;

use crate::api::PublishingApi;
use crate::broadcast::JobProgressBroadcaster;
use crate::error::WorkerError;
use crate::retry::RetryPolicy;

use super::job::{JobKind, JobRun, JobSpec};
use super::runner::{JobStream, JobWorker};

/// One [`JobWorker`] per [`JobKind`].
pub struct WorkerRegistry {
    workers: BTreeMap<JobKind, JobWorker>,
}

impl WorkerRegistry {
    /// Creates a worker for every job kind sharing one API client and policy.
    pub fn new(
        api: Arc<dyn PublishingApi>,
        policy: RetryPolicy,
        log_capacity: usize,
        progress: Option<JobProgressBroadcaster>,
    ) -> Self {
        let workers = JobKind::ALL
            .into_iter()
            .map(|kind| {
                let mut worker =
                    JobWorker::new(kind, Arc::clone(&api), policy.clone(), log_capacity);
                if let Some(broadcaster) = &progress {
                    worker = worker.with_progress(broadcaster.clone());
                }
                (kind, worker)
            })
            .collect();
        info!("Registered workers for {} job kinds", JobKind::ALL.len());
        Self { workers }
    }

    pub fn get(&self, kind: JobKind) -> Result<&JobWorker, WorkerError> {
        self.workers.get(&kind).ok_or(WorkerError::NotRegistered(kind))
    }

    /// Routes the spec to the worker of its kind.
    pub fn start(&self, spec: JobSpec) -> Result<JobStream, WorkerError> {
        self.get(spec.kind())?.start(spec)
    }

    pub fn stop(&self, kind: JobKind) -> bool {
        self.workers.get(&kind).is_some_and(|w| w.stop())
    }

    /// Stops every active run. Returns the kinds that were running.
    pub fn stop_all(&self) -> Vec<JobKind> {
        self.workers
            .iter()
            .filter(|(_, worker)| worker.stop())
            .map(|(kind, _)| *kind)
            .collect()
    }

    pub fn snapshot(&self, kind: JobKind) -> Result<JobRun, WorkerError> {
        Ok(self.get(kind)?.snapshot())
    }

    pub fn running(&self) -> Vec<JobKind> {
        self.workers
            .iter()
            .filter(|(_, worker)| worker.is_running())
            .map(|(kind, _)| *kind)
            .collect()
    }
}

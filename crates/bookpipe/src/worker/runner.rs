//! Background execution of one job kind.
//!
//! A [`JobWorker`] owns the [`JobRun`] of its kind and talks to callers only
//! through the [`JobStream`] returned by [`JobWorker::start`]. The remote call
//! itself runs on its own task so that [`JobWorker::stop`] can end local
//! reporting without aborting the request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tracing::{info_span, Instrument};

use crate::api::{ApiError, BulkKdpResponse, GenerateBookRequest, GenerationSummary, PublishingApi};
use crate::broadcast::{JobPhase, JobProgressBroadcaster, JobProgressTracker};
use crate::error::WorkerError;
use crate::retry::{RetryError, RetryPolicy};

use super::job::{
    ItemOutcome, JobEvent, JobKind, JobProgress, JobResult, JobRun, JobRunStatus, JobSpec,
};

struct ActiveRun {
    job_id: String,
    cancel: watch::Sender<bool>,
}

/// Executes jobs of a single kind, one run at a time.
pub struct JobWorker {
    kind: JobKind,
    api: Arc<dyn PublishingApi>,
    policy: RetryPolicy,
    run: Arc<RwLock<JobRun>>,
    active: Arc<Mutex<Option<ActiveRun>>>,
    progress: Option<JobProgressBroadcaster>,
}

impl JobWorker {
    pub fn new(
        kind: JobKind,
        api: Arc<dyn PublishingApi>,
        policy: RetryPolicy,
        log_capacity: usize,
    ) -> Self {
        Self {
            kind,
            api,
            policy,
            run: Arc::new(RwLock::new(JobRun::idle(kind, log_capacity))),
            active: Arc::new(Mutex::new(None)),
            progress: None,
        }
    }

    /// Mirrors progress onto a broadcaster for UI streaming.
    pub fn with_progress(mut self, broadcaster: JobProgressBroadcaster) -> Self {
        self.progress = Some(broadcaster);
        self
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Starts a run. A second start while a run is active is rejected.
    pub fn start(&self, spec: JobSpec) -> Result<JobStream, WorkerError> {
        if spec.kind() != self.kind {
            return Err(WorkerError::KindMismatch {
                worker: self.kind,
                spec: spec.kind(),
            });
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.is_some() || self.snapshot().is_running() {
            return Err(WorkerError::AlreadyRunning(self.kind));
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        let total = spec.total();
        self.run
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .begin(&job_id, total);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        *active = Some(ActiveRun {
            job_id: job_id.clone(),
            cancel: cancel_tx,
        });
        drop(active);

        let tracker = self
            .progress
            .as_ref()
            .map(|b| Arc::new(b.start_job(&job_id, self.kind, total)));

        let ctx = RunContext {
            job_id: job_id.clone(),
            kind: self.kind,
            total,
            run: Arc::clone(&self.run),
            active: Arc::clone(&self.active),
            events: events_tx,
            stopped: Arc::new(AtomicBool::new(false)),
            tracker,
        };

        info!("Starting {} job {}", self.kind, job_id);
        runtime.spawn(execute(
            ctx,
            Arc::clone(&self.api),
            self.policy.clone(),
            spec,
            cancel_rx,
        ));

        Ok(JobStream {
            job_id,
            kind: self.kind,
            events: events_rx,
        })
    }

    /// Requests a cooperative stop. Returns false if nothing was running.
    pub fn stop(&self) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.as_ref() {
            Some(run) => {
                info!("Stopping {} job {}", self.kind, run.job_id);
                let _ = run.cancel.send(true);
                true
            }
            None => false,
        }
    }

    /// Copy of the current run state.
    pub fn snapshot(&self) -> JobRun {
        self.run
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_running(&self) -> bool {
        self.snapshot().is_running()
    }
}

/// Events of one run, ending with exactly one [`JobEvent::Finished`].
pub struct JobStream {
    job_id: String,
    kind: JobKind,
    events: mpsc::UnboundedReceiver<JobEvent>,
}

impl JobStream {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub async fn next(&mut self) -> Option<JobEvent> {
        self.events.recv().await
    }

    /// Drains the stream and returns the terminal result.
    pub async fn finished(mut self) -> JobResult {
        while let Some(event) = self.events.recv().await {
            if let JobEvent::Finished(result) = event {
                return result;
            }
        }
        // The run task went away without reporting.
        let mut result =
            JobResult::new(&self.job_id, self.kind, JobRunStatus::Failed, 0);
        result.error = Some(WorkerError::ChannelClosed.to_string());
        result
    }
}

#[derive(Clone)]
struct RunContext {
    job_id: String,
    kind: JobKind,
    total: u32,
    run: Arc<RwLock<JobRun>>,
    active: Arc<Mutex<Option<ActiveRun>>>,
    events: mpsc::UnboundedSender<JobEvent>,
    /// Set once the run was stopped; later reports are dropped.
    stopped: Arc<AtomicBool>,
    tracker: Option<Arc<JobProgressTracker>>,
}

impl RunContext {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn with_own_run(&self, f: impl FnOnce(&mut JobRun)) {
        let mut run = self.run.write().unwrap_or_else(PoisonError::into_inner);
        if run.job_id.as_deref() == Some(self.job_id.as_str()) {
            f(&mut run);
        }
    }

    fn log(&self, line: impl Into<String>) {
        if self.is_stopped() {
            return;
        }
        let line = line.into();
        debug!("[{} {}] {}", self.kind, self.job_id, line);
        self.with_own_run(|run| run.push_log(line.clone()));
        let _ = self.events.send(JobEvent::Log(line));
    }

    fn progress(&self, processed: u32, phase: JobPhase, step: &str) {
        if self.is_stopped() {
            return;
        }
        let progress = JobProgress {
            processed,
            total: self.total,
            step: Some(step.to_string()),
        };
        self.with_own_run(|run| run.apply_progress(&progress));
        if let Some(tracker) = &self.tracker {
            tracker.update(phase, processed, step);
        }
        let _ = self.events.send(JobEvent::Progress(progress));
    }

    fn result(&self, status: JobRunStatus) -> JobResult {
        JobResult::new(&self.job_id, self.kind, status, self.total)
    }

    fn failure(&self, error: &RetryError, book_ids: &[String]) -> JobResult {
        let mut result = self.result(JobRunStatus::Failed);
        let message = error.to_string();
        result.failure_count = book_ids.len() as u32;
        result.items = book_ids
            .iter()
            .map(|id| ItemOutcome::failed(id.clone(), message.clone()))
            .collect();
        result.requires_reauth = error.is_auth_error();
        result.error = Some(message);
        result
    }

    fn stopped_result(&self) -> JobResult {
        let mut result = self.result(JobRunStatus::Stopped);
        let run = self.run.read().unwrap_or_else(PoisonError::into_inner);
        if run.job_id.as_deref() == Some(self.job_id.as_str()) {
            result.processed = run.processed_count;
            result.success_count = run.success_count;
            result.failure_count = run.failure_count;
        }
        result.message = Some("Stopped; remote outcome unknown".to_string());
        result
    }

    fn on_retry(&self, attempt: u32, error: &ApiError) {
        self.log(format!("Attempt {} failed, retrying: {}", attempt, error));
        self.progress(0, JobPhase::Retrying, "Retrying after transient error");
    }

    /// Publishes the terminal result. The run is marked terminal before
    /// `Finished` is sent so a caller reacting to it can start a new run.
    fn finish(&self, result: JobResult) {
        {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            self.with_own_run(|run| {
                run.push_log(format!("Job {}", result.status));
                run.finish(&result);
            });
            if active.as_ref().is_some_and(|a| a.job_id == self.job_id) {
                *active = None;
            }
        }
        if let Some(tracker) = &self.tracker {
            tracker.finished(&result);
        }
        info!(
            "{} job {} finished: {} ({} ok, {} failed)",
            self.kind, self.job_id, result.status, result.success_count, result.failure_count
        );
        let _ = self.events.send(JobEvent::Finished(result));
    }
}

async fn execute(
    ctx: RunContext,
    api: Arc<dyn PublishingApi>,
    policy: RetryPolicy,
    spec: JobSpec,
    mut cancel: watch::Receiver<bool>,
) {
    let span = info_span!("job_run", kind = %ctx.kind, job_id = %ctx.job_id);
    async move {
        ctx.log(format!("Starting {} job", ctx.kind));
        let mut remote = tokio::spawn(perform(ctx.clone(), api, policy, spec));

        let result = tokio::select! {
            joined = &mut remote => match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!("{} job {} task failed: {}", ctx.kind, ctx.job_id, e);
                    let mut result = ctx.result(JobRunStatus::Failed);
                    result.error = Some(format!("Job task failed: {}", e));
                    result
                }
            },
            _ = cancelled(&mut cancel) => {
                ctx.log("Stop requested");
                ctx.stopped.store(true, Ordering::SeqCst);
                ctx.stopped_result()
            }
        };

        ctx.finish(result);
    }
    .instrument(span)
    .await
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Worker dropped; the run can no longer be stopped.
            std::future::pending::<()>().await;
        }
    }
}

async fn perform(
    ctx: RunContext,
    api: Arc<dyn PublishingApi>,
    policy: RetryPolicy,
    spec: JobSpec,
) -> JobResult {
    match spec {
        JobSpec::GenerateBook {
            prompt,
            count,
            book_ids,
        } => {
            ctx.progress(0, JobPhase::Submitting, "Submitting generation request");
            let request = GenerateBookRequest {
                prompt,
                n: count,
                book_ids: book_ids.clone(),
            };
            let response = policy
                .run_with_notify(
                    "generate-book",
                    |_| api.generate_book(&request),
                    |attempt, err| ctx.on_retry(attempt, err),
                )
                .await;
            match response {
                Ok(summary) => summary_result(&ctx, &summary, &book_ids),
                Err(e) => ctx.failure(&e, &book_ids),
            }
        }
        JobSpec::GeneratePendingBooks { book_ids } => {
            ctx.progress(0, JobPhase::Submitting, "Generating pending books");
            let response = policy
                .run_with_notify(
                    "generate-pending-books",
                    |_| api.generate_pending_books(),
                    |attempt, err| ctx.on_retry(attempt, err),
                )
                .await;
            match response {
                Ok(summary) => summary_result(&ctx, &summary, &book_ids),
                Err(e) => ctx.failure(&e, &book_ids),
            }
        }
        JobSpec::GenerateKdpData { book_ids } => {
            ctx.progress(
                0,
                JobPhase::Submitting,
                &format!("Generating KDP data for {} book(s)", book_ids.len()),
            );
            let response = policy
                .run_with_notify(
                    "bulk/generate-kdp-data",
                    |_| api.generate_kdp_data(&book_ids),
                    |attempt, err| ctx.on_retry(attempt, err),
                )
                .await;
            match response {
                Ok(bulk) => bulk_result(&ctx, &bulk, &book_ids),
                Err(e) => ctx.failure(&e, &book_ids),
            }
        }
        JobSpec::UploadBook { book_id } => {
            ctx.progress(0, JobPhase::Submitting, "Uploading book to KDP");
            let response = policy
                .run_with_notify(
                    "upload-book",
                    |_| api.upload_book(&book_id),
                    |attempt, err| ctx.on_retry(attempt, err),
                )
                .await;
            match response {
                Ok(upload) => {
                    ctx.progress(1, JobPhase::Submitting, "Upload answered");
                    let title = upload.book_title.as_deref().unwrap_or(&book_id);
                    let mut result;
                    if upload.success {
                        ctx.log(format!("Uploaded '{}'", title));
                        result = ctx.result(JobRunStatus::Succeeded);
                        result.success_count = 1;
                        result.items = vec![ItemOutcome::succeeded(book_id.clone())];
                    } else {
                        ctx.log(format!("Upload of '{}' rejected: {}", title, upload.message));
                        result = ctx.result(JobRunStatus::Failed);
                        result.failure_count = 1;
                        result.items = vec![ItemOutcome::failed(book_id.clone(), upload.message.clone())];
                        result.error = Some(upload.message.clone());
                    }
                    result.processed = 1;
                    result.message = Some(upload.message);
                    result
                }
                Err(e) => ctx.failure(&e, &[book_id]),
            }
        }
    }
}

fn summary_result(ctx: &RunContext, summary: &GenerationSummary, book_ids: &[String]) -> JobResult {
    let (processed, succeeded, failed) = summary.resolve_counts(ctx.total);
    ctx.progress(processed, JobPhase::Submitting, "Generation answered");
    ctx.log(format!(
        "Processed {}/{} book(s): {} succeeded, {} failed",
        processed, ctx.total, succeeded, failed
    ));

    let status = if succeeded == 0 && failed > 0 {
        JobRunStatus::Failed
    } else {
        JobRunStatus::Succeeded
    };
    let mut result = ctx.result(status);
    result.processed = processed;
    result.success_count = succeeded;
    result.failure_count = failed;
    result.items = attribute_counts(ctx, book_ids, succeeded, failed, None);
    result.message = summary.message.clone();
    if status == JobRunStatus::Failed {
        result.error = Some(
            summary
                .message
                .clone()
                .unwrap_or_else(|| "Generation failed for every book".to_string()),
        );
    }
    result
}

fn bulk_result(ctx: &RunContext, bulk: &BulkKdpResponse, book_ids: &[String]) -> JobResult {
    let (succeeded, failed, items) = if bulk.results.is_empty() {
        let items = attribute_counts(
            ctx,
            book_ids,
            bulk.success_count,
            bulk.error_count,
            Some("KDP data generation failed"),
        );
        (bulk.success_count, bulk.error_count, items)
    } else {
        let items: Vec<ItemOutcome> = bulk
            .results
            .iter()
            .map(|r| ItemOutcome {
                book_id: r.book_id.clone(),
                success: r.success,
                error: if r.success {
                    None
                } else {
                    Some(r.error.clone().unwrap_or_else(|| "KDP data generation failed".to_string()))
                },
            })
            .collect();
        let succeeded = items.iter().filter(|i| i.success).count() as u32;
        let failed = items.len() as u32 - succeeded;
        (succeeded, failed, items)
    };

    let processed = succeeded.saturating_add(failed);
    ctx.progress(processed, JobPhase::Submitting, "KDP data generation answered");
    ctx.log(format!(
        "KDP data generated for {} of {} book(s), {} failed",
        succeeded,
        book_ids.len(),
        failed
    ));

    // An answer without any count says nothing about the books.
    let status = if succeeded == 0 && failed > 0 {
        JobRunStatus::Failed
    } else {
        JobRunStatus::Succeeded
    };
    let mut result = ctx.result(status);
    result.processed = processed;
    result.success_count = succeeded;
    result.failure_count = failed;
    result.items = items;
    if processed == 0 && !book_ids.is_empty() {
        result.message = Some("No per-book outcome reported".to_string());
    }
    if status == JobRunStatus::Failed {
        result.error = Some("KDP data generation failed for every book".to_string());
    }
    result
}

/// Derives per-book outcomes from aggregate counts. Only a batch whose counts
/// cover every submitted book in one direction is attributed; anything else
/// is left to reconciliation.
fn attribute_counts(
    ctx: &RunContext,
    book_ids: &[String],
    succeeded: u32,
    failed: u32,
    failure_message: Option<&str>,
) -> Vec<ItemOutcome> {
    if book_ids.is_empty() {
        return Vec::new();
    }
    let submitted = book_ids.len();
    if failed == 0 && succeeded as usize == submitted {
        return book_ids.iter().cloned().map(ItemOutcome::succeeded).collect();
    }
    if succeeded == 0 && failed as usize == submitted {
        let message = failure_message.unwrap_or("Generation failed");
        return book_ids
            .iter()
            .map(|id| ItemOutcome::failed(id.clone(), message))
            .collect();
    }
    ctx.log(format!(
        "{} succeeded and {} failed of {} book(s) without per-book results; outcomes left to reconciliation",
        succeeded, failed, submitted
    ));
    Vec::new()
}

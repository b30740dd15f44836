//! Public entry points of the book pipeline.
//!
//! Every stage trigger follows the same order: validate the book, claim it in
//! the in-flight set, pass the session gate, then hand the job to its worker.
//! The returned [`StageTask`] completes once the outcome has been written back
//! to the books and the queue reconciled. Stage failures never escape as
//! errors from the task; they end up on the affected books.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info_span, Instrument};

use crate::api::{HttpPublishingApi, KdpCredentials, PublishingApi};
use crate::broadcast::{
    BookEvent, JobProgressBroadcaster, JobProgressEvent, SessionEvent, SessionEventBroadcaster,
};
use crate::config::schema::{CredentialSettings, Settings};
use crate::db::run_repo::{self, RunRow};
use crate::db::Database;
use crate::error::{BookpipeError, WorkerError};
use crate::retry::RetryPolicy;
use crate::session::{
    ExternalSession, KvSessionStore, MemorySessionStore, ProbeOutcome, SessionGate, SessionStore,
    StatusProbe,
};
use crate::worker::{
    ItemOutcome, JobKind, JobResult, JobRun, JobRunStatus, JobSpec, JobStream, WorkerRegistry,
};

use super::book::{Book, BookStatus};
use super::book_store::BookStore;
use super::error::PipelineError;
use super::in_flight::{InFlightGuard, InFlightRegistry};
use super::sync::QueueSynchronizer;
use super::sync_scheduler::SyncScheduler;

const MAX_TITLE_CHARS: usize = 120;

/// What happened to a stage trigger.
#[derive(Debug)]
pub enum StageStart {
    Started(StageTask),
    /// Some of the books already have a stage running; nothing was submitted.
    AlreadyInFlight { book_ids: Vec<String> },
    /// The worker for this kind is running another job.
    WorkerBusy(JobKind),
}

impl StageStart {
    pub fn is_started(&self) -> bool {
        matches!(self, StageStart::Started(_))
    }

    pub fn task(self) -> Option<StageTask> {
        match self {
            StageStart::Started(task) => Some(task),
            _ => None,
        }
    }
}

/// Handle on a running stage.
#[derive(Debug)]
pub struct StageTask {
    job_id: String,
    kind: JobKind,
    handle: JoinHandle<StageOutcome>,
}

impl StageTask {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Waits until the outcome is applied to the books.
    pub async fn wait(self) -> StageOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("{} stage {} task failed: {}", self.kind, self.job_id, e);
                let mut result = JobResult::new(&self.job_id, self.kind, JobRunStatus::Failed, 0);
                result.error = Some(format!("Stage task failed: {}", e));
                StageOutcome {
                    kind: self.kind,
                    result,
                    reconciled: false,
                    books: Vec::new(),
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub kind: JobKind,
    pub result: JobResult,
    /// Whether the queue reconciliation after the job succeeded.
    pub reconciled: bool,
    /// The affected books after the outcome was applied.
    pub books: Vec<Book>,
}

enum Stage {
    Generation,
    FullGeneration { book_id: String },
    KdpData,
    Upload { book_id: String },
}

enum Launch {
    Started {
        stream: JobStream,
        guard: InFlightGuard,
    },
    Refused(StageStart),
    /// The worker became busy between the check and the start, after
    /// `prepare` already ran.
    Raced,
}

struct Inner {
    store: Arc<BookStore>,
    gate: SessionGate,
    workers: WorkerRegistry,
    sync: Arc<QueueSynchronizer>,
    in_flight: InFlightRegistry,
    jobs: JobProgressBroadcaster,
    settle_delay: Duration,
    sync_interval: Option<Duration>,
    credentials: Option<CredentialSettings>,
    history: Option<Database>,
}

/// Drives books through generation, KDP data and upload.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    inner: Arc<Inner>,
}

impl PipelineOrchestrator {
    pub fn new(
        api: Arc<dyn PublishingApi>,
        books: Arc<BookStore>,
        sessions: Arc<dyn SessionStore>,
        settings: &Settings,
        history: Option<Database>,
    ) -> Self {
        let retry = RetryPolicy::from_settings(&settings.retry);
        let probe = StatusProbe::new(
            Arc::clone(&api),
            Arc::clone(&sessions),
            RetryPolicy::from_settings(&settings.probe),
            settings.session.ttl(),
            SessionEventBroadcaster::default(),
        );
        let gate = SessionGate::new(probe, sessions, Arc::clone(&api), retry.clone());
        let jobs = JobProgressBroadcaster::default();
        let workers = WorkerRegistry::new(
            Arc::clone(&api),
            retry.clone(),
            settings.jobs.log_capacity,
            Some(jobs.clone()),
        );
        let sync = Arc::new(QueueSynchronizer::new(api, Arc::clone(&books), retry));

        Self {
            inner: Arc::new(Inner {
                store: books,
                gate,
                workers,
                sync,
                in_flight: InFlightRegistry::new(),
                jobs,
                settle_delay: settings.sync.settle_delay(),
                sync_interval: settings.sync.interval(),
                credentials: settings.credentials.clone(),
                history,
            }),
        }
    }

    /// Uses `db` for saved books, the session record and run history, or
    /// keeps everything in memory when `db` is `None`.
    pub fn with_api(
        settings: &Settings,
        api: Arc<dyn PublishingApi>,
        db: Option<Database>,
    ) -> Result<Self, BookpipeError> {
        let (books, sessions): (BookStore, Arc<dyn SessionStore>) = match &db {
            Some(db) => (
                BookStore::load_from_database(db.clone())?,
                Arc::new(KvSessionStore::new(db.clone())),
            ),
            None => (BookStore::new(), Arc::new(MemorySessionStore::new())),
        };
        Ok(Self::new(api, Arc::new(books), sessions, settings, db))
    }

    /// Builds the HTTP client and opens the configured database.
    pub fn from_settings(settings: &Settings) -> Result<Self, BookpipeError> {
        let api = Arc::new(HttpPublishingApi::new(&settings.api)?);
        let db = match settings.resolved_database_path() {
            Some(path) => Some(Database::open(&path)?),
            None => {
                warn!("No home directory found; pipeline state will not be persisted");
                None
            }
        };
        Self::with_api(settings, api, db)
    }

    /// Creates `count` pending books from `prompt` and submits their generation.
    pub async fn generate_book(
        &self,
        prompt: &str,
        count: u32,
    ) -> Result<StageStart, PipelineError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(PipelineError::InvalidRequest(
                "prompt must not be empty".to_string(),
            ));
        }
        if count == 0 {
            return Err(PipelineError::InvalidRequest(
                "count must be at least 1".to_string(),
            ));
        }

        let books: Vec<Book> = (1..=count)
            .map(|i| Book::new(title_for(prompt, i, count), Some(prompt.to_string())))
            .collect();
        let ids: Vec<String> = books.iter().map(|b| b.id().to_string()).collect();
        let spec = JobSpec::GenerateBook {
            prompt: prompt.to_string(),
            count,
            book_ids: ids.clone(),
        };

        let launch = self
            .launch(JobKind::BookGeneration, ids.clone(), move |inner| {
                inner.store.insert(books);
                Ok(spec)
            })
            .await?;
        match launch {
            Launch::Started { stream, guard } => {
                info!("Submitted generation of {} book(s)", count);
                Ok(self.spawn(Stage::Generation, stream, guard))
            }
            Launch::Refused(start) => Ok(start),
            Launch::Raced => {
                self.inner.store.remove(&ids);
                Ok(StageStart::WorkerBusy(JobKind::BookGeneration))
            }
        }
    }

    /// Generates the full manuscript of a pending book. The book shows Review
    /// provisionally until reconciliation confirms it.
    pub async fn generate_full_book(&self, book_id: &str) -> Result<StageStart, PipelineError> {
        let book = self.require_book(book_id)?;
        if book.status() != BookStatus::Pending {
            return Err(PipelineError::InvalidTransition {
                book_id: book_id.to_string(),
                from: book.status(),
                to: BookStatus::Review,
            });
        }
        self.start_full_generation(book_id, false).await
    }

    /// Sends a book in review back for full regeneration.
    pub async fn regenerate_book(&self, book_id: &str) -> Result<StageStart, PipelineError> {
        let book = self.require_book(book_id)?;
        if book.status() != BookStatus::Review {
            return Err(PipelineError::InvalidTransition {
                book_id: book_id.to_string(),
                from: book.status(),
                to: BookStatus::Pending,
            });
        }
        self.start_full_generation(book_id, true).await
    }

    /// Generates KDP metadata for books in review, as one bulk job.
    pub async fn generate_kdp_data(&self, book_ids: &[String]) -> Result<StageStart, PipelineError> {
        let mut ids: Vec<String> = Vec::with_capacity(book_ids.len());
        for id in book_ids {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        if ids.is_empty() {
            return Err(PipelineError::InvalidRequest(
                "no books selected for KDP data generation".to_string(),
            ));
        }
        for id in &ids {
            let book = self.require_book(id)?;
            if book.status() != BookStatus::Review {
                return Err(PipelineError::InvalidRequest(format!(
                    "book '{}' is {}; KDP data is generated for books in review",
                    id,
                    book.status()
                )));
            }
        }

        let spec = JobSpec::GenerateKdpData {
            book_ids: ids.clone(),
        };
        let launch = self
            .launch(JobKind::KdpDataGeneration, ids, move |_| Ok(spec))
            .await?;
        Ok(self.finish_launch(Stage::KdpData, JobKind::KdpDataGeneration, launch))
    }

    /// Uploads a reviewed book to KDP.
    pub async fn upload_book(&self, book_id: &str) -> Result<StageStart, PipelineError> {
        let book = self.require_book(book_id)?;
        if book.status() != BookStatus::Review {
            return Err(PipelineError::InvalidTransition {
                book_id: book_id.to_string(),
                from: book.status(),
                to: BookStatus::Uploaded,
            });
        }
        if !book.kdp_data_ready() {
            warn!("Uploading book {} without generated KDP data", book_id);
        }

        let spec = JobSpec::UploadBook {
            book_id: book_id.to_string(),
        };
        let launch = self
            .launch(JobKind::Upload, vec![book_id.to_string()], move |_| Ok(spec))
            .await?;
        Ok(self.finish_launch(
            Stage::Upload {
                book_id: book_id.to_string(),
            },
            JobKind::Upload,
            launch,
        ))
    }

    /// Re-invokes the stage that last failed for the book.
    pub async fn retry(&self, book_id: &str) -> Result<StageStart, PipelineError> {
        let book = self.require_book(book_id)?;
        let stage = book
            .failed_stage()
            .ok_or_else(|| PipelineError::NothingToRetry(book_id.to_string()))?;
        info!("Retrying {} for book {}", stage, book_id);

        match stage {
            JobKind::BookGeneration => self.retry_generation(&book).await,
            JobKind::PendingBooksGeneration => self.generate_full_book(book_id).await,
            JobKind::KdpDataGeneration => self.generate_kdp_data(&[book_id.to_string()]).await,
            JobKind::Upload => self.upload_book(book_id).await,
        }
    }

    /// Verifies the KDP session, probing when the cached one is not trusted.
    pub async fn check_session(&self) -> ProbeOutcome {
        self.inner.gate.verify().await
    }

    pub fn session(&self) -> Option<ExternalSession> {
        self.inner.gate.session()
    }

    pub async fn connect(
        &self,
        credentials: &KdpCredentials,
    ) -> Result<ExternalSession, PipelineError> {
        Ok(self.inner.gate.connect(credentials).await?)
    }

    /// Connects with the credentials from the configuration file.
    pub async fn connect_configured(&self) -> Result<ExternalSession, PipelineError> {
        let settings = self.inner.credentials.as_ref().ok_or_else(|| {
            PipelineError::InvalidRequest("no KDP credentials configured".to_string())
        })?;
        let credentials = KdpCredentials::from_settings(settings)?;
        self.connect(&credentials).await
    }

    pub fn logout(&self) {
        self.inner.gate.invalidate();
    }

    /// Fetches the remote queue and merges it into the local books.
    pub async fn reconcile(&self) -> Result<Vec<Book>, PipelineError> {
        let (books, _) = self.inner.sync.reconcile().await?;
        Ok(books)
    }

    /// Requests a stop of the running job of `kind`. Its outcome stays unknown
    /// until the next reconciliation.
    pub fn stop_job(&self, kind: JobKind) -> bool {
        self.inner.workers.stop(kind)
    }

    pub fn job_run(&self, kind: JobKind) -> Result<JobRun, PipelineError> {
        Ok(self.inner.workers.snapshot(kind)?)
    }

    /// Finished runs, newest first. Empty without a database.
    pub fn recent_runs(
        &self,
        kind: Option<JobKind>,
        limit: u32,
    ) -> Result<Vec<RunRow>, PipelineError> {
        match &self.inner.history {
            Some(db) => Ok(run_repo::recent(db, kind.map(|k| k.as_str()), limit)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn books(&self) -> Vec<Book> {
        self.inner.store.all()
    }

    pub fn book(&self, book_id: &str) -> Option<Book> {
        self.inner.store.get(book_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BookEvent> {
        self.inner.store.events().subscribe()
    }

    pub fn subscribe_jobs(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.inner.jobs.subscribe()
    }

    pub fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.gate.subscribe()
    }

    /// A scheduler for periodic reconciliation, unless disabled by config.
    pub fn scheduler(&self) -> Option<SyncScheduler> {
        self.inner
            .sync_interval
            .map(|interval| SyncScheduler::new(Arc::clone(&self.inner.sync), interval))
    }

    fn require_book(&self, book_id: &str) -> Result<Book, PipelineError> {
        self.inner
            .store
            .get(book_id)
            .ok_or_else(|| PipelineError::BookNotFound(book_id.to_string()))
    }

    async fn start_full_generation(
        &self,
        book_id: &str,
        regenerate: bool,
    ) -> Result<StageStart, PipelineError> {
        let id = book_id.to_string();
        let spec = JobSpec::GeneratePendingBooks {
            book_ids: vec![id.clone()],
        };
        let launch = self
            .launch(JobKind::PendingBooksGeneration, vec![id.clone()], |inner| {
                if regenerate {
                    inner.store.update(&id, |book| book.request_regeneration())?;
                    info!("Book {} sent back for regeneration", id);
                }
                Ok(spec)
            })
            .await?;

        match launch {
            Launch::Started { stream, guard } => {
                self.inner.store.update(&id, |book| {
                    book.mark_provisional(BookStatus::Review);
                    Ok(())
                })?;
                Ok(self.spawn(Stage::FullGeneration { book_id: id }, stream, guard))
            }
            Launch::Refused(start) => Ok(start),
            Launch::Raced => {
                if regenerate {
                    warn!(
                        "Book {} awaits regeneration; the generation worker was busy",
                        id
                    );
                }
                Ok(StageStart::WorkerBusy(JobKind::PendingBooksGeneration))
            }
        }
    }

    async fn retry_generation(&self, book: &Book) -> Result<StageStart, PipelineError> {
        if book.status() != BookStatus::Pending {
            return Err(PipelineError::NothingToRetry(book.id().to_string()));
        }
        let prompt = book.prompt.clone().ok_or_else(|| {
            PipelineError::InvalidRequest(format!(
                "book '{}' has no prompt to generate from",
                book.id()
            ))
        })?;
        let spec = JobSpec::GenerateBook {
            prompt,
            count: 1,
            book_ids: vec![book.id().to_string()],
        };
        let launch = self
            .launch(
                JobKind::BookGeneration,
                vec![book.id().to_string()],
                move |_| Ok(spec),
            )
            .await?;
        Ok(self.finish_launch(Stage::Generation, JobKind::BookGeneration, launch))
    }

    async fn launch(
        &self,
        kind: JobKind,
        book_ids: Vec<String>,
        prepare: impl FnOnce(&Inner) -> Result<JobSpec, PipelineError>,
    ) -> Result<Launch, PipelineError> {
        let inner: &Inner = &self.inner;

        let guard = match inner.in_flight.claim(&book_ids) {
            Ok(guard) => guard,
            Err(busy) => {
                debug!("Ignoring {} trigger; already in flight: {:?}", kind, busy);
                return Ok(Launch::Refused(StageStart::AlreadyInFlight { book_ids: busy }));
            }
        };

        match inner.gate.verify().await {
            ProbeOutcome::Connected(_) => {}
            outcome => {
                warn!("Refusing {} without a verified KDP session: {:?}", kind, outcome);
                return Err(PipelineError::SessionRequired);
            }
        }

        if inner.workers.get(kind)?.is_running() {
            info!("{} worker is busy", kind);
            return Ok(Launch::Refused(StageStart::WorkerBusy(kind)));
        }

        let spec = prepare(inner)?;
        match inner.workers.start(spec) {
            Ok(stream) => Ok(Launch::Started { stream, guard }),
            Err(WorkerError::AlreadyRunning(_)) => Ok(Launch::Raced),
            Err(e) => Err(e.into()),
        }
    }

    fn finish_launch(&self, stage: Stage, kind: JobKind, launch: Launch) -> StageStart {
        match launch {
            Launch::Started { stream, guard } => self.spawn(stage, stream, guard),
            Launch::Refused(start) => start,
            Launch::Raced => StageStart::WorkerBusy(kind),
        }
    }

    fn spawn(&self, stage: Stage, stream: JobStream, guard: InFlightGuard) -> StageStart {
        let job_id = stream.job_id().to_string();
        let kind = stream.kind();
        let inner = Arc::clone(&self.inner);
        let span = info_span!("stage", kind = %kind, job_id = %job_id);
        let handle =
            tokio::spawn(async move { inner.complete(stage, stream, guard).await }.instrument(span));
        StageStart::Started(StageTask {
            job_id,
            kind,
            handle,
        })
    }
}

impl Inner {
    async fn complete(&self, stage: Stage, stream: JobStream, guard: InFlightGuard) -> StageOutcome {
        let book_ids = guard.ids().to_vec();
        let result = stream.finished().await;
        self.record_run(&result);

        if result.requires_reauth {
            warn!(
                "{} job {} was rejected by KDP authentication; invalidating session",
                result.kind, result.job_id
            );
            self.gate.invalidate();
        }

        let reconciled = match stage {
            Stage::Generation => {
                self.apply_outcomes(&result, &book_ids, |_| Ok(()));
                self.reconcile_logged().await
            }
            Stage::FullGeneration { book_id } => {
                self.complete_full_generation(&result, &book_id).await
            }
            Stage::KdpData => self.complete_kdp_data(&result, &book_ids).await,
            Stage::Upload { book_id } => {
                self.apply_outcomes(&result, &book_ids, |book| {
                    book.advance_to(BookStatus::Uploaded)
                });
                self.reconcile_logged().await
            }
        };

        let books = book_ids
            .iter()
            .filter_map(|id| self.store.get(id))
            .collect();
        drop(guard);
        StageOutcome {
            kind: result.kind,
            result,
            reconciled,
            books,
        }
    }

    /// Writes per-book outcomes. Returns the books the result says nothing
    /// about.
    fn apply_outcomes(
        &self,
        result: &JobResult,
        book_ids: &[String],
        mut on_success: impl FnMut(&mut Book) -> Result<(), PipelineError>,
    ) -> Vec<String> {
        if result.status == JobRunStatus::Stopped {
            return Vec::new();
        }

        // A failed run that never got an answer counts against every book.
        let unanswered = result.status == JobRunStatus::Failed
            && result.items.is_empty()
            && result.success_count == 0
            && result.failure_count == 0;
        let mut unattributed = Vec::new();
        for id in book_ids {
            let outcome = result.outcome_for(id).cloned().or_else(|| {
                unanswered.then(|| {
                    ItemOutcome::failed(
                        id.clone(),
                        result.error.clone().unwrap_or_else(|| "Job failed".to_string()),
                    )
                })
            });

            let applied = match outcome {
                Some(outcome) if outcome.success => self.store.update(id, |book| {
                    book.clear_error();
                    on_success(book)
                }),
                Some(outcome) => {
                    let message = outcome.error.unwrap_or_else(|| "Job failed".to_string());
                    self.store.update(id, |book| {
                        book.mark_failed(result.kind, message);
                        Ok(())
                    })
                }
                None => {
                    unattributed.push(id.clone());
                    Ok(())
                }
            };
            if let Err(e) = applied {
                warn!("Could not record {} outcome for book {}: {}", result.kind, id, e);
            }
        }
        unattributed
    }

    async fn complete_full_generation(&self, result: &JobResult, book_id: &str) -> bool {
        let failure = match result.status {
            JobRunStatus::Failed => Some(result.error.clone()),
            _ => result
                .outcome_for(book_id)
                .filter(|o| !o.success)
                .map(|o| o.error.clone()),
        };

        if let Some(message) = failure {
            let message = message.unwrap_or_else(|| "Full generation failed".to_string());
            self.update_logged(book_id, |book| {
                book.revert_provisional();
                book.mark_failed(JobKind::PendingBooksGeneration, message);
            });
            return false;
        }

        if result.status == JobRunStatus::Stopped {
            self.update_logged(book_id, |book| {
                book.revert_provisional();
            });
            return self.reconcile_logged().await;
        }

        self.update_logged(book_id, |book| {
            book.clear_error();
            book.complete_regeneration();
        });
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
        let reconciled = self.reconcile_logged().await;

        self.update_logged(book_id, |book| {
            if book.revert_provisional().is_some() {
                warn!(
                    "Book {} not in review in the remote queue yet; keeping it {}",
                    book_id,
                    book.status()
                );
            }
        });
        reconciled
    }

    async fn complete_kdp_data(&self, result: &JobResult, book_ids: &[String]) -> bool {
        let unattributed = self.apply_outcomes(result, book_ids, |book| {
            book.set_kdp_data_ready();
            Ok(())
        });
        let reconciled = self.reconcile_logged().await;
        if !reconciled || unattributed.is_empty() {
            return reconciled;
        }

        // Counts without attribution: the queue tells which books got their data.
        let mut unresolved = 0;
        for id in &unattributed {
            let resolved = self.store.update(id, |book| {
                if book.kdp_data_ready() {
                    if book.failed_stage() == Some(JobKind::KdpDataGeneration) {
                        book.clear_error();
                    }
                    Ok(true)
                } else if let Some(message) = book.remote_error().map(str::to_string) {
                    book.mark_failed(JobKind::KdpDataGeneration, message);
                    Ok(true)
                } else {
                    Ok(false)
                }
            });
            if !matches!(resolved, Ok(true)) {
                unresolved += 1;
            }
        }
        if unresolved > 0 {
            warn!(
                "KDP data outcome of {} book(s) still unknown after reconciliation",
                unresolved
            );
        }
        reconciled
    }

    async fn reconcile_logged(&self) -> bool {
        match self.sync.reconcile().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Queue reconciliation failed: {}", e);
                false
            }
        }
    }

    fn update_logged(&self, book_id: &str, f: impl FnOnce(&mut Book)) {
        let updated = self.store.update(book_id, |book| {
            f(book);
            Ok(())
        });
        if let Err(e) = updated {
            warn!("Could not update book {}: {}", book_id, e);
        }
    }

    fn record_run(&self, result: &JobResult) {
        let Some(db) = &self.history else {
            return;
        };
        let started_at = self
            .workers
            .snapshot(result.kind)
            .ok()
            .filter(|run| run.job_id.as_deref() == Some(result.job_id.as_str()))
            .and_then(|run| run.started_at)
            .map(|at| at.to_rfc3339());
        let row = RunRow {
            job_id: result.job_id.clone(),
            kind: result.kind.as_str().to_string(),
            status: result.status.as_str().to_string(),
            processed_count: result.processed,
            total_count: result.total,
            success_count: result.success_count,
            failure_count: result.failure_count,
            error: result.error.clone(),
            started_at,
            finished_at: chrono::Utc::now().to_rfc3339(),
        };
        if let Err(e) = run_repo::insert(db, &row) {
            error!("Failed to record {} run {}: {}", result.kind, result.job_id, e);
        }
    }
}

fn title_for(prompt: &str, index: u32, count: u32) -> String {
    let base: String = prompt.chars().take(MAX_TITLE_CHARS).collect();
    if count > 1 {
        format!("{} ({})", base, index)
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{connected, queue_entry, MockApi};
    use crate::api::{classify_status, BulkItemResult, BulkKdpResponse, GenerationSummary, UploadResponse};
    use crate::config::schema::RetrySettings;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::collections::BTreeMap;

    fn settings() -> Settings {
        let fast = RetrySettings {
            interval_ms: 0,
            max_attempts: 2,
            max_interval_ms: None,
        };
        let mut settings = Settings::default();
        settings.probe = fast.clone();
        settings.retry = fast;
        settings.sync.settle_delay_ms = 0;
        settings
    }

    fn trusted_store() -> Arc<MemorySessionStore> {
        Arc::new(MemorySessionStore::with_session(ExternalSession::connected(
            "author@example.com",
            Utc::now(),
            ChronoDuration::hours(24),
        )))
    }

    fn orchestrator(api: &Arc<MockApi>) -> PipelineOrchestrator {
        PipelineOrchestrator::new(
            api.clone(),
            Arc::new(BookStore::new()),
            trusted_store(),
            &settings(),
            None,
        )
    }

    fn review_books(orch: &PipelineOrchestrator, titles: &[&str]) -> Vec<String> {
        let books: Vec<Book> = titles
            .iter()
            .enumerate()
            .map(|(i, title)| {
                Book::from_remote(&queue_entry(&format!("r{}", i), title, "review"), BookStatus::Review)
            })
            .collect();
        let ids = books.iter().map(|b| b.id().to_string()).collect();
        orch.inner.store.insert(books);
        ids
    }

    fn pending_book(orch: &PipelineOrchestrator, title: &str) -> String {
        let book = Book::new(title, Some(title.to_string()));
        let id = book.id().to_string();
        orch.inner.store.insert(vec![book]);
        id
    }

    async fn run(start: Result<StageStart, PipelineError>) -> StageOutcome {
        start.unwrap().task().expect("stage should start").wait().await
    }

    #[tokio::test]
    async fn test_session_required_before_any_submission() {
        let api = MockApi::new();
        let orch = PipelineOrchestrator::new(
            api.clone(),
            Arc::new(BookStore::new()),
            Arc::new(MemorySessionStore::new()),
            &settings(),
            None,
        );

        let err = orch.generate_book("guide to sourdough baking", 1).await.unwrap_err();
        assert!(matches!(err, PipelineError::SessionRequired));
        assert_eq!(MockApi::count(&api.generate_calls), 0);
        assert!(orch.books().is_empty());
    }

    #[tokio::test]
    async fn test_generate_book_validation() {
        let orch = orchestrator(&MockApi::new());
        assert!(matches!(
            orch.generate_book("   ", 1).await,
            Err(PipelineError::InvalidRequest(_))
        ));
        assert!(matches!(
            orch.generate_book("bread", 0).await,
            Err(PipelineError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_generate_book_sends_local_ids() {
        let api = MockApi::new();
        let orch = orchestrator(&api);

        let outcome = run(orch.generate_book("bread", 2).await).await;
        assert!(outcome.result.is_success());
        assert_eq!(outcome.books.len(), 2);
        assert!(outcome.books.iter().all(|b| b.status() == BookStatus::Pending));
        assert_eq!(outcome.books[0].title, "bread (1)");

        let requests = api.generate_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].n, 2);
        let mut sent = requests[0].book_ids.clone();
        let mut local: Vec<String> = orch.books().iter().map(|b| b.id().to_string()).collect();
        sent.sort();
        local.sort();
        assert_eq!(sent, local);
    }

    #[tokio::test]
    async fn test_sourdough_scenario() {
        let api = MockApi::new();
        let orch = orchestrator(&api);

        let created = run(orch.generate_book("guide to sourdough baking", 1).await).await;
        let book = &created.books[0];
        assert_eq!(book.status(), BookStatus::Pending);
        let id = book.id().to_string();

        api.set_pending_generation(Ok(GenerationSummary {
            message: None,
            processed_books: 1,
            successful_books: 1,
            failed_books: 0,
        }));
        api.set_queue(vec![queue_entry(&id, "guide to sourdough baking", "review")]);

        let start = orch.generate_full_book(&id).await.unwrap();
        // Provisional until reconciliation confirms.
        let during = orch.book(&id).unwrap();
        assert_eq!(during.status(), BookStatus::Pending);
        assert_eq!(during.display_status(), BookStatus::Review);

        let outcome = start.task().unwrap().wait().await;
        assert!(outcome.reconciled);
        assert_eq!(outcome.result.success_count, 1);
        let book = orch.book(&id).unwrap();
        assert_eq!(book.status(), BookStatus::Review);
        assert!(book.provisional().is_none());
    }

    #[tokio::test]
    async fn test_full_generation_is_idempotent_while_in_flight() {
        let api = MockApi::new();
        let orch = orchestrator(&api);
        let id = pending_book(&orch, "Bread");
        let release = api.hold_pending_generation();

        let first = orch.generate_full_book(&id).await.unwrap();
        let second = orch.generate_full_book(&id).await.unwrap();
        assert!(first.is_started());
        assert!(matches!(second, StageStart::AlreadyInFlight { book_ids } if book_ids == vec![id.clone()]));

        release.notify_one();
        first.task().unwrap().wait().await;
        assert_eq!(MockApi::count(&api.pending_calls), 1);
    }

    #[tokio::test]
    async fn test_unconfirmed_generation_reverts() {
        let api = MockApi::new();
        let orch = orchestrator(&api);
        let id = pending_book(&orch, "Bread");

        let outcome = run(orch.generate_full_book(&id).await).await;
        assert!(outcome.result.is_success());
        let book = orch.book(&id).unwrap();
        assert_eq!(book.status(), BookStatus::Pending);
        assert!(book.provisional().is_none());
        assert!(book.error.is_none());
    }

    #[tokio::test]
    async fn test_failed_generation_then_retry() {
        let api = MockApi::new();
        let orch = orchestrator(&api);
        let id = pending_book(&orch, "Bread");
        api.set_pending_generation(Err(classify_status(
            "generate-pending-books",
            422,
            "prompt rejected",
        )));

        run(orch.generate_full_book(&id).await).await;
        let book = orch.book(&id).unwrap();
        assert_eq!(book.status(), BookStatus::Pending);
        assert!(book.provisional().is_none());
        assert!(book.error.is_some());
        assert_eq!(book.failed_stage(), Some(JobKind::PendingBooksGeneration));

        api.set_pending_generation(Ok(GenerationSummary::default()));
        api.set_queue(vec![queue_entry(&id, "Bread", "review")]);
        run(orch.retry(&id).await).await;
        let book = orch.book(&id).unwrap();
        assert_eq!(book.status(), BookStatus::Review);
        assert!(book.error.is_none());
        assert_eq!(book.failed_stage(), None);

        assert!(matches!(
            orch.retry(&id).await,
            Err(PipelineError::NothingToRetry(_))
        ));
    }

    #[tokio::test]
    async fn test_busy_worker_is_reported() {
        let api = MockApi::new();
        let orch = orchestrator(&api);
        let first = pending_book(&orch, "Bread");
        let second = pending_book(&orch, "Rye");
        let release = api.hold_pending_generation();

        let running = orch.generate_full_book(&first).await.unwrap();
        let busy = orch.generate_full_book(&second).await.unwrap();
        assert!(matches!(busy, StageStart::WorkerBusy(JobKind::PendingBooksGeneration)));
        assert!(orch.book(&second).unwrap().provisional().is_none());

        release.notify_one();
        running.task().unwrap().wait().await;
    }

    #[tokio::test]
    async fn test_kdp_partial_batch_with_item_results() {
        let api = MockApi::new();
        let orch = orchestrator(&api);
        let ids = review_books(&orch, &["A", "B", "C", "D", "E"]);
        let results = ids
            .iter()
            .enumerate()
            .map(|(i, id)| BulkItemResult {
                book_id: id.clone(),
                success: i < 3,
                error: (i >= 3).then(|| "cover missing".to_string()),
            })
            .collect();
        api.set_kdp_data(Ok(BulkKdpResponse {
            success_count: 3,
            error_count: 2,
            results,
        }));

        let outcome = run(orch.generate_kdp_data(&ids).await).await;
        assert_eq!(outcome.result.success_count, 3);
        assert_eq!(outcome.result.failure_count, 2);

        let ready = outcome.books.iter().filter(|b| b.kdp_data_ready()).count();
        let failed: Vec<&Book> = outcome.books.iter().filter(|b| b.error.is_some()).collect();
        assert_eq!(ready, 3);
        assert_eq!(failed.len(), 2);
        assert!(failed
            .iter()
            .all(|b| b.failed_stage() == Some(JobKind::KdpDataGeneration)
                && b.status() == BookStatus::Review));
    }

    #[tokio::test]
    async fn test_kdp_mixed_counts_resolved_by_queue() {
        let api = MockApi::new();
        let orch = orchestrator(&api);
        let ids = review_books(&orch, &["A", "B", "C", "D", "E"]);
        api.set_kdp_data(Ok(BulkKdpResponse {
            success_count: 3,
            error_count: 2,
            results: vec![],
        }));
        let queue = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let mut entry = queue_entry(id, &format!("Book {}", i), "review");
                if i < 3 {
                    entry.kdp_form_data = Some(BTreeMap::from([(
                        "keywords".to_string(),
                        serde_json::json!(["bread"]),
                    )]));
                } else {
                    entry.error = Some("description too long".to_string());
                }
                entry
            })
            .collect();
        api.set_queue(queue);

        let outcome = run(orch.generate_kdp_data(&ids).await).await;
        assert!(outcome.result.items.is_empty());
        assert_eq!(outcome.books.iter().filter(|b| b.kdp_data_ready()).count(), 3);
        let failed: Vec<&Book> = outcome
            .books
            .iter()
            .filter(|b| b.failed_stage() == Some(JobKind::KdpDataGeneration))
            .collect();
        assert_eq!(failed.len(), 2);
    }

    #[tokio::test]
    async fn test_kdp_answer_without_counts_leaves_books_to_the_queue() {
        let api = MockApi::new();
        let orch = orchestrator(&api);
        let ids = review_books(&orch, &["A", "B", "C"]);
        api.set_kdp_data(Ok(BulkKdpResponse {
            success_count: 0,
            error_count: 0,
            results: vec![],
        }));

        let outcome = run(orch.generate_kdp_data(&ids).await).await;
        assert_eq!(outcome.result.status, JobRunStatus::Succeeded);
        assert_eq!(outcome.books.len(), 3);
        assert!(outcome.books.iter().all(|b| !b.kdp_data_ready()));
        assert!(outcome
            .books
            .iter()
            .all(|b| b.error.is_none() && b.failed_stage().is_none()));
    }

    #[tokio::test]
    async fn test_kdp_counts_do_not_relabel_stale_upload_error() {
        let api = MockApi::new();
        let orch = orchestrator(&api);
        let ids = review_books(&orch, &["A", "B", "C"]);
        api.set_upload(Ok(UploadResponse {
            success: false,
            message: "Cover rejected".to_string(),
            book_title: None,
        }));
        run(orch.upload_book(&ids[2]).await).await;
        assert_eq!(orch.book(&ids[2]).unwrap().failed_stage(), Some(JobKind::Upload));

        api.set_kdp_data(Ok(BulkKdpResponse {
            success_count: 1,
            error_count: 1,
            results: vec![],
        }));
        let mut ready = queue_entry(&ids[0], "A", "review");
        ready.kdp_form_data = Some(BTreeMap::from([(
            "keywords".to_string(),
            serde_json::json!(["bread"]),
        )]));
        let mut rejected = queue_entry(&ids[1], "B", "review");
        rejected.error = Some("description too long".to_string());
        api.set_queue(vec![ready, rejected, queue_entry(&ids[2], "C", "review")]);

        run(orch.generate_kdp_data(&ids).await).await;
        assert!(orch.book(&ids[0]).unwrap().kdp_data_ready());
        let rejected = orch.book(&ids[1]).unwrap();
        assert_eq!(rejected.failed_stage(), Some(JobKind::KdpDataGeneration));
        assert_eq!(rejected.error.as_deref(), Some("description too long"));
        let stale = orch.book(&ids[2]).unwrap();
        assert_eq!(stale.failed_stage(), Some(JobKind::Upload));
        assert_eq!(stale.error.as_deref(), Some("Cover rejected"));
    }

    #[tokio::test]
    async fn test_queue_reported_error_can_be_retried() {
        let api = MockApi::new();
        let orch = orchestrator(&api);
        let ids = review_books(&orch, &["Bread"]);
        let mut entry = queue_entry(&ids[0], "Bread", "review");
        entry.error = Some("keywords rejected".to_string());
        api.set_queue(vec![entry]);

        orch.reconcile().await.unwrap();
        let book = orch.book(&ids[0]).unwrap();
        assert_eq!(book.error.as_deref(), Some("keywords rejected"));
        assert_eq!(book.failed_stage(), Some(JobKind::KdpDataGeneration));

        api.set_queue(vec![queue_entry(&ids[0], "Bread", "review")]);
        let outcome = run(orch.retry(&ids[0]).await).await;
        assert_eq!(outcome.kind, JobKind::KdpDataGeneration);
        assert_eq!(api.kdp_requests(), vec![vec![ids[0].clone()]]);
        let book = orch.book(&ids[0]).unwrap();
        assert!(book.kdp_data_ready());
        assert!(book.error.is_none());
    }

    #[tokio::test]
    async fn test_kdp_data_requires_review() {
        let api = MockApi::new();
        let orch = orchestrator(&api);
        let id = pending_book(&orch, "Bread");
        assert!(matches!(
            orch.generate_kdp_data(&[id]).await,
            Err(PipelineError::InvalidRequest(_))
        ));
        assert!(matches!(
            orch.generate_kdp_data(&[]).await,
            Err(PipelineError::InvalidRequest(_))
        ));
        assert_eq!(MockApi::count(&api.kdp_calls), 0);
    }

    #[tokio::test]
    async fn test_upload_success_and_rejection() {
        let api = MockApi::new();
        let orch = orchestrator(&api);
        let ids = review_books(&orch, &["Bread", "Rye"]);

        run(orch.upload_book(&ids[0]).await).await;
        assert_eq!(orch.book(&ids[0]).unwrap().status(), BookStatus::Uploaded);

        api.set_upload(Ok(UploadResponse {
            success: false,
            message: "Cover rejected".to_string(),
            book_title: Some("Rye".to_string()),
        }));
        run(orch.upload_book(&ids[1]).await).await;
        let book = orch.book(&ids[1]).unwrap();
        assert_eq!(book.status(), BookStatus::Review);
        assert_eq!(book.error.as_deref(), Some("Cover rejected"));
        assert_eq!(book.failed_stage(), Some(JobKind::Upload));

        assert!(matches!(
            orch.upload_book(&ids[0]).await,
            Err(PipelineError::InvalidTransition { from: BookStatus::Uploaded, .. })
        ));
    }

    #[tokio::test]
    async fn test_auth_failure_invalidates_session() {
        let api = MockApi::new();
        let orch = orchestrator(&api);
        let ids = review_books(&orch, &["Bread"]);
        api.set_upload(Err(classify_status("upload-book", 401, "session expired")));
        let mut events = orch.subscribe_session();

        let outcome = run(orch.upload_book(&ids[0]).await).await;
        assert!(outcome.result.requires_reauth);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Invalidated);
        assert!(orch.session().is_none());
        assert_eq!(orch.book(&ids[0]).unwrap().failed_stage(), Some(JobKind::Upload));

        // Probe keeps failing, so the retry is refused before submission.
        assert!(matches!(
            orch.retry(&ids[0]).await,
            Err(PipelineError::SessionRequired)
        ));
        assert_eq!(MockApi::count(&api.upload_calls), 1);

        api.set_login_fallback(Ok(connected("author@example.com")));
        assert!(orch.check_session().await.is_connected());
    }

    #[tokio::test]
    async fn test_regeneration_round_trip() {
        let api = MockApi::new();
        let orch = orchestrator(&api);
        let ids = review_books(&orch, &["Bread"]);
        let id = ids[0].clone();
        api.set_queue(vec![queue_entry(&id, "Bread", "review")]);
        let release = api.hold_pending_generation();

        let start = orch.regenerate_book(&id).await.unwrap();
        let book = orch.book(&id).unwrap();
        assert_eq!(book.status(), BookStatus::Pending);
        assert!(book.regeneration_requested());

        // A stale queue must not pull the book back to review early.
        orch.reconcile().await.unwrap();
        assert_eq!(orch.book(&id).unwrap().status(), BookStatus::Pending);

        release.notify_one();
        start.task().unwrap().wait().await;
        let book = orch.book(&id).unwrap();
        assert_eq!(book.status(), BookStatus::Review);
        assert!(!book.regeneration_requested());
    }

    #[tokio::test]
    async fn test_stop_leaves_outcome_to_reconciliation() {
        let api = MockApi::new();
        let orch = orchestrator(&api);
        let id = pending_book(&orch, "Bread");
        let release = api.hold_pending_generation();

        let start = orch.generate_full_book(&id).await.unwrap();
        assert!(orch.stop_job(JobKind::PendingBooksGeneration));
        let outcome = start.task().unwrap().wait().await;
        assert_eq!(outcome.result.status, JobRunStatus::Stopped);

        let book = orch.book(&id).unwrap();
        assert_eq!(book.status(), BookStatus::Pending);
        assert!(book.provisional().is_none());
        assert!(book.error.is_none());
        assert_eq!(
            orch.job_run(JobKind::PendingBooksGeneration).unwrap().status,
            JobRunStatus::Stopped
        );
        release.notify_one();
    }

    #[tokio::test]
    async fn test_run_history_is_recorded() {
        let db = Database::open_in_memory().unwrap();
        KvSessionStore::new(db.clone())
            .set(&ExternalSession::connected(
                "author@example.com",
                Utc::now(),
                ChronoDuration::hours(24),
            ))
            .unwrap();
        let api = MockApi::new();
        let orch = PipelineOrchestrator::with_api(&settings(), api.clone(), Some(db.clone())).unwrap();

        let created = run(orch.generate_book("bread", 1).await).await;
        let runs = orch.recent_runs(Some(JobKind::BookGeneration), 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].job_id, created.result.job_id);
        assert_eq!(runs[0].status, "succeeded");
        assert!(runs[0].started_at.is_some());

        // Books survive a restart.
        let reopened = PipelineOrchestrator::with_api(&settings(), api, Some(db)).unwrap();
        assert_eq!(reopened.books().len(), 1);
    }
}

//! Scripted in-memory backend for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::credentials::KdpCredentials;
use super::error::{ApiError, ApiResult};
use super::types::{
    BulkKdpResponse, CredentialsResponse, GenerateBookRequest, GenerationSummary,
    KdpLoginStatus, RemoteQueueEntry, UploadResponse,
};
use super::PublishingApi;

pub(crate) fn transport_error(endpoint: &str) -> ApiError {
    ApiError::Transport {
        endpoint: endpoint.to_string(),
        message: "connection reset by peer".to_string(),
    }
}

pub(crate) fn connected(email: &str) -> KdpLoginStatus {
    KdpLoginStatus {
        logged_in: true,
        email: Some(email.to_string()),
        error: None,
    }
}

pub(crate) fn queue_entry(id: &str, title: &str, status: &str) -> RemoteQueueEntry {
    RemoteQueueEntry {
        id: Some(id.to_string()),
        title: title.to_string(),
        status: status.to_string(),
        ..RemoteQueueEntry::default()
    }
}

#[derive(Default)]
struct Script {
    login: VecDeque<ApiResult<KdpLoginStatus>>,
    login_fallback: Option<ApiResult<KdpLoginStatus>>,
    queue: Vec<RemoteQueueEntry>,
    queue_error: Option<ApiError>,
    pending_generation: Option<ApiResult<GenerationSummary>>,
    kdp_data: Option<ApiResult<BulkKdpResponse>>,
    upload: Option<ApiResult<UploadResponse>>,
    credentials: VecDeque<ApiResult<CredentialsResponse>>,
    generate_requests: Vec<GenerateBookRequest>,
    kdp_requests: Vec<Vec<String>>,
}

/// Counts calls per endpoint and replays scripted responses.
#[derive(Default)]
pub(crate) struct MockApi {
    script: Mutex<Script>,
    pub login_calls: AtomicUsize,
    pub queue_calls: AtomicUsize,
    pub generate_calls: AtomicUsize,
    pub pending_calls: AtomicUsize,
    pub kdp_calls: AtomicUsize,
    pub upload_calls: AtomicUsize,
    pub credential_calls: AtomicUsize,
    /// When set, `generate-pending-books` waits for a notification before answering.
    pub hold_pending: Mutex<Option<Arc<Notify>>>,
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn push_login(&self, response: ApiResult<KdpLoginStatus>) {
        self.script().login.push_back(response);
    }

    pub fn set_login_fallback(&self, response: ApiResult<KdpLoginStatus>) {
        self.script().login_fallback = Some(response);
    }

    pub fn set_queue(&self, queue: Vec<RemoteQueueEntry>) {
        self.script().queue = queue;
    }

    pub fn set_queue_error(&self, error: Option<ApiError>) {
        self.script().queue_error = error;
    }

    pub fn set_pending_generation(&self, response: ApiResult<GenerationSummary>) {
        self.script().pending_generation = Some(response);
    }

    pub fn set_kdp_data(&self, response: ApiResult<BulkKdpResponse>) {
        self.script().kdp_data = Some(response);
    }

    pub fn set_upload(&self, response: ApiResult<UploadResponse>) {
        self.script().upload = Some(response);
    }

    pub fn push_credentials(&self, response: ApiResult<CredentialsResponse>) {
        self.script().credentials.push_back(response);
    }

    pub fn hold_pending_generation(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.hold_pending.lock().unwrap() = Some(Arc::clone(&notify));
        notify
    }

    pub fn generate_requests(&self) -> Vec<GenerateBookRequest> {
        self.script().generate_requests.clone()
    }

    pub fn kdp_requests(&self) -> Vec<Vec<String>> {
        self.script().kdp_requests.clone()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PublishingApi for MockApi {
    async fn generate_book(&self, request: &GenerateBookRequest) -> ApiResult<GenerationSummary> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script();
        script.generate_requests.push(request.clone());
        Ok(GenerationSummary::default())
    }

    async fn generate_pending_books(&self) -> ApiResult<GenerationSummary> {
        self.pending_calls.fetch_add(1, Ordering::SeqCst);
        let hold = self.hold_pending.lock().unwrap().clone();
        if let Some(notify) = hold {
            notify.notified().await;
        }
        self.script()
            .pending_generation
            .clone()
            .unwrap_or_else(|| Ok(GenerationSummary::default()))
    }

    async fn generate_kdp_data(&self, book_ids: &[String]) -> ApiResult<BulkKdpResponse> {
        self.kdp_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script();
        script.kdp_requests.push(book_ids.to_vec());
        script.kdp_data.clone().unwrap_or_else(|| {
            Ok(BulkKdpResponse {
                success_count: book_ids.len() as u32,
                error_count: 0,
                results: vec![],
            })
        })
    }

    async fn upload_book(&self, _book_id: &str) -> ApiResult<UploadResponse> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        self.script().upload.clone().unwrap_or_else(|| {
            Ok(UploadResponse {
                success: true,
                message: "Uploaded".to_string(),
                book_title: None,
            })
        })
    }

    async fn book_queue(&self) -> ApiResult<Vec<RemoteQueueEntry>> {
        self.queue_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script();
        match &script.queue_error {
            Some(err) => Err(err.clone()),
            None => Ok(script.queue.clone()),
        }
    }

    async fn kdp_login_status(&self) -> ApiResult<KdpLoginStatus> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script();
        if let Some(next) = script.login.pop_front() {
            return next;
        }
        script
            .login_fallback
            .clone()
            .unwrap_or_else(|| Err(transport_error("kdp-login-status")))
    }

    async fn submit_credentials(
        &self,
        _credentials: &KdpCredentials,
    ) -> ApiResult<CredentialsResponse> {
        self.credential_calls.fetch_add(1, Ordering::SeqCst);
        self.script().credentials.pop_front().unwrap_or_else(|| {
            Ok(CredentialsResponse {
                success: Some(true),
                message: String::new(),
            })
        })
    }
}

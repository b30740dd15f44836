//! Scripted publishing backend for integration tests.
//!
//! Every endpoint answers from a script that tests change between steps, and
//! counts its calls so tests can assert on network traffic.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use bookpipe::api::{
    ApiError, ApiResult, BulkItemResult, BulkKdpResponse, CredentialsResponse,
    GenerateBookRequest, GenerationSummary, KdpCredentials, KdpLoginStatus, RemoteQueueEntry,
    UploadResponse,
};
use bookpipe::PublishingApi;

pub fn entry(id: &str, title: &str, status: &str) -> RemoteQueueEntry {
    RemoteQueueEntry {
        id: Some(id.to_string()),
        title: title.to_string(),
        status: status.to_string(),
        ..RemoteQueueEntry::default()
    }
}

pub fn transient(endpoint: &str) -> ApiError {
    ApiError::Transport {
        endpoint: endpoint.to_string(),
        message: "connection reset by peer".to_string(),
    }
}

pub fn logged_in(email: &str) -> KdpLoginStatus {
    KdpLoginStatus {
        logged_in: true,
        email: Some(email.to_string()),
        error: None,
    }
}

pub fn item(book_id: &str, success: bool) -> BulkItemResult {
    BulkItemResult {
        book_id: book_id.to_string(),
        success,
        error: (!success).then(|| "metadata rejected".to_string()),
    }
}

#[derive(Default)]
struct Script {
    login: VecDeque<ApiResult<KdpLoginStatus>>,
    queue: Vec<RemoteQueueEntry>,
    pending: Option<ApiResult<GenerationSummary>>,
    kdp: Option<ApiResult<BulkKdpResponse>>,
    upload: Option<ApiResult<UploadResponse>>,
    generate_requests: Vec<GenerateBookRequest>,
}

#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<Script>,
    hold: Mutex<Option<Arc<Notify>>>,
    pub login_calls: AtomicUsize,
    pub queue_calls: AtomicUsize,
    pub generate_calls: AtomicUsize,
    pub pending_calls: AtomicUsize,
    pub kdp_calls: AtomicUsize,
    pub upload_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Login answers in order; once exhausted every poll fails transiently.
    pub fn push_login(&self, response: ApiResult<KdpLoginStatus>) {
        self.script.lock().unwrap().login.push_back(response);
    }

    pub fn set_queue(&self, queue: Vec<RemoteQueueEntry>) {
        self.script.lock().unwrap().queue = queue;
    }

    pub fn set_pending(&self, response: ApiResult<GenerationSummary>) {
        self.script.lock().unwrap().pending = Some(response);
    }

    pub fn set_kdp(&self, response: ApiResult<BulkKdpResponse>) {
        self.script.lock().unwrap().kdp = Some(response);
    }

    pub fn set_upload(&self, response: ApiResult<UploadResponse>) {
        self.script.lock().unwrap().upload = Some(response);
    }

    pub fn generate_requests(&self) -> Vec<GenerateBookRequest> {
        self.script.lock().unwrap().generate_requests.clone()
    }

    /// Makes `generate-pending-books` wait until [`release_pending`](Self::release_pending).
    pub fn hold_pending(&self) {
        *self.hold.lock().unwrap() = Some(Arc::new(Notify::new()));
    }

    pub fn release_pending(&self) {
        if let Some(notify) = self.hold.lock().unwrap().take() {
            notify.notify_one();
        }
    }
}

#[async_trait]
impl PublishingApi for ScriptedBackend {
    async fn generate_book(&self, request: &GenerateBookRequest) -> ApiResult<GenerationSummary> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .generate_requests
            .push(request.clone());
        Ok(GenerationSummary::default())
    }

    async fn generate_pending_books(&self) -> ApiResult<GenerationSummary> {
        self.pending_calls.fetch_add(1, Ordering::SeqCst);
        let hold = self.hold.lock().unwrap().clone();
        if let Some(notify) = hold {
            notify.notified().await;
        }
        self.script
            .lock()
            .unwrap()
            .pending
            .clone()
            .unwrap_or_else(|| Ok(GenerationSummary::default()))
    }

    async fn generate_kdp_data(&self, book_ids: &[String]) -> ApiResult<BulkKdpResponse> {
        self.kdp_calls.fetch_add(1, Ordering::SeqCst);
        self.script.lock().unwrap().kdp.clone().unwrap_or_else(|| {
            Ok(BulkKdpResponse {
                success_count: book_ids.len() as u32,
                error_count: 0,
                results: Vec::new(),
            })
        })
    }

    async fn upload_book(&self, _book_id: &str) -> ApiResult<UploadResponse> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        self.script.lock().unwrap().upload.clone().unwrap_or_else(|| {
            Ok(UploadResponse {
                success: true,
                message: "Uploaded".to_string(),
                book_title: None,
            })
        })
    }

    async fn book_queue(&self) -> ApiResult<Vec<RemoteQueueEntry>> {
        self.queue_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.script.lock().unwrap().queue.clone())
    }

    async fn kdp_login_status(&self) -> ApiResult<KdpLoginStatus> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .login
            .pop_front()
            .unwrap_or_else(|| Err(transient("kdp-login-status")))
    }

    async fn submit_credentials(
        &self,
        _credentials: &KdpCredentials,
    ) -> ApiResult<CredentialsResponse> {
        Ok(CredentialsResponse {
            success: Some(true),
            message: String::new(),
        })
    }
}

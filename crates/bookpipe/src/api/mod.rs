//! Client side of the publishing backend (generation, KDP bulk, queue, login status).

pub mod credentials;
pub mod error;
pub mod http;
#[cfg(test)]
pub(crate) mod testing;
pub mod types;

use async_trait::async_trait;

pub use credentials::{credentials_accepted, KdpCredentials};
pub use error::{classify_status, ApiError, ApiResult};
pub use http::HttpPublishingApi;
pub use types::{
    BulkItemResult, BulkKdpResponse, CredentialsResponse, GenerateBookRequest,
    GenerationSummary, KdpLoginStatus, RemoteQueueEntry, UploadResponse,
};

/// The remote collaborators the pipeline drives.
///
/// Every call is a suspension point; implementations must not block the
/// calling task.
#[async_trait]
pub trait PublishingApi: Send + Sync {
    /// `POST generate-book`
    async fn generate_book(&self, request: &GenerateBookRequest) -> ApiResult<GenerationSummary>;

    /// `POST generate-pending-books`
    async fn generate_pending_books(&self) -> ApiResult<GenerationSummary>;

    /// `POST bulk/generate-kdp-data`
    async fn generate_kdp_data(&self, book_ids: &[String]) -> ApiResult<BulkKdpResponse>;

    /// `POST upload-book`
    async fn upload_book(&self, book_id: &str) -> ApiResult<UploadResponse>;

    /// `GET book-queue`
    async fn book_queue(&self) -> ApiResult<Vec<RemoteQueueEntry>>;

    /// `GET kdp-login-status`
    async fn kdp_login_status(&self) -> ApiResult<KdpLoginStatus>;

    /// `POST config`
    async fn submit_credentials(
        &self,
        credentials: &KdpCredentials,
    ) -> ApiResult<CredentialsResponse>;
}

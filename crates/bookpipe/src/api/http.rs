//! reqwest-backed implementation of [`PublishingApi`].

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, RequestBuilder};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::schema::ApiSettings;

use super::credentials::KdpCredentials;
use super::error::{classify_status, ApiError, ApiResult};
use super::types::{
    BookQueueResponse, BulkKdpRequest, BulkKdpResponse, CredentialsResponse,
    GenerateBookRequest, GenerationSummary, KdpLoginStatus, RemoteQueueEntry, UploadRequest,
    UploadResponse,
};
use super::PublishingApi;

const GENERATE_BOOK: &str = "generate-book";
const GENERATE_PENDING_BOOKS: &str = "generate-pending-books";
const BULK_KDP_DATA: &str = "bulk/generate-kdp-data";
const UPLOAD_BOOK: &str = "upload-book";
const BOOK_QUEUE: &str = "book-queue";
const KDP_LOGIN_STATUS: &str = "kdp-login-status";
const CONFIG: &str = "config";

#[derive(Serialize)]
struct CredentialsBody<'a> {
    kdp_email: &'a str,
    kdp_password: &'a str,
}

/// Talks to the publishing backend over HTTP.
///
/// Status endpoints (`kdp-login-status`, `book-queue`) carry a request
/// timeout. Job endpoints do not: a generation legitimately runs for minutes.
pub struct HttpPublishingApi {
    client: Client,
    base_url: String,
    status_timeout: Duration,
}

impl HttpPublishingApi {
    /// Creates a client from API settings.
    pub fn new(settings: &ApiSettings) -> ApiResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .build()
            .map_err(|e| ApiError::Transport {
                endpoint: settings.base_url.clone(),
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            status_timeout: Duration::from_secs(settings.status_timeout_secs),
        })
    }

    /// Builds the absolute URL for an endpoint.
    pub fn endpoint_url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    async fn send<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: RequestBuilder,
    ) -> ApiResult<T> {
        debug!("Calling {}", endpoint);

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(endpoint, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(endpoint, status.as_u16(), &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })
    }

    async fn get_status<T: DeserializeOwned>(&self, endpoint: &str) -> ApiResult<T> {
        let request = self
            .client
            .get(self.endpoint_url(endpoint))
            .timeout(self.status_timeout);
        self.send(endpoint, request).await
    }

    async fn post_job<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> ApiResult<T> {
        let request = self.client.post(self.endpoint_url(endpoint)).json(body);
        self.send(endpoint, request).await
    }
}

#[async_trait]
impl PublishingApi for HttpPublishingApi {
    async fn generate_book(&self, request: &GenerateBookRequest) -> ApiResult<GenerationSummary> {
        self.post_job(GENERATE_BOOK, request).await
    }

    async fn generate_pending_books(&self) -> ApiResult<GenerationSummary> {
        self.post_job(GENERATE_PENDING_BOOKS, &serde_json::json!({}))
            .await
    }

    async fn generate_kdp_data(&self, book_ids: &[String]) -> ApiResult<BulkKdpResponse> {
        self.post_job(BULK_KDP_DATA, &BulkKdpRequest { book_ids })
            .await
    }

    async fn upload_book(&self, book_id: &str) -> ApiResult<UploadResponse> {
        self.post_job(UPLOAD_BOOK, &UploadRequest { book_id }).await
    }

    async fn book_queue(&self) -> ApiResult<Vec<RemoteQueueEntry>> {
        let response: BookQueueResponse = self.get_status(BOOK_QUEUE).await?;
        Ok(response.book_queue)
    }

    async fn kdp_login_status(&self) -> ApiResult<KdpLoginStatus> {
        self.get_status(KDP_LOGIN_STATUS).await
    }

    async fn submit_credentials(
        &self,
        credentials: &KdpCredentials,
    ) -> ApiResult<CredentialsResponse> {
        let body = CredentialsBody {
            kdp_email: &credentials.email,
            kdp_password: credentials.password.expose_secret(),
        };
        let request = self
            .client
            .post(self.endpoint_url(CONFIG))
            .timeout(self.status_timeout)
            .json(&body);
        self.send(CONFIG, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(base_url: &str) -> ApiSettings {
        ApiSettings {
            base_url: base_url.to_string(),
            ..ApiSettings::default()
        }
    }

    #[test]
    fn test_endpoint_url_joins_cleanly() {
        let api = HttpPublishingApi::new(&settings("http://localhost:8000/api/")).unwrap();
        assert_eq!(
            api.endpoint_url("book-queue"),
            "http://localhost:8000/api/book-queue"
        );
        assert_eq!(
            api.endpoint_url("/bulk/generate-kdp-data"),
            "http://localhost:8000/api/bulk/generate-kdp-data"
        );
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_retryable() {
        // Port 9 (discard) is not expected to accept HTTP connections.
        let api = HttpPublishingApi::new(&ApiSettings {
            base_url: "http://127.0.0.1:9".to_string(),
            connect_timeout_secs: 1,
            status_timeout_secs: 1,
        })
        .unwrap();

        let err = api.kdp_login_status().await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err:?}");
    }
}

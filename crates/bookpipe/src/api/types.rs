//! Wire types exchanged with the publishing backend.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Body of `POST generate-book`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GenerateBookRequest {
    pub prompt: String,
    pub n: u32,
    /// Client-assigned ids so the queue can echo them back.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub book_ids: Vec<String>,
}

/// Response of the generation endpoints.
///
/// The backend reports counts for the books it processed; a bare
/// acknowledgement with no counts means the whole request was accepted.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct GenerationSummary {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, alias = "processedBooks")]
    pub processed_books: u32,
    #[serde(default, alias = "successfulBooks")]
    pub successful_books: u32,
    #[serde(default, alias = "failedBooks")]
    pub failed_books: u32,
}

impl GenerationSummary {
    /// Returns `(processed, succeeded, failed)` for a request covering `total` books.
    pub fn resolve_counts(&self, total: u32) -> (u32, u32, u32) {
        if self.processed_books == 0 && self.successful_books == 0 && self.failed_books == 0 {
            return (total, total, 0);
        }
        let processed = self
            .processed_books
            .max(self.successful_books.saturating_add(self.failed_books));
        (processed, self.successful_books, self.failed_books)
    }
}

/// Body of `POST bulk/generate-kdp-data`.
#[derive(Debug, Clone, Serialize)]
pub struct BulkKdpRequest<'a> {
    pub book_ids: &'a [String],
}

/// Per-book outcome of a bulk call, when the backend reports one.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BulkItemResult {
    pub book_id: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Response of `POST bulk/generate-kdp-data`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct BulkKdpResponse {
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub results: Vec<BulkItemResult>,
}

/// Body of `POST upload-book`.
#[derive(Debug, Clone, Serialize)]
pub struct UploadRequest<'a> {
    pub book_id: &'a str,
}

/// Response of `POST upload-book`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct UploadResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub book_title: Option<String>,
}

/// Response of `GET book-queue`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookQueueResponse {
    #[serde(default)]
    pub book_queue: Vec<RemoteQueueEntry>,
}

/// The authoritative remote view of one book's pipeline position.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteQueueEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub niche: Option<String>,
    #[serde(default, alias = "targetAudience")]
    pub target_audience: Option<String>,
    #[serde(default, alias = "wordCount")]
    pub word_count: Option<u32>,
    #[serde(default)]
    pub chapters: Option<u32>,
    #[serde(default, alias = "authorName")]
    pub author_name: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default, alias = "manuscriptFilename")]
    pub manuscript_filename: Option<String>,
    #[serde(default, alias = "coverFilename")]
    pub cover_filename: Option<String>,
    #[serde(default, alias = "proofreadReport")]
    pub proofread_report: Option<String>,
    #[serde(default, alias = "kdpFormData")]
    pub kdp_form_data: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Response of `GET kdp-login-status`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct KdpLoginStatus {
    #[serde(default, alias = "isConnected")]
    pub logged_in: bool,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl KdpLoginStatus {
    /// The identifying email, if the response carries a non-empty one.
    pub fn account_email(&self) -> Option<&str> {
        self.email.as_deref().map(str::trim).filter(|e| !e.is_empty())
    }

    /// The explicit error, if the response carries a non-empty one.
    pub fn explicit_error(&self) -> Option<&str> {
        self.error.as_deref().map(str::trim).filter(|e| !e.is_empty())
    }
}

/// Response of `POST config`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct CredentialsResponse {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_status_accepts_both_field_names() {
        let a: KdpLoginStatus =
            serde_json::from_str(r#"{"logged_in": true, "email": "a@b.c"}"#).unwrap();
        let b: KdpLoginStatus =
            serde_json::from_str(r#"{"isConnected": true, "email": "a@b.c"}"#).unwrap();
        assert!(a.logged_in);
        assert!(b.logged_in);
        assert_eq!(a.account_email(), Some("a@b.c"));
    }

    #[test]
    fn test_login_status_blank_fields() {
        let status: KdpLoginStatus =
            serde_json::from_str(r#"{"logged_in": false, "email": " ", "error": ""}"#).unwrap();
        assert!(status.account_email().is_none());
        assert!(status.explicit_error().is_none());
    }

    #[test]
    fn test_queue_entry_parsing() {
        let body = r#"{
            "book_queue": [
                {"id": "b1", "title": "Sourdough", "status": "review", "wordCount": 12000,
                 "kdp_form_data": {"keywords": "bread"}},
                {"title": "No Id", "status": "pending"}
            ]
        }"#;
        let response: BookQueueResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.book_queue.len(), 2);
        assert_eq!(response.book_queue[0].id.as_deref(), Some("b1"));
        assert_eq!(response.book_queue[0].word_count, Some(12000));
        assert!(response.book_queue[0].kdp_form_data.is_some());
        assert!(response.book_queue[1].id.is_none());
    }

    #[test]
    fn test_generation_summary_counts() {
        let bare = GenerationSummary::default();
        assert_eq!(bare.resolve_counts(3), (3, 3, 0));

        let summary: GenerationSummary =
            serde_json::from_str(r#"{"processedBooks": 1, "successfulBooks": 1}"#).unwrap();
        assert_eq!(summary.resolve_counts(1), (1, 1, 0));

        let partial = GenerationSummary {
            message: None,
            processed_books: 0,
            successful_books: 2,
            failed_books: 1,
        };
        assert_eq!(partial.resolve_counts(3), (3, 2, 1));

        let overflowing = GenerationSummary {
            message: None,
            processed_books: 0,
            successful_books: u32::MAX,
            failed_books: 1,
        };
        assert_eq!(overflowing.resolve_counts(2), (u32::MAX, u32::MAX, 1));
    }
}

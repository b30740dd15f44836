use thiserror::Error;

use crate::db::DatabaseError;
use crate::error::WorkerError;
use crate::retry::RetryError;
use crate::secrets::SecretError;
use crate::session::SessionError;

use super::book::BookStatus;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// No verified KDP connection; re-authorize before retrying.
    #[error("A verified KDP connection is required")]
    SessionRequired,

    #[error("Book '{0}' not found")]
    BookNotFound(String),

    #[error("Book '{book_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        book_id: String,
        from: BookStatus,
        to: BookStatus,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Book '{0}' has no failed stage to retry")]
    NothingToRetry(String),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Queue reconciliation failed: {0}")]
    Reconcile(#[from] RetryError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Credentials unavailable: {0}")]
    Credentials(#[from] SecretError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] DatabaseError),
}

use thiserror::Error;

use crate::db::DatabaseError;
use crate::retry::RetryError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session store error: {0}")]
    Store(#[from] DatabaseError),

    #[error("KDP credentials rejected: {message}")]
    CredentialsRejected { message: String },

    #[error("Credential submission failed: {0}")]
    Submission(#[from] RetryError),

    #[error("KDP login could not be verified: {reason}")]
    NotConnected { reason: String },

    #[error("KDP login status still pending after {attempts} attempt(s)")]
    TimedOut { attempts: u32 },
}

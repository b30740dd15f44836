//! Publishing API error types.

use thiserror::Error;

/// Maximum length for response bodies carried in error messages.
const MAX_ERROR_BODY_LENGTH: usize = 200;

/// Errors returned by calls against the publishing backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The request never produced a response (DNS, connection reset, ...).
    #[error("Request to '{endpoint}' failed: {message}")]
    Transport { endpoint: String, message: String },

    /// The request did not complete in time.
    #[error("Request to '{endpoint}' timed out")]
    Timeout { endpoint: String },

    /// The server answered with a 5xx or asked us to back off (429).
    #[error("Server error from '{endpoint}' ({status}): {message}")]
    Server {
        endpoint: String,
        status: u16,
        message: String,
    },

    /// The server explicitly refused the request.
    #[error("'{endpoint}' rejected the request ({status}): {message}")]
    Rejected {
        endpoint: String,
        status: u16,
        message: String,
    },

    /// The account is not (or no longer) authenticated.
    #[error("Authentication required by '{endpoint}': {message}")]
    Unauthorized { endpoint: String, message: String },

    /// A response arrived but could not be understood.
    #[error("Failed to decode response from '{endpoint}': {message}")]
    Decode { endpoint: String, message: String },
}

impl ApiError {
    /// Returns true if the error is likely transient and the call can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::Transport { .. } | ApiError::Timeout { .. } | ApiError::Server { .. }
        )
    }

    /// Returns true if the backend reported that the KDP session is gone.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. })
    }

    /// The endpoint the failed request was sent to.
    pub fn endpoint(&self) -> &str {
        match self {
            ApiError::Transport { endpoint, .. }
            | ApiError::Timeout { endpoint }
            | ApiError::Server { endpoint, .. }
            | ApiError::Rejected { endpoint, .. }
            | ApiError::Unauthorized { endpoint, .. }
            | ApiError::Decode { endpoint, .. } => endpoint,
        }
    }

    /// Converts a reqwest error into the matching variant.
    pub fn from_reqwest(endpoint: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return ApiError::Timeout {
                endpoint: endpoint.to_string(),
            };
        }
        if err.is_decode() {
            return ApiError::Decode {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            };
        }
        if let Some(status) = err.status() {
            return classify_status(endpoint, status.as_u16(), &err.to_string());
        }
        ApiError::Transport {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        }
    }
}

/// Truncates a response body so it can be carried in an error message.
fn truncate_body(body: &str) -> String {
    let body = body.trim();
    if body.len() > MAX_ERROR_BODY_LENGTH {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &body[..end])
    } else {
        body.to_string()
    }
}

/// Classifies a non-success HTTP status into an error variant.
pub fn classify_status(endpoint: &str, status: u16, body: &str) -> ApiError {
    let endpoint = endpoint.to_string();
    let message = truncate_body(body);

    match status {
        401 | 403 => ApiError::Unauthorized { endpoint, message },
        408 => ApiError::Timeout { endpoint },
        429 | 500..=599 => ApiError::Server {
            endpoint,
            status,
            message,
        },
        _ => ApiError::Rejected {
            endpoint,
            status,
            message,
        },
    }
}

/// Result type for publishing API calls.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

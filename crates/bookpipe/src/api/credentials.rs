//! KDP account credentials and the credential-submission success contract.

use secrecy::SecretString;

use crate::config::schema::CredentialSettings;
use crate::secrets::{resolve_secret, SecretError};

use super::types::CredentialsResponse;

/// KDP account credentials submitted through `POST config`.
#[derive(Debug, Clone)]
pub struct KdpCredentials {
    pub email: String,
    pub password: SecretString,
}

impl KdpCredentials {
    pub fn new(email: impl Into<String>, password: SecretString) -> Self {
        Self {
            email: email.into(),
            password,
        }
    }

    /// Resolves credentials from configuration (direct value, file or env var).
    pub fn from_settings(settings: &CredentialSettings) -> Result<Self, SecretError> {
        let password = resolve_secret(
            settings.password.as_deref(),
            settings.password_file.as_deref(),
            settings.password_env_var.as_deref(),
        )?;
        Ok(Self::new(settings.email.clone(), password))
    }
}

/// Decides whether the backend accepted submitted credentials.
///
/// The backend does not return a structured status for this call everywhere.
/// An explicit `success` flag wins; otherwise the free-text message is
/// inspected. All callers go through this function so the heuristic can be
/// replaced in one place.
pub fn credentials_accepted(response: &CredentialsResponse) -> bool {
    if let Some(success) = response.success {
        return success;
    }

    let message = response.message.to_lowercase();
    let negative = ["fail", "error", "invalid", "incorrect", "denied", "unsuccessful"];
    if negative.iter().any(|word| message.contains(word)) {
        return false;
    }
    message.contains("success") || message.contains("saved")
}

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The KDP account connection as last verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSession {
    pub is_connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub last_connected: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ExternalSession {
    /// A session verified at `now`, valid for `ttl`.
    pub fn connected(email: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            is_connected: true,
            email: Some(email.into()),
            last_connected: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Connected and not expired. Anything else must be re-probed.
    pub fn is_trusted(&self, now: DateTime<Utc>) -> bool {
        self.is_connected && !self.is_expired(now)
    }
}

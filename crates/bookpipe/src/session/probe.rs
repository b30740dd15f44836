//! Polling of the KDP login status until a terminal condition.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use tracing::{info_span, Instrument};

use crate::api::PublishingApi;
use crate::broadcast::{SessionEvent, SessionEventBroadcaster};
use crate::retry::{ErrorClass, RetryPolicy};

use super::model::ExternalSession;
use super::store::SessionStore;

/// How a probe ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Connected(ExternalSession),
    /// The backend answered with an explicit error or a terminal rejection.
    Failed(String),
    /// Every attempt was used without a definite answer.
    TimedOut { attempts: u32 },
}

impl ProbeOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, ProbeOutcome::Connected(_))
    }
}

/// Polls `GET kdp-login-status` within a fixed attempt budget.
pub struct StatusProbe {
    api: Arc<dyn PublishingApi>,
    store: Arc<dyn SessionStore>,
    policy: RetryPolicy,
    ttl: ChronoDuration,
    events: SessionEventBroadcaster,
}

impl StatusProbe {
    pub fn new(
        api: Arc<dyn PublishingApi>,
        store: Arc<dyn SessionStore>,
        policy: RetryPolicy,
        ttl: ChronoDuration,
        events: SessionEventBroadcaster,
    ) -> Self {
        Self {
            api,
            store,
            policy,
            ttl,
            events,
        }
    }

    pub fn events(&self) -> &SessionEventBroadcaster {
        &self.events
    }

    pub async fn probe(&self) -> ProbeOutcome {
        let span = info_span!("status_probe", max_attempts = self.policy.max_attempts);
        self.poll().instrument(span).await
    }

    async fn poll(&self) -> ProbeOutcome {
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.api.kdp_login_status().await {
                Ok(status) => {
                    if status.logged_in {
                        if let Some(email) = status.account_email() {
                            return self.connected(email);
                        }
                        debug!("Login reported without an account email (attempt {})", attempt);
                    } else if let Some(error) = status.explicit_error() {
                        warn!("KDP login failed: {}", error);
                        return ProbeOutcome::Failed(error.to_string());
                    } else {
                        debug!("KDP login pending (attempt {}/{})", attempt, max_attempts);
                    }
                }
                Err(e) => match RetryPolicy::classify(&e) {
                    ErrorClass::Terminal => {
                        warn!("KDP login status rejected: {}", e);
                        return ProbeOutcome::Failed(e.to_string());
                    }
                    ErrorClass::Retryable => {
                        debug!(
                            "Transient error polling login status (attempt {}/{}): {}",
                            attempt, max_attempts, e
                        );
                    }
                },
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.policy.delay_after(attempt)).await;
            }
        }

        warn!("KDP login status undecided after {} attempt(s)", max_attempts);
        ProbeOutcome::TimedOut {
            attempts: max_attempts,
        }
    }

    fn connected(&self, email: &str) -> ProbeOutcome {
        let session = ExternalSession::connected(email, Utc::now(), self.ttl);
        if let Err(e) = self.store.set(&session) {
            warn!("Failed to persist KDP session: {}", e);
        }
        info!("KDP account connected as {}", email);
        self.events.send(SessionEvent::Connected(session.clone()));
        ProbeOutcome::Connected(session)
    }
}

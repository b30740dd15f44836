//! Pipeline entry guard backed by a verified KDP connection.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::api::{credentials_accepted, ApiError, KdpCredentials, PublishingApi};
use crate::broadcast::SessionEvent;
use crate::retry::{RetryError, RetryPolicy};

use super::error::SessionError;
use super::model::ExternalSession;
use super::probe::{ProbeOutcome, StatusProbe};
use super::store::SessionStore;

#[derive(Default)]
struct Cached {
    loaded: bool,
    session: Option<ExternalSession>,
}

/// Decides whether pipeline stages may touch the network.
///
/// A persisted, unexpired session is trusted without a network call. Anything
/// else triggers one [`StatusProbe`] run. Checks are serialized so rapid calls
/// share one probe.
pub struct SessionGate {
    probe: StatusProbe,
    store: Arc<dyn SessionStore>,
    api: Arc<dyn PublishingApi>,
    policy: RetryPolicy,
    cache: Mutex<Cached>,
    events: Mutex<broadcast::Receiver<SessionEvent>>,
    check: tokio::sync::Mutex<()>,
}

impl SessionGate {
    /// `policy` governs credential submission; the probe carries its own.
    pub fn new(
        probe: StatusProbe,
        store: Arc<dyn SessionStore>,
        api: Arc<dyn PublishingApi>,
        policy: RetryPolicy,
    ) -> Self {
        let events = probe.events().subscribe();
        Self {
            probe,
            store,
            api,
            policy,
            cache: Mutex::new(Cached::default()),
            events: Mutex::new(events),
            check: tokio::sync::Mutex::new(()),
        }
    }

    /// True once a connected, unexpired session is known.
    pub async fn ensure_connected(&self) -> bool {
        self.verify().await.is_connected()
    }

    /// Like [`ensure_connected`](Self::ensure_connected), keeping the reason.
    pub async fn verify(&self) -> ProbeOutcome {
        let _guard = self.check.lock().await;

        let now = Utc::now();
        if let Some(session) = self.session() {
            if session.is_trusted(now) {
                debug!("Trusting cached KDP session (expires {})", session.expires_at);
                return ProbeOutcome::Connected(session);
            }
            info!("Cached KDP session expired at {}, re-probing", session.expires_at);
        }

        let outcome = self.probe.probe().await;
        let mut cache = self.lock_cache();
        cache.loaded = true;
        cache.session = match &outcome {
            ProbeOutcome::Connected(session) => Some(session.clone()),
            _ => None,
        };
        outcome
    }

    /// Submits credentials, then confirms the login with a probe.
    pub async fn connect(
        &self,
        credentials: &KdpCredentials,
    ) -> Result<ExternalSession, SessionError> {
        let _guard = self.check.lock().await;

        let response = self
            .policy
            .run("config", |_| self.api.submit_credentials(credentials))
            .await
            .map_err(|e| match e {
                RetryError::Rejected {
                    source: ApiError::Rejected { message, .. } | ApiError::Unauthorized { message, .. },
                    ..
                } => SessionError::CredentialsRejected { message },
                other => SessionError::Submission(other),
            })?;

        if !credentials_accepted(&response) {
            warn!("KDP credentials for {} rejected: {}", credentials.email, response.message);
            return Err(SessionError::CredentialsRejected {
                message: response.message,
            });
        }

        info!("KDP credentials for {} accepted, verifying login", credentials.email);
        match self.probe.probe().await {
            ProbeOutcome::Connected(session) => {
                let mut cache = self.lock_cache();
                cache.loaded = true;
                cache.session = Some(session.clone());
                Ok(session)
            }
            ProbeOutcome::Failed(reason) => Err(SessionError::NotConnected { reason }),
            ProbeOutcome::TimedOut { attempts } => Err(SessionError::TimedOut { attempts }),
        }
    }

    /// Forgets the session. The next check re-probes.
    pub fn invalidate(&self) {
        if let Err(e) = self.store.clear() {
            warn!("Failed to clear persisted KDP session: {}", e);
        }
        {
            let mut cache = self.lock_cache();
            cache.loaded = true;
            cache.session = None;
        }
        info!("KDP session invalidated");
        self.probe.events().send(SessionEvent::Invalidated);
    }

    /// The session as currently known, trusted or not.
    pub fn session(&self) -> Option<ExternalSession> {
        self.apply_events();
        let mut cache = self.lock_cache();
        if !cache.loaded {
            cache.session = match self.store.get() {
                Ok(session) => session,
                Err(e) => {
                    warn!("Failed to read persisted KDP session: {}", e);
                    None
                }
            };
            cache.loaded = true;
        }
        cache.session.clone()
    }

    /// Session notifications, for components that mirror the connection.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.probe.events().subscribe()
    }

    fn apply_events(&self) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match events.try_recv() {
                Ok(SessionEvent::Connected(session)) => {
                    let mut cache = self.lock_cache();
                    cache.loaded = true;
                    cache.session = Some(session);
                }
                Ok(SessionEvent::Invalidated) => {
                    let mut cache = self.lock_cache();
                    cache.loaded = true;
                    cache.session = None;
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    debug!("Skipped {} stale session event(s)", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, Cached> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

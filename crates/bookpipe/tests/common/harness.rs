//! Test harness for isolated pipeline runs.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use bookpipe::config::RetrySettings;
use bookpipe::db::Database;
use bookpipe::session::KvSessionStore;
use bookpipe::{
    ExternalSession, PipelineError, PipelineOrchestrator, SessionStore, Settings, StageOutcome,
    StageStart,
};

use super::backend::ScriptedBackend;

pub const ACCOUNT: &str = "author@example.com";

/// Settings with no waiting anywhere: zero retry intervals, no settle delay
/// and no periodic sync.
pub fn fast_settings() -> Settings {
    let fast = RetrySettings {
        interval_ms: 0,
        max_attempts: 2,
        max_interval_ms: None,
    };
    let mut settings = Settings::default();
    settings.probe = fast.clone();
    settings.retry = fast;
    settings.sync.settle_delay_ms = 0;
    settings.sync.interval_secs = 0;
    settings
}

/// An orchestrator over a database file in its own temporary directory.
pub struct TestHarness {
    temp_dir: TempDir,
    pub db_path: PathBuf,
    pub backend: Arc<ScriptedBackend>,
    pub settings: Settings,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("bookpipe.db");
        Self {
            temp_dir,
            db_path,
            backend: ScriptedBackend::new(),
            settings: fast_settings(),
        }
    }

    pub fn database(&self) -> Database {
        Database::open(&self.db_path).expect("Failed to open database")
    }

    /// Persists a session that is trusted until `expires_in` from now.
    pub fn persist_session(&self, expires_in: Duration) {
        let now = Utc::now();
        let session = ExternalSession {
            is_connected: true,
            email: Some(ACCOUNT.to_string()),
            last_connected: now - Duration::hours(1),
            expires_at: now + expires_in,
        };
        KvSessionStore::new(self.database())
            .set(&session)
            .expect("Failed to persist session");
    }

    /// Opens a fresh orchestrator over the harness database, as a restarted
    /// application would.
    pub fn orchestrator(&self) -> PipelineOrchestrator {
        PipelineOrchestrator::with_api(&self.settings, self.backend.clone(), Some(self.database()))
            .expect("Failed to build orchestrator")
    }

    /// An orchestrator with a trusted session already persisted.
    pub fn connected(&self) -> PipelineOrchestrator {
        self.persist_session(Duration::hours(24));
        self.orchestrator()
    }
}

/// Waits for a stage that must have started.
pub async fn finish(start: Result<StageStart, PipelineError>) -> StageOutcome {
    start
        .expect("stage request should be accepted")
        .task()
        .expect("stage should start")
        .wait()
        .await
}

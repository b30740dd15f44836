//! Where the verified session lives between runs.

use std::sync::{Mutex, PoisonError};

use crate::db::{kv_repo, Database, DatabaseError};

use super::model::ExternalSession;

/// Key of the persisted session record.
pub const SESSION_KEY: &str = "kdp_session";

/// Injected into the gate and the probe instead of a global.
pub trait SessionStore: Send + Sync {
    fn get(&self) -> Result<Option<ExternalSession>, DatabaseError>;
    fn set(&self, session: &ExternalSession) -> Result<(), DatabaseError>;
    fn clear(&self) -> Result<(), DatabaseError>;
}

/// Process-local store, mostly for tests and ephemeral runs.
#[derive(Default)]
pub struct MemorySessionStore {
    session: Mutex<Option<ExternalSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: ExternalSession) -> Self {
        Self {
            session: Mutex::new(Some(session)),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self) -> Result<Option<ExternalSession>, DatabaseError> {
        Ok(self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn set(&self, session: &ExternalSession) -> Result<(), DatabaseError> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), DatabaseError> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// Session persisted in the SQLite key-value table.
#[derive(Clone)]
pub struct KvSessionStore {
    db: Database,
}

impl KvSessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl SessionStore for KvSessionStore {
    fn get(&self) -> Result<Option<ExternalSession>, DatabaseError> {
        match kv_repo::get_json(&self.db, SESSION_KEY) {
            Ok(session) => Ok(session),
            // An unreadable record is as good as none; the gate re-probes.
            Err(DatabaseError::Serialization { key, source }) => {
                log::warn!("Discarding unreadable session record '{}': {}", key, source);
                kv_repo::delete(&self.db, SESSION_KEY)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn set(&self, session: &ExternalSession) -> Result<(), DatabaseError> {
        kv_repo::put_json(&self.db, SESSION_KEY, session)
    }

    fn clear(&self) -> Result<(), DatabaseError> {
        kv_repo::delete(&self.db, SESSION_KEY).map(|_| ())
    }
}

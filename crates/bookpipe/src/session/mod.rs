//! KDP account session: persisted record, status probe and entry gate.

pub mod error;
pub mod gate;
pub mod model;
pub mod probe;
pub mod store;

pub use error::SessionError;
pub use gate::SessionGate;
pub use model::ExternalSession;
pub use probe::{ProbeOutcome, StatusProbe};
pub use store::{KvSessionStore, MemorySessionStore, SessionStore, SESSION_KEY};

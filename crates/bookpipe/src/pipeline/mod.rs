//! Book lifecycle: the book model and store, queue reconciliation and the
//! orchestrator exposing the stage triggers.

pub mod book;
pub mod book_store;
pub mod error;
pub mod in_flight;
pub mod orchestrator;
pub mod sync;
pub mod sync_scheduler;

pub use book::{Book, BookStatus, Provisional};
pub use book_store::{BookStore, SAVED_BOOKS_KEY};
pub use error::PipelineError;
pub use in_flight::{InFlightGuard, InFlightRegistry};
pub use orchestrator::{PipelineOrchestrator, StageOutcome, StageStart, StageTask};
pub use sync::{merge, Discrepancy, MergeReport, QueueSynchronizer};
pub use sync_scheduler::SyncScheduler;

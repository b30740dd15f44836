//! Broadcast channels for real-time event streaming.

pub mod book_events;
pub mod job_progress;
pub mod session_events;

pub use book_events::{BookEvent, BookEventBroadcaster};
pub use job_progress::{JobPhase, JobProgressBroadcaster, JobProgressEvent, JobProgressTracker};
pub use session_events::{SessionEvent, SessionEventBroadcaster};

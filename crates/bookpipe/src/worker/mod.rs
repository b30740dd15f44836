//! Background job execution: one worker per job kind, message passing only.

pub mod job;
pub mod registry;
pub mod runner;

pub use job::{
    ItemOutcome, JobEvent, JobKind, JobProgress, JobResult, JobRun, JobRunStatus, JobSpec,
};
pub use registry::WorkerRegistry;
pub use runner::{JobStream, JobWorker};

pub mod api;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod retry;
pub mod secrets;
pub mod session;
pub mod telemetry;
pub mod worker;

pub use api::{HttpPublishingApi, KdpCredentials, PublishingApi};
pub use broadcast::{BookEvent, JobProgressBroadcaster, JobProgressEvent, SessionEvent};
pub use config::{load_config, load_config_from_str, Settings};
pub use error::{BookpipeError, ConfigError, Result, WorkerError};
pub use pipeline::{
    Book, BookStatus, PipelineError, PipelineOrchestrator, StageOutcome, StageStart, StageTask,
};
pub use retry::{RetryError, RetryPolicy};
pub use secrets::{resolve_secret, SecretError};
pub use session::{ExternalSession, ProbeOutcome, SessionGate, SessionStore};
pub use worker::{JobKind, JobResult, JobRun, JobRunStatus};

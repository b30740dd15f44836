use std::path::PathBuf;
use thiserror::Error;

use crate::worker::JobKind;

#[derive(Error, Debug)]
pub enum BookpipeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("API error: {0}")]
    Api(#[from] crate::api::ApiError),

    #[error("Session error: {0}")]
    Session(#[from] crate::session::SessionError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] crate::pipeline::PipelineError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Secret error: {0}")]
    Secret(#[from] crate::secrets::SecretError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] crate::telemetry::TelemetryError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid setting '{name}': {reason}")]
    InvalidSetting { name: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("A {0} job is already running")]
    AlreadyRunning(JobKind),

    #[error("Job spec for {spec} submitted to the {worker} worker")]
    KindMismatch { worker: JobKind, spec: JobKind },

    #[error("No worker registered for {0} jobs")]
    NotRegistered(JobKind),

    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),
}

pub type Result<T> = std::result::Result<T, BookpipeError>;

//! Logging setup.
//!
//! The crate logs through both `log` and `tracing`. `init_logging` bridges
//! `log` records into `tracing` and installs one fmt subscriber, text or JSON.
//! `RUST_LOG` overrides the configured level.

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::schema::{LogFormat, LoggingSettings};

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("A global subscriber is already installed")]
    AlreadyInitialized,
}

/// Builds the filter: `RUST_LOG` when set, else the configured level.
pub fn build_filter(settings: &LoggingSettings) -> Result<EnvFilter, TelemetryError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&settings.level).map_err(|e| TelemetryError::InvalidFilter {
        filter: settings.level.clone(),
        reason: e.to_string(),
    })
}

/// Installs the global subscriber. Call once at startup.
pub fn init_logging(settings: &LoggingSettings) -> Result<(), TelemetryError> {
    let filter = build_filter(settings)?;

    // Already set when the host application bridged `log` itself.
    tracing_log::LogTracer::init().ok();

    let registry = tracing_subscriber::registry().with(filter);
    let result = match settings.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).try_init(),
    };
    result.map_err(|_| TelemetryError::AlreadyInitialized)?;

    tracing::info!(format = ?settings.format, level = %settings.level, "Logging initialized");
    Ok(())
}

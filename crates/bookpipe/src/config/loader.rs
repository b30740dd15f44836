use std::path::Path;

use crate::config::schema::Settings;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Settings, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Settings, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let settings: Settings = serde_json::from_value(json_value)?;

    validate_settings(&settings)?;

    Ok(settings)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();

    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

pub(crate) fn validate_settings(settings: &Settings) -> Result<(), ConfigError> {
    if settings.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", settings.version),
        });
    }

    let url = reqwest::Url::parse(&settings.api.base_url).map_err(|e| {
        ConfigError::InvalidSetting {
            name: "api.base_url".to_string(),
            reason: e.to_string(),
        }
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidSetting {
            name: "api.base_url".to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }

    for (name, retry) in [("probe", &settings.probe), ("retry", &settings.retry)] {
        if retry.max_attempts == 0 {
            return Err(ConfigError::InvalidSetting {
                name: format!("{}.max_attempts", name),
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(max) = retry.max_interval_ms {
            if max < retry.interval_ms {
                return Err(ConfigError::InvalidSetting {
                    name: format!("{}.max_interval_ms", name),
                    reason: "must not be smaller than interval_ms".to_string(),
                });
            }
        }
    }

    if settings.session.ttl_hours <= 0 {
        return Err(ConfigError::InvalidSetting {
            name: "session.ttl_hours".to_string(),
            reason: "must be positive".to_string(),
        });
    }

    if settings.jobs.log_capacity == 0 {
        return Err(ConfigError::InvalidSetting {
            name: "jobs.log_capacity".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }

    if let Some(credentials) = &settings.credentials {
        if credentials.email.trim().is_empty() {
            return Err(ConfigError::InvalidSetting {
                name: "credentials.email".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
    }

    Ok(())
}

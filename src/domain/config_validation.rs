//! Configuration validation.
//!
//! Validates every config field before a service is built from it.

use super::entity::WorkKind;
use super::error::QuantopsError;
use super::settings::{ReplayPolicy, StoreBackend};
use crate::ports::config_port::ConfigPort;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 2] = ["pretty", "json"];

pub fn validate_config(config: &dyn ConfigPort) -> Result<(), QuantopsError> {
    validate_store(config)?;
    validate_idempotency(config)?;
    validate_executor(config)?;
    validate_logging(config)?;
    Ok(())
}

fn invalid(section: &str, key: &str, reason: impl Into<String>) -> QuantopsError {
    QuantopsError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn validate_store(config: &dyn ConfigPort) -> Result<(), QuantopsError> {
    let backend = match config.get_string("store", "backend") {
        Some(raw) => raw
            .parse::<StoreBackend>()
            .map_err(|_| invalid("store", "backend", "backend must be memory or sqlite"))?,
        None => StoreBackend::Sqlite,
    };

    if backend == StoreBackend::Sqlite {
        match config.get_string("store", "path") {
            Some(path) if !path.trim().is_empty() => {}
            Some(_) => return Err(invalid("store", "path", "path must not be empty")),
            None => {
                return Err(QuantopsError::ConfigMissing {
                    section: "store".to_string(),
                    key: "path".to_string(),
                });
            }
        }
    }

    if let Some(raw) = config.get_string("store", "pool_size") {
        match raw.trim().parse::<u32>() {
            Ok(n) if n >= 1 => {}
            _ => {
                return Err(invalid(
                    "store",
                    "pool_size",
                    "pool_size must be between 1 and 4294967295",
                ));
            }
        }
    }
    Ok(())
}

fn validate_idempotency(config: &dyn ConfigPort) -> Result<(), QuantopsError> {
    for key in config.keys("idempotency") {
        if key.parse::<WorkKind>().is_err() {
            return Err(invalid("idempotency", &key, "not a known kind"));
        }
        let value = config.get_string("idempotency", &key).unwrap_or_default();
        if value.parse::<ReplayPolicy>().is_err() {
            return Err(invalid("idempotency", &key, "policy must be replay or reject"));
        }
    }
    Ok(())
}

fn validate_executor(config: &dyn ConfigPort) -> Result<(), QuantopsError> {
    match config.get_string("executor", "default") {
        Some(name) if name.trim().is_empty() => {
            Err(invalid("executor", "default", "executor name must not be empty"))
        }
        _ => Ok(()),
    }
}

fn validate_logging(config: &dyn ConfigPort) -> Result<(), QuantopsError> {
    if let Some(level) = config.get_string("logging", "level") {
        if !LOG_LEVELS.contains(&level.trim().to_ascii_lowercase().as_str()) {
            return Err(invalid(
                "logging",
                "level",
                "level must be one of trace, debug, info, warn, error",
            ));
        }
    }
    if let Some(format) = config.get_string("logging", "format") {
        if !LOG_FORMATS.contains(&format.trim()) {
            return Err(invalid("logging", "format", "format must be pretty or json"));
        }
    }
    Ok(())
}

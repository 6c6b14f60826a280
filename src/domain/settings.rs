//! Typed settings built from a validated [`ConfigPort`].

use std::collections::HashMap;
use std::str::FromStr;

use super::config_validation::validate_config;
use super::entity::WorkKind;
use super::error::QuantopsError;
use crate::ports::config_port::ConfigPort;

/// What a repeated submission under an already-used key does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayPolicy {
    /// Return the existing entity when kind and payload match.
    Replay,
    /// Always raise an idempotency conflict.
    Reject,
}

impl ReplayPolicy {
    pub fn default_for(kind: WorkKind) -> Self {
        match kind {
            WorkKind::Job | WorkKind::BacktestTask | WorkKind::TradingSignal => ReplayPolicy::Replay,
            WorkKind::TradeOrder => ReplayPolicy::Reject,
        }
    }
}

impl FromStr for ReplayPolicy {
    type Err = QuantopsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replay" => Ok(ReplayPolicy::Replay),
            "reject" => Ok(ReplayPolicy::Reject),
            other => Err(QuantopsError::invalid_input(format!(
                "unknown replay policy {other:?}, expected replay or reject"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    replay: HashMap<WorkKind, ReplayPolicy>,
    pub default_executor: Option<String>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        ServiceSettings {
            replay: WorkKind::ALL
                .into_iter()
                .map(|kind| (kind, ReplayPolicy::default_for(kind)))
                .collect(),
            default_executor: None,
        }
    }
}

impl ServiceSettings {
    pub fn replay_policy(&self, kind: WorkKind) -> ReplayPolicy {
        self.replay
            .get(&kind)
            .copied()
            .unwrap_or_else(|| ReplayPolicy::default_for(kind))
    }

    pub fn with_replay_policy(mut self, kind: WorkKind, policy: ReplayPolicy) -> Self {
        self.replay.insert(kind, policy);
        self
    }

    pub fn with_default_executor(mut self, name: impl Into<String>) -> Self {
        self.default_executor = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

impl FromStr for StoreBackend {
    type Err = QuantopsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "sqlite" => Ok(StoreBackend::Sqlite),
            other => Err(QuantopsError::invalid_input(format!(
                "unknown store backend {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub backend: StoreBackend,
    pub service: ServiceSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, QuantopsError> {
        validate_config(config)?;

        let backend = match config.get_string("store", "backend") {
            Some(raw) => raw.parse()?,
            None => StoreBackend::Sqlite,
        };

        let mut service = ServiceSettings::default();
        for key in config.keys("idempotency") {
            let kind: WorkKind = key.parse()?;
            if let Some(raw) = config.get_string("idempotency", &key) {
                service = service.with_replay_policy(kind, raw.parse()?);
            }
        }
        service.default_executor = config
            .get_string("executor", "default")
            .filter(|name| !name.trim().is_empty());

        let logging = LoggingSettings {
            level: config
                .get_string("logging", "level")
                .unwrap_or_else(|| "info".to_string()),
            format: match config.get_string("logging", "format").as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        Ok(Settings {
            backend,
            service,
            logging,
        })
    }
}

//! Tracing subscriber setup for the `rig_services` binary.
//!
//! `RUST_LOG` takes precedence over the configured level.

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

use crate::error::{AppResult, ServiceError};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, ANSI-coloured lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(ServiceError::Configuration(format!(
                "Invalid log format '{other}'. Must be one of: text, json"
            ))),
        }
    }
}

/// Filter used when `RUST_LOG` is unset: `level` for this crate, `warn` elsewhere.
pub fn default_filter(level: &str) -> AppResult<EnvFilter> {
    EnvFilter::try_new(format!("warn,rig_services={level}"))
        .map_err(|err| ServiceError::Configuration(format!("Invalid log level '{level}': {err}")))
}

/// Installs the global subscriber.
pub fn init(level: &str, format: LogFormat) -> AppResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => default_filter(level)?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|err| ServiceError::Configuration(format!("Logging already initialized: {err}")))
}

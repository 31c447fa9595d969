//! Session metadata handed to artifact sinks.
//!
//! A `SessionMetadata` identifies one recording session: which rig ran it,
//! when, under what name, and with which free-form parameters. It is built
//! once per run and passed alongside each device's artifacts at finalize
//! time, so a manifest writer can attribute files without querying devices.
//!
//! ## `SessionMetadataBuilder`
//!
//! The builder fills in the run id, host name, start time and software
//! version automatically; callers add the experiment name and parameters.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one recording session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMetadata {
    /// Unique id of this run.
    pub run_id: Uuid,
    /// The name of the experiment or session folder.
    pub experiment_name: String,
    /// Host the orchestrator ran on.
    pub hostname: String,
    /// Operator running the session.
    pub operator: String,
    /// When the session metadata was created.
    pub started_at: DateTime<Utc>,
    /// User-defined session parameters.
    pub parameters: HashMap<String, serde_json::Value>,
    /// Version of the orchestration software.
    pub software_version: String,
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            experiment_name: "Default Session".to_string(),
            hostname: local_hostname(),
            operator: String::new(),
            started_at: Utc::now(),
            parameters: HashMap::new(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// A builder for constructing `SessionMetadata` instances.
#[derive(Default)]
pub struct SessionMetadataBuilder {
    inner: SessionMetadata,
}

impl SessionMetadataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn experiment_name(mut self, name: &str) -> Self {
        self.inner.experiment_name = name.to_string();
        self
    }

    pub fn operator(mut self, operator: &str) -> Self {
        self.inner.operator = operator.to_string();
        self
    }

    pub fn parameter(mut self, key: &str, value: serde_json::Value) -> Self {
        self.inner.parameters.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> SessionMetadata {
        self.inner
    }
}

impl SessionMetadata {
    /// Validates the metadata.
    pub fn validate(&self) -> Result<(), String> {
        if self.experiment_name.is_empty() {
            return Err("Experiment name cannot be empty.".to_string());
        }
        Ok(())
    }
}

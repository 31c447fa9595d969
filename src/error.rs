//! Custom error types for the rig services.
//!
//! This module defines the primary error type, `ServiceError`, used by every
//! lifecycle step. Using the `thiserror` crate it gives one consistent taxonomy
//! for everything that can go wrong while driving an external device, from
//! configuration problems to a recording that never produced a file.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`** / **`ConfigLoad`**: missing or invalid configuration, or a
//!   data root that cannot be reached. Fatal, raised at setup and never retried.
//! - **`Connectivity`**: the device did not answer the reachability check or a
//!   status query. Surfaced through `test()`; retrying is up to the caller.
//! - **`Test`**: a preflight or self-check failed. Blocks `start()`.
//! - **Lifecycle assertions** (`NotInitialized`, `NotReady`, `NotStarted`,
//!   `NoEvidence`, `NoArtifact`, `EmptyArtifact`, `WrongFormat`): a precondition of a
//!   lifecycle step was violated. These always propagate to the caller, after
//!   `stop()` has been attempted when a recording was running.
//! - **`Protocol`**: the device answered with something the integration could not
//!   interpret.
//! - **`Io`**, **`Json`**: wrapped lower-level failures.
//!
//! Bounded waits that exceed their deadline are deliberately *not* errors: they
//! are reported through return values and a logged warning.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias for results using the service error type.
pub type AppResult<T> = std::result::Result<T, ServiceError>;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] figment::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Test failed: {0}")]
    Test(String),

    #[error("{0} has not been initialized")]
    NotInitialized(String),

    #[error("{device} not ready to start: {state}")]
    NotReady { device: String, state: String },

    #[error("{device} not started: {state}")]
    NotStarted { device: String, state: String },

    #[error("{device} shows no evidence of recording: {reason}")]
    NoEvidence { device: String, reason: String },

    #[error("{0} has no data file to validate")]
    NoArtifact(String),

    #[error("Empty file: {}", .0.display())]
    EmptyArtifact(PathBuf),

    #[error("Expected a .{expected} file: {}", .path.display())]
    WrongFormat { path: PathBuf, expected: String },

    #[error("Unexpected response from {device}: {detail}")]
    Protocol { device: String, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<ServiceError>),
}

impl ServiceError {
    /// True for the assertion-class errors raised when a lifecycle precondition
    /// is violated.
    pub fn is_assertion(&self) -> bool {
        matches!(
            self,
            ServiceError::NotInitialized(_)
                | ServiceError::NotReady { .. }
                | ServiceError::NotStarted { .. }
                | ServiceError::NoEvidence { .. }
                | ServiceError::NoArtifact(_)
                | ServiceError::EmptyArtifact(_)
                | ServiceError::WrongFormat { .. }
        )
    }

    pub(crate) fn protocol(device: &str, detail: impl Into<String>) -> Self {
        ServiceError::Protocol {
            device: device.to_string(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ServiceError::NotReady {
            device: "Sync".to_string(),
            state: "BUSY, RECORDING".to_string(),
        };
        assert_eq!(err.to_string(), "Sync not ready to start: BUSY, RECORDING");
    }

    #[test]
    fn test_wrong_format_display() {
        let err = ServiceError::WrongFormat {
            path: PathBuf::from("/data/rec.sync"),
            expected: "h5".to_string(),
        };
        assert_eq!(err.to_string(), "Expected a .h5 file: /data/rec.sync");
    }

    #[test]
    fn test_assertion_classification() {
        assert!(ServiceError::NoArtifact("Sync".into()).is_assertion());
        assert!(ServiceError::EmptyArtifact(PathBuf::from("a.h5")).is_assertion());
        assert!(!ServiceError::Test("disk".into()).is_assertion());
        assert!(!ServiceError::Connectivity("offline".into()).is_assertion());
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = ServiceError::ShutdownFailed(vec![
            ServiceError::Connectivity("camera host timeout".into()),
            ServiceError::Test("disk".into()),
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }
}

//! Timing/sync box integration.
//!
//! The sync box records digital line events into a raw `.sync` file and
//! converts it to `.h5` once stopped. It reports pair-shaped states, with
//! `("BUSY", "RECORDING")` while a recording is in progress.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::device::capabilities::{
    Device, Finalizable, Recorder, Startable, Stoppable, Testable, Validatable, Verifiable,
    DEFAULT_FINALIZE_TIMEOUT,
};
use crate::device::session::{Artifact, Session};
use crate::devices::{invoke, pair_ready, pair_started};
use crate::error::AppResult;

/// Detail word of the recording state.
pub const STARTED_DETAIL: &str = "RECORDING";
/// Suffix of the file written while recording.
pub const RAW_SUFFIX: &str = ".sync";
/// Extension of the converted output.
pub const OUTPUT_EXTENSION: &str = "h5";
/// Raw sync files are appended in large, infrequent bursts.
pub const GROWTH_SCALE: f64 = 2.0;

/// Sync box device. Collects the converted `.h5` once processing has finished.
pub struct SyncDevice {
    session: Session,
    finalize_timeout: Duration,
}

impl SyncDevice {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            finalize_timeout: DEFAULT_FINALIZE_TIMEOUT,
        }
    }

    pub fn with_finalize_timeout(mut self, timeout: Duration) -> Self {
        self.finalize_timeout = timeout;
        self
    }

    /// Device configuration reported by the sync service, including line
    /// labels and sample frequency.
    pub async fn config(&mut self) -> AppResult<Value> {
        invoke(&mut self.session, "get_config", Value::Null).await
    }
}

impl Device for SyncDevice {
    fn session(&self) -> &Session {
        &self.session
    }

    fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    fn as_testable(&mut self) -> Option<&mut dyn Testable> {
        Some(self)
    }

    fn as_startable(&mut self) -> Option<&mut dyn Startable> {
        Some(self)
    }

    fn as_stoppable(&mut self) -> Option<&mut dyn Stoppable> {
        Some(self)
    }

    fn as_verifiable(&mut self) -> Option<&mut dyn Verifiable> {
        Some(self)
    }

    fn as_finalizable(&mut self) -> Option<&mut dyn Finalizable> {
        Some(self)
    }

    fn as_validatable(&mut self) -> Option<&mut dyn Validatable> {
        Some(self)
    }

    fn as_recorder(&self) -> Option<&dyn Recorder> {
        Some(self)
    }
}

impl Testable for SyncDevice {}

impl Recorder for SyncDevice {}

#[async_trait]
impl Startable for SyncDevice {
    async fn is_started(&mut self) -> AppResult<bool> {
        pair_started(self, STARTED_DETAIL).await
    }

    async fn is_ready_to_start(&mut self) -> AppResult<bool> {
        pair_ready(self, STARTED_DETAIL).await
    }

    async fn start(&mut self) -> AppResult<()> {
        invoke(&mut self.session, "start", Value::Null).await?;
        Ok(())
    }
}

#[async_trait]
impl Stoppable for SyncDevice {
    async fn stop(&mut self) -> AppResult<()> {
        invoke(&mut self.session, "stop", Value::Null).await?;
        Ok(())
    }
}

impl Verifiable for SyncDevice {
    fn growth_scale(&self) -> f64 {
        GROWTH_SCALE
    }
}

impl Finalizable for SyncDevice {
    fn finalize_timeout(&self) -> Duration {
        self.finalize_timeout
    }

    fn artifact_patterns(&self) -> Vec<String> {
        vec![format!("*.{OUTPUT_EXTENSION}")]
    }
}

#[async_trait]
impl Validatable for SyncDevice {
    fn expected_extension(&self) -> &str {
        OUTPUT_EXTENSION
    }

    async fn full_validation(&mut self, artifact: &Artifact) -> Option<AppResult<()>> {
        hdf5_check::inspect(self.session.name(), artifact)
    }
}

#[cfg(feature = "storage_hdf5")]
mod hdf5_check {
    use crate::device::session::Artifact;
    use crate::error::{AppResult, ServiceError};

    /// Opens the converted file and requires at least one top-level member.
    pub(super) fn inspect(device: &str, artifact: &Artifact) -> Option<AppResult<()>> {
        let result = hdf5::File::open(&artifact.path)
            .and_then(|file| file.member_names())
            .map_err(|err| ServiceError::protocol(device, format!("unreadable HDF5 file: {err}")))
            .and_then(|members| {
                if members.is_empty() {
                    Err(ServiceError::protocol(device, "HDF5 file has no datasets"))
                } else {
                    Ok(())
                }
            });
        Some(result)
    }
}

#[cfg(not(feature = "storage_hdf5"))]
mod hdf5_check {
    use crate::device::session::Artifact;
    use crate::error::AppResult;

    pub(super) fn inspect(_device: &str, _artifact: &Artifact) -> Option<AppResult<()>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::connection::{ConnectionSlot, Endpoint};
    use crate::devices::simulated::{RecorderProfile, SimulatedRecorder, SimulatedRig};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn device(dir: &TempDir) -> (SyncDevice, SimulatedRecorder) {
        let recorder = SimulatedRecorder::new(RecorderProfile::sync().with_data_root(dir.path()));
        let rig = SimulatedRig::new().with_service("sync-host:5000", Arc::new(recorder.clone()));
        let session = Session::new("Sync")
            .with_connection(ConnectionSlot::new(
                Endpoint::new("sync-host", 5000),
                Arc::new(rig),
            ))
            .with_data_root(dir.path())
            .with_raw_suffix(RAW_SUFFIX);
        (SyncDevice::new(session), recorder)
    }

    #[tokio::test]
    async fn started_state_is_busy_recording() {
        let dir = TempDir::new().unwrap();
        let (mut sync, _recorder) = device(&dir);
        assert!(sync.is_ready_to_start().await.unwrap());
        assert!(!sync.is_started().await.unwrap());

        Startable::start(&mut sync).await.unwrap();
        assert!(sync.is_started().await.unwrap());
        assert!(!sync.is_ready_to_start().await.unwrap());
        Stoppable::stop(&mut sync).await.unwrap();
    }

    #[test]
    fn collects_converted_output() {
        let dir = TempDir::new().unwrap();
        let (sync, _recorder) = device(&dir);
        assert_eq!(sync.artifact_patterns(), vec!["*.h5".to_string()]);
        assert_eq!(sync.expected_extension(), "h5");
        assert_eq!(sync.growth_scale(), 2.0);
    }

    #[tokio::test]
    async fn config_is_forwarded() {
        let dir = TempDir::new().unwrap();
        let (mut sync, _recorder) = device(&dir);
        let config = sync.config().await.unwrap();
        assert!(config.get("frequency").is_some());
    }
}

//! Coordination of every device on the rig.
//!
//! `RunCoordinator` owns the devices of one run, in configuration order, and
//! drives each lifecycle step across all of them. Devices are driven strictly
//! one after another.
//!
//! Collected artifacts are handed to an [`ArtifactSink`] together with the
//! run's [`SessionMetadata`]. [`ManifestCollector`] keeps them in memory as a
//! serializable [`RunManifest`].

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::ServicesConfig;
use crate::device::connection::ConnectionFactory;
use crate::device::session::Artifact;
use crate::devices::build_device;
use crate::error::{AppResult, ServiceError};
use crate::lifecycle::{DiskSpace, Finalized, Lifecycle};
use crate::metadata::SessionMetadata;

/// Receives the artifacts each device produced in a run.
pub trait ArtifactSink: Send {
    fn record(
        &mut self,
        device: &str,
        artifacts: &[Artifact],
        metadata: &SessionMetadata,
    ) -> AppResult<()>;
}

/// Artifacts of one device in a manifest.
#[derive(Debug, Clone, Serialize)]
pub struct ManifestEntry {
    pub device: String,
    pub artifacts: Vec<Artifact>,
}

/// Everything a run produced, attributed to devices.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunManifest {
    pub metadata: Option<SessionMetadata>,
    pub entries: Vec<ManifestEntry>,
}

impl RunManifest {
    /// All artifacts, in recording order of the devices.
    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.entries.iter().flat_map(|e| e.artifacts.iter())
    }

    pub fn to_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// In-memory [`ArtifactSink`]. Refuses metadata without an experiment name.
#[derive(Debug, Default)]
pub struct ManifestCollector {
    manifest: RunManifest,
}

impl ManifestCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manifest(&self) -> &RunManifest {
        &self.manifest
    }

    pub fn into_manifest(self) -> RunManifest {
        self.manifest
    }
}

impl ArtifactSink for ManifestCollector {
    fn record(
        &mut self,
        device: &str,
        artifacts: &[Artifact],
        metadata: &SessionMetadata,
    ) -> AppResult<()> {
        metadata.validate().map_err(ServiceError::Configuration)?;
        if self.manifest.metadata.is_none() {
            self.manifest.metadata = Some(metadata.clone());
        }
        match self.manifest.entries.iter_mut().find(|e| e.device == device) {
            Some(entry) => entry.artifacts.extend_from_slice(artifacts),
            None => self.manifest.entries.push(ManifestEntry {
                device: device.to_string(),
                artifacts: artifacts.to_vec(),
            }),
        }
        Ok(())
    }
}

/// Outcome of one step for one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub device: String,
    pub error: Option<String>,
}

impl StepReport {
    fn from_result(device: &str, result: &AppResult<()>) -> Self {
        Self {
            device: device.to_string(),
            error: result.as_ref().err().map(ToString::to_string),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Owns and drives the devices of one run.
pub struct RunCoordinator {
    devices: Vec<Lifecycle>,
}

impl RunCoordinator {
    pub fn new(devices: Vec<Lifecycle>) -> Self {
        Self { devices }
    }

    /// Builds every enabled device in `config`, in order.
    pub fn from_config(
        config: &ServicesConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> AppResult<Self> {
        let timing = config.lifecycle.timing();
        let mut devices = Vec::new();
        for def in config.enabled_devices() {
            let device = build_device(def, factory.clone())?;
            devices.push(Lifecycle::new(device).with_timing(timing));
        }
        info!(count = devices.len(), "Devices built");
        Ok(Self::new(devices))
    }

    /// Replaces the disk space source of every device.
    pub fn with_disk_space(self, disks: Arc<dyn DiskSpace>) -> Self {
        let devices = self
            .devices
            .into_iter()
            .map(|device| device.with_disk_space(disks.clone()))
            .collect();
        Self { devices }
    }

    pub fn devices(&self) -> &[Lifecycle] {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut [Lifecycle] {
        &mut self.devices
    }

    pub fn device(&self, name: &str) -> Option<&Lifecycle> {
        self.devices.iter().find(|d| d.name() == name)
    }

    pub fn device_mut(&mut self, name: &str) -> Option<&mut Lifecycle> {
        self.devices.iter_mut().find(|d| d.name() == name)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Initializes every device, stopping at the first failure.
    pub async fn initialize_all(&mut self) -> AppResult<()> {
        for device in &mut self.devices {
            device.initialize().await?;
        }
        Ok(())
    }

    /// Tests every device; all failures are reported together.
    pub async fn test_all(&mut self) -> AppResult<()> {
        let mut failures = Vec::new();
        for device in &mut self.devices {
            if let Err(err) = device.test().await {
                failures.push(err.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::Test(failures.join("; ")))
        }
    }

    /// Starts every device in order.
    ///
    /// If one fails, the devices started before it are stopped again, in
    /// reverse order, and the failure is returned.
    pub async fn start_all(&mut self) -> AppResult<()> {
        for index in 0..self.devices.len() {
            if let Err(err) = self.devices[index].start().await {
                error!(device = %self.devices[index].name(), error = %err, "Start failed; stopping started devices");
                for device in self.devices[..index].iter_mut().rev() {
                    if let Err(stop_err) = device.stop().await {
                        warn!(device = %device.name(), error = %stop_err, "Stop failed during rollback");
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Stops every device; returns the first failure after trying all.
    pub async fn stop_all(&mut self) -> AppResult<()> {
        let mut first = None;
        for device in &mut self.devices {
            if let Err(err) = device.stop().await {
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Finalizes every device and hands the new artifacts to `sink`.
    ///
    /// A failing device does not keep the others from being stopped and
    /// collected. What the others produced still reaches `sink`, and the first
    /// failure is returned after all devices were tried.
    pub async fn finalize_all(
        &mut self,
        sink: &mut dyn ArtifactSink,
        metadata: &SessionMetadata,
    ) -> AppResult<Vec<(String, Finalized)>> {
        let mut results = Vec::with_capacity(self.devices.len());
        let mut first = None;
        for device in &mut self.devices {
            let finalized = match device.finalize().await {
                Ok(finalized) => finalized,
                Err(err) => {
                    error!(device = %device.name(), error = %err, "Finalize failed");
                    first.get_or_insert(err);
                    continue;
                }
            };
            if let Err(err) = sink.record(device.name(), &finalized.new_artifacts, metadata) {
                warn!(device = %device.name(), error = %err, "Artifact sink refused artifacts");
                first.get_or_insert(err);
            }
            results.push((device.name().to_string(), finalized));
        }
        first.map_or(Ok(results), Err)
    }

    /// Validates every device independently.
    pub async fn validate_all(&mut self) -> Vec<StepReport> {
        let mut reports = Vec::with_capacity(self.devices.len());
        for device in &mut self.devices {
            let result = device.validate().await;
            reports.push(StepReport::from_result(device.name(), &result));
        }
        reports
    }

    /// Runs each device's pretest independently.
    pub async fn pretest_all(&mut self) -> Vec<StepReport> {
        let mut reports = Vec::with_capacity(self.devices.len());
        for device in &mut self.devices {
            let result = device.pretest().await;
            if let Err(err) = &result {
                error!(device = %device.name(), error = %err, "Pretest failed");
            }
            reports.push(StepReport::from_result(device.name(), &result));
        }
        reports
    }

    /// Shuts every device down, collecting all failures.
    pub async fn shutdown_all(&mut self) -> AppResult<()> {
        info!("Shutting down devices");
        let mut errors = Vec::new();
        for device in &mut self.devices {
            if let Err(err) = device.shutdown().await {
                errors.push(err);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::ShutdownFailed(errors))
        }
    }
}

//! Per-device session state.
//!
//! Each device owns exactly one [`Session`]: its connection slot, recording
//! profile, data location, start/error history and the artifacts collected so
//! far. Nothing in here is shared between devices.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::device::connection::{Connection, ConnectionSlot};
use crate::error::{AppResult, ServiceError};
use crate::lifecycle::locator::{self, FileTime};

/// Recording-rate profile used by the disk preflight and pretest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecordingProfile {
    /// Data volume produced per hour of recording, in GB.
    pub gb_per_hr: f64,
    /// Minimum session length the data target must accommodate, in hours.
    pub min_rec_hr: f64,
    /// How long a pretest keeps the device recording.
    pub pretest_duration: Duration,
}

impl Default for RecordingProfile {
    fn default() -> Self {
        Self {
            gb_per_hr: 2.0,
            min_rec_hr: 3.0,
            pretest_duration: Duration::from_secs(5),
        }
    }
}

impl RecordingProfile {
    /// Capacity needed before a recording may start, to 0.1 GB.
    pub fn required_disk_gb(&self) -> f64 {
        round_tenth(self.min_rec_hr * self.gb_per_hr)
    }
}

pub(crate) fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// A data file attributed to a recording window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub size: u64,
}

impl Artifact {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// `[start, end]` span used to attribute files to one recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl RecordingWindow {
    /// Inclusive at both ends, with the start taken at whole seconds as in
    /// [`locator::find_files`].
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start.trunc_subsecs(0) <= t && t <= self.end
    }
}

/// Mutable state owned by one device integration.
pub struct Session {
    name: String,
    connection: Option<ConnectionSlot>,
    pub profile: RecordingProfile,
    data_root: Option<PathBuf>,
    raw_suffix: Option<String>,
    file_time: FileTime,
    last_start: Option<DateTime<Utc>>,
    last_error: Option<String>,
    initialized_at: Option<DateTime<Utc>>,
    artifacts: Vec<Artifact>,
}

impl Session {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection: None,
            profile: RecordingProfile::default(),
            data_root: None,
            raw_suffix: None,
            file_time: FileTime::Created,
            last_start: None,
            last_error: None,
            initialized_at: None,
            artifacts: Vec::new(),
        }
    }

    pub fn with_connection(mut self, slot: ConnectionSlot) -> Self {
        self.connection = Some(slot);
        self
    }

    pub fn with_profile(mut self, profile: RecordingProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.data_root = Some(root.into());
        self
    }

    pub fn with_raw_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.raw_suffix = Some(suffix.into());
        self
    }

    pub fn with_file_time(mut self, file_time: FileTime) -> Self {
        self.file_time = file_time;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_root(&self) -> Option<&Path> {
        self.data_root.as_deref()
    }

    pub fn raw_suffix(&self) -> Option<&str> {
        self.raw_suffix.as_deref()
    }

    pub fn file_time(&self) -> FileTime {
        self.file_time
    }

    pub fn slot(&self) -> Option<&ConnectionSlot> {
        self.connection.as_ref()
    }

    pub fn slot_mut(&mut self) -> Option<&mut ConnectionSlot> {
        self.connection.as_mut()
    }

    /// The memoized connection handle, created on first use.
    pub fn connection(&mut self) -> AppResult<Arc<dyn Connection>> {
        match self.connection.as_mut() {
            Some(slot) => slot.get(),
            None => Err(ServiceError::Configuration(format!(
                "{} has no connection configured",
                self.name
            ))),
        }
    }

    /// Human-readable address for messages.
    pub fn address(&self) -> String {
        self.connection
            .as_ref()
            .map(|slot| slot.endpoint().to_string())
            .unwrap_or_else(|| "localhost".to_string())
    }

    pub fn last_start(&self) -> Option<DateTime<Utc>> {
        self.last_start
    }

    pub fn mark_started(&mut self, at: DateTime<Utc>) {
        self.last_start = Some(at);
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn record_error(&mut self, err: &dyn fmt::Display) {
        self.last_error = Some(err.to_string());
    }

    pub fn initialized_at(&self) -> Option<DateTime<Utc>> {
        self.initialized_at
    }

    pub fn mark_initialized(&mut self, at: DateTime<Utc>) {
        self.initialized_at = Some(at);
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn clear_artifacts(&mut self) {
        self.artifacts.clear();
    }

    /// Appends artifacts not already present; returns the ones added.
    pub fn append_artifacts(&mut self, found: Vec<Artifact>) -> Vec<Artifact> {
        let mut added = Vec::new();
        for artifact in found {
            let known = self.artifacts.iter().any(|a| a.path == artifact.path)
                || added.iter().any(|a: &Artifact| a.path == artifact.path);
            if !known {
                added.push(artifact);
            }
        }
        self.artifacts.extend(added.iter().cloned());
        added
    }

    /// The current recording window, `None` before the first start.
    pub fn recording_window(&self) -> Option<RecordingWindow> {
        self.last_start.map(|start| RecordingWindow {
            start,
            end: Utc::now().max(start),
        })
    }

    /// Glob matching the device's raw output, or every file.
    pub fn default_pattern(&self) -> String {
        match &self.raw_suffix {
            Some(suffix) => format!("*{suffix}"),
            None => "*".to_string(),
        }
    }

    /// Files produced in the current recording window that match `pattern`.
    ///
    /// Before any start this degrades to the single most recently modified
    /// match. Devices without a data root have no data.
    pub fn latest_data(&self, pattern: Option<&str>) -> Vec<Artifact> {
        let Some(root) = self.data_root.as_deref() else {
            return Vec::new();
        };
        let pattern = pattern
            .map(str::to_string)
            .unwrap_or_else(|| self.default_pattern());
        match self.recording_window() {
            Some(window) => {
                locator::find_files(root, &pattern, window.start, window.end, self.file_time)
            }
            None => locator::latest_file(root, &pattern).into_iter().collect(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("connection", &self.connection)
            .field("data_root", &self.data_root)
            .field("last_start", &self.last_start)
            .field("artifacts", &self.artifacts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_disk_is_rounded_to_a_tenth() {
        let profile = RecordingProfile {
            gb_per_hr: 2.0,
            min_rec_hr: 3.0,
            ..Default::default()
        };
        assert_eq!(profile.required_disk_gb(), 6.0);

        let profile = RecordingProfile {
            gb_per_hr: 1.234,
            min_rec_hr: 1.0,
            ..Default::default()
        };
        assert_eq!(profile.required_disk_gb(), 1.2);
    }

    #[test]
    fn required_disk_is_monotonic() {
        let mut previous = 0.0;
        for hours in 0..20 {
            let profile = RecordingProfile {
                gb_per_hr: 1.7,
                min_rec_hr: hours as f64 * 0.5,
                ..Default::default()
            };
            assert!(profile.required_disk_gb() >= previous);
            previous = profile.required_disk_gb();
        }
        let mut previous = 0.0;
        for rate in 0..20 {
            let profile = RecordingProfile {
                gb_per_hr: rate as f64 * 0.3,
                min_rec_hr: 2.5,
                ..Default::default()
            };
            assert!(profile.required_disk_gb() >= previous);
            previous = profile.required_disk_gb();
        }
    }

    #[test]
    fn append_skips_duplicates() {
        let mut session = Session::new("Sync");
        let artifact = Artifact {
            path: PathBuf::from("/data/a.h5"),
            timestamp: Utc::now(),
            size: 10,
        };
        let added = session.append_artifacts(vec![artifact.clone(), artifact.clone()]);
        assert_eq!(added.len(), 1);
        let added = session.append_artifacts(vec![artifact]);
        assert!(added.is_empty());
        assert_eq!(session.artifacts().len(), 1);
    }

    #[test]
    fn no_window_before_start() {
        let mut session = Session::new("Sync");
        assert!(session.recording_window().is_none());
        let start = Utc::now();
        session.mark_started(start);
        let window = session.recording_window().unwrap();
        assert_eq!(window.start, start);
        assert!(window.contains(start));
        assert!(window.contains(start.trunc_subsecs(0)));
    }

    #[test]
    fn session_without_data_root_has_no_data() {
        let session = Session::new("Camstim");
        assert!(session.latest_data(None).is_empty());
    }
}

//! Multi-camera capture service integrations.
//!
//! One capture service drives every camera on the rig. [`VideoMvr`] records
//! video from the behaviour cameras; [`ImageMvr`] takes still snapshots from
//! the auxiliary camera. Cameras are told apart by a case-insensitive regex
//! over their labels.
//!
//! The service state is a per-camera status list, filtered to the cameras the
//! integration selected. An empty list means the service could not report on
//! any of them and is treated as a connectivity failure.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::device::capabilities::{
    Device, Finalizable, Recorder, Startable, Stoppable, Testable, Verifiable,
};
use crate::device::session::{Artifact, Session};
use crate::device::state::{CameraStatus, DeviceState};
use crate::devices::invoke;
use crate::error::{AppResult, ServiceError};

/// Default pattern for auxiliary camera labels.
pub const DEFAULT_AUX_PATTERN: &str = "aux|USB!";
/// Suffix of the video files written while recording.
pub const VIDEO_SUFFIX: &str = ".mp4";
/// Requested recording length; the service stops on its own after this.
pub const RECORD_TIME: Duration = Duration::from_secs(365 * 60);
pub const VIDEO_FINALIZE_TIMEOUT: Duration = Duration::from_secs(30);
pub const IMAGE_FINALIZE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
struct CameraId {
    id: String,
    #[serde(default)]
    label: String,
}

/// Which side of the auxiliary pattern an integration uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selection {
    Behavior,
    Aux,
}

/// Connection to the capture service and the camera subset one integration
/// drives.
struct MvrLink {
    session: Session,
    aux: Regex,
    selection: Selection,
    cameras: Option<Vec<CameraId>>,
}

impl MvrLink {
    fn new(session: Session, pattern: Option<&str>, selection: Selection) -> AppResult<Self> {
        let pattern = pattern.unwrap_or(DEFAULT_AUX_PATTERN);
        let aux = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|err| {
                ServiceError::Configuration(format!(
                    "{}: invalid camera pattern '{pattern}': {err}",
                    session.name()
                ))
            })?;
        Ok(Self {
            session,
            aux,
            selection,
            cameras: None,
        })
    }

    fn selects(&self, label: &str) -> bool {
        let is_aux = self.aux.is_match(label);
        match self.selection {
            Selection::Aux => is_aux,
            Selection::Behavior => !is_aux,
        }
    }

    /// The selected cameras, fetched once per connection.
    async fn cameras(&mut self) -> AppResult<Vec<CameraId>> {
        if let Some(cameras) = &self.cameras {
            return Ok(cameras.clone());
        }
        let reply = invoke(&mut self.session, "camera_ids", Value::Null).await?;
        let all: Vec<CameraId> = serde_json::from_value(reply).map_err(|err| {
            ServiceError::protocol(self.session.name(), format!("invalid camera list: {err}"))
        })?;
        let selected: Vec<CameraId> = all.into_iter().filter(|c| self.selects(&c.label)).collect();
        debug!(
            device = %self.session.name(),
            cameras = ?selected.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            "Selected cameras"
        );
        self.cameras = Some(selected.clone());
        Ok(selected)
    }

    /// Status of the selected cameras.
    async fn status(&mut self) -> AppResult<Vec<CameraStatus>> {
        let selected = self.cameras().await?;
        let reply = invoke(&mut self.session, "get_camera_status", Value::Null).await?;
        let all: Vec<CameraStatus> = serde_json::from_value(reply).map_err(|err| {
            ServiceError::protocol(self.session.name(), format!("invalid camera status: {err}"))
        })?;
        let status: Vec<CameraStatus> = all
            .into_iter()
            .filter(|s| selected.iter().any(|c| c.id == s.id))
            .collect();
        if status.is_empty() {
            return Err(ServiceError::Connectivity(format!(
                "Could not get camera status from {}",
                self.session.address()
            )));
        }
        Ok(status)
    }

    /// Restricts capture to the selected cameras and starts their display.
    async fn configure(&mut self) -> AppResult<()> {
        let ids: Vec<String> = self.cameras().await?.into_iter().map(|c| c.id).collect();
        invoke(&mut self.session, "define_hosts", json!(ids)).await?;
        invoke(&mut self.session, "start_display", Value::Null).await?;
        Ok(())
    }

    fn reconnect(&mut self) -> AppResult<()> {
        self.cameras = None;
        if let Some(slot) = self.session.slot_mut() {
            slot.reconnect()?;
        }
        Ok(())
    }

    fn teardown(&mut self) {
        self.cameras = None;
        if let Some(slot) = self.session.slot_mut() {
            slot.reset();
        }
    }
}

fn cameras_of(state: DeviceState) -> Vec<CameraStatus> {
    match state {
        DeviceState::Cameras(cameras) => cameras,
        DeviceState::Status { .. } => Vec::new(),
    }
}

fn all_streaming(cameras: &[CameraStatus]) -> bool {
    cameras.iter().all(|c| c.is_open && c.is_streaming)
}

// ============================================================================
// Video
// ============================================================================

/// Video recording from every non-auxiliary camera.
pub struct VideoMvr {
    link: MvrLink,
    finalize_timeout: Duration,
}

impl VideoMvr {
    pub fn new(session: Session, aux_pattern: Option<&str>) -> AppResult<Self> {
        Ok(Self {
            link: MvrLink::new(session, aux_pattern, Selection::Behavior)?,
            finalize_timeout: VIDEO_FINALIZE_TIMEOUT,
        })
    }

    pub fn with_finalize_timeout(mut self, timeout: Duration) -> Self {
        self.finalize_timeout = timeout;
        self
    }

    /// Selected cameras currently recording.
    pub async fn cameras_recording(&mut self) -> AppResult<Vec<CameraStatus>> {
        let status = self.link.status().await?;
        Ok(status.into_iter().filter(|c| c.is_recording).collect())
    }
}

#[async_trait]
impl Device for VideoMvr {
    fn session(&self) -> &Session {
        &self.link.session
    }

    fn session_mut(&mut self) -> &mut Session {
        &mut self.link.session
    }

    async fn connect(&mut self) -> AppResult<()> {
        self.link.reconnect()
    }

    fn teardown(&mut self) {
        self.link.teardown();
    }

    async fn state(&mut self) -> AppResult<DeviceState> {
        Ok(DeviceState::Cameras(self.link.status().await?))
    }

    async fn prepare(&mut self) -> AppResult<()> {
        self.link.configure().await
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

    fn as_recorder(&self) -> Option<&dyn Recorder> {
        Some(self)
    }
}

impl Testable for VideoMvr {}

impl Recorder for VideoMvr {}

#[async_trait]
impl Startable for VideoMvr {
    async fn is_started(&mut self) -> AppResult<bool> {
        Ok(cameras_of(self.state().await?).iter().any(|c| c.is_recording))
    }

    async fn is_ready_to_start(&mut self) -> AppResult<bool> {
        let cameras = cameras_of(self.state().await?);
        Ok(!cameras.iter().any(|c| c.is_recording) && all_streaming(&cameras))
    }

    async fn start(&mut self) -> AppResult<()> {
        let params = json!({ "record_time": RECORD_TIME.as_secs() });
        invoke(&mut self.link.session, "start_record", params).await?;
        Ok(())
    }
}

#[async_trait]
impl Stoppable for VideoMvr {
    async fn stop(&mut self) -> AppResult<()> {
        invoke(&mut self.link.session, "stop_record", Value::Null).await?;
        Ok(())
    }
}

/// Video files grow in large, irregular steps, so evidence of recording is
/// one file per recording camera once the pretest duration has elapsed.
#[async_trait]
impl Verifiable for VideoMvr {
    async fn verify(&mut self) -> AppResult<()> {
        let pretest = self.link.session.profile.pretest_duration;
        if let Some(start) = self.link.session.last_start() {
            let elapsed = (Utc::now() - start).to_std().unwrap_or_default();
            if let Some(remaining) = pretest.checked_sub(elapsed) {
                tokio::time::sleep(remaining).await;
            }
        }
        let files = self.link.session.latest_data(None);
        let recording = self.cameras_recording().await?.len();
        if files.is_empty() || files.len() < recording {
            return Err(ServiceError::NoEvidence {
                device: self.name().to_string(),
                reason: format!(
                    "{} video files do not match the {recording} cameras recording",
                    files.len()
                ),
            });
        }
        debug!(device = %self.name(), files = files.len(), "Cameras recording to disk");
        Ok(())
    }
}

impl Finalizable for VideoMvr {
    fn finalize_timeout(&self) -> Duration {
        self.finalize_timeout
    }

    fn artifact_patterns(&self) -> Vec<String> {
        vec![format!("*{VIDEO_SUFFIX}"), "*.json".to_string()]
    }
}

// ============================================================================
// Image
// ============================================================================

/// Still snapshots from the auxiliary camera.
///
/// The service converts each snapshot from `.bmp` and announces the outcome
/// with a broadcast. Collected files are renamed to carry the label.
pub struct ImageMvr {
    link: MvrLink,
    label: Option<String>,
    finalize_timeout: Duration,
}

impl ImageMvr {
    pub fn new(session: Session, aux_pattern: Option<&str>) -> AppResult<Self> {
        Ok(Self {
            link: MvrLink::new(session, aux_pattern, Selection::Aux)?,
            label: None,
            finalize_timeout: IMAGE_FINALIZE_TIMEOUT,
        })
    }

    pub fn with_label(mut self, label: String) -> Self {
        self.label = Some(label);
        self
    }

    pub fn with_finalize_timeout(mut self, timeout: Duration) -> Self {
        self.finalize_timeout = timeout;
        self
    }

    /// Drains pending broadcasts; `Some(converted)` for the first snapshot
    /// outcome among them.
    async fn snapshot_outcome(&mut self) -> AppResult<Option<bool>> {
        let reply = invoke(&mut self.link.session, "read", Value::Null).await?;
        let messages = reply.as_array().cloned().unwrap_or_default();
        for message in messages {
            match message.get("mvr_broadcast").and_then(Value::as_str) {
                Some("snapshot_converted") => return Ok(Some(true)),
                Some("snapshot_failed") => return Ok(Some(false)),
                _ => {}
            }
        }
        Ok(None)
    }
}

/// `{stem}_{label}{ext}` next to `path`, or `None` if already labelled.
fn labelled_path(path: &std::path::Path, label: &str) -> Option<PathBuf> {
    let stem = path.file_stem()?.to_string_lossy();
    let suffix = format!("_{label}");
    if stem.ends_with(&suffix) {
        return None;
    }
    let name = match path.extension() {
        Some(ext) => format!("{stem}{suffix}.{}", ext.to_string_lossy()),
        None => format!("{stem}{suffix}"),
    };
    Some(path.with_file_name(name))
}

#[async_trait]
impl Device for ImageMvr {
    fn session(&self) -> &Session {
        &self.link.session
    }

    fn session_mut(&mut self) -> &mut Session {
        &mut self.link.session
    }

    async fn connect(&mut self) -> AppResult<()> {
        self.link.reconnect()
    }

    fn teardown(&mut self) {
        self.link.teardown();
    }

    async fn state(&mut self) -> AppResult<DeviceState> {
        Ok(DeviceState::Cameras(self.link.status().await?))
    }

    async fn prepare(&mut self) -> AppResult<()> {
        self.link.configure().await?;
        // Discard broadcasts left over from earlier snapshots.
        self.snapshot_outcome().await?;
        Ok(())
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

    fn as_finalizable(&mut self) -> Option<&mut dyn Finalizable> {
        Some(self)
    }

    fn as_recorder(&self) -> Option<&dyn Recorder> {
        Some(self)
    }
}

impl Testable for ImageMvr {}

impl Recorder for ImageMvr {}

#[async_trait]
impl Startable for ImageMvr {
    async fn is_started(&mut self) -> AppResult<bool> {
        Ok(self.snapshot_outcome().await? == Some(true))
    }

    async fn is_ready_to_start(&mut self) -> AppResult<bool> {
        if self.is_started().await? {
            return Ok(false);
        }
        let cameras = cameras_of(self.state().await?);
        Ok(all_streaming(&cameras) && !cameras.iter().any(|c| c.is_recording))
    }

    async fn start(&mut self) -> AppResult<()> {
        invoke(&mut self.link.session, "take_snapshot", Value::Null).await?;
        Ok(())
    }
}

/// A snapshot has nothing to stop.
#[async_trait]
impl Stoppable for ImageMvr {
    async fn stop(&mut self) -> AppResult<()> {
        Ok(())
    }
}

#[async_trait]
impl Finalizable for ImageMvr {
    fn finalize_timeout(&self) -> Duration {
        self.finalize_timeout
    }

    fn artifact_patterns(&self) -> Vec<String> {
        vec!["*".to_string()]
    }

    async fn processing_done(&mut self) -> AppResult<bool> {
        if !self.is_ready_to_start().await? {
            return Ok(false);
        }
        let session = &self.link.session;
        Ok(!session.latest_data(Some("*")).is_empty() && session.latest_data(Some("*.bmp")).is_empty())
    }

    async fn collect(&mut self, found: Vec<Artifact>) -> AppResult<Vec<Artifact>> {
        let Some(label) = self.label.as_deref() else {
            return Ok(found);
        };
        let mut collected = Vec::with_capacity(found.len());
        for mut artifact in found {
            if let Some(renamed) = labelled_path(&artifact.path, label) {
                std::fs::rename(&artifact.path, &renamed)?;
                info!(
                    device = %self.link.session.name(),
                    from = %artifact.path.display(),
                    to = %renamed.display(),
                    "Renamed snapshot"
                );
                artifact.path = renamed;
            }
            collected.push(artifact);
        }
        Ok(collected)
    }
}

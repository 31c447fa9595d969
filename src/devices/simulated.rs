//! In-process stand-ins for the rig's remote services.
//!
//! [`SimulatedRecorder`] behaves like the sync box and stimulus agent: a
//! pair-shaped state, a raw file that grows while recording, and a converted
//! output that appears after a few status polls once stopped.
//! [`SimulatedCameras`] behaves like the camera capture service.
//! [`SimulatedRig`] is a [`ConnectionFactory`] routing endpoints to them.
//!
//! Every file written here is stamped with the exact wall-clock time, so a
//! session using [`crate::lifecycle::FileTime::Modified`] sees it inside the
//! recording window even when tokio time is paused.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::{DeviceDefinition, DeviceKind};
use crate::device::connection::{Connection, ConnectionFactory, Endpoint};
use crate::device::state::CameraStatus;
use crate::error::{AppResult, ServiceError};

/// Interval between appends to a raw file while recording.
pub const RAW_WRITE_INTERVAL: Duration = Duration::from_millis(200);

const RAW_CHUNK: &[u8] = &[0x5a; 256];

fn stamp_now(path: &Path) -> std::io::Result<()> {
    File::options()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::now())
}

fn write_stamped(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)?;
    stamp_now(path)
}

fn append_stamped(path: &Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(RAW_CHUNK)?;
    file.set_modified(SystemTime::now())
}

async fn grow_raw_file(path: PathBuf) {
    loop {
        tokio::time::sleep(RAW_WRITE_INTERVAL).await;
        if let Err(err) = append_stamped(&path) {
            debug!(path = %path.display(), error = %err, "Simulated writer stopped");
            break;
        }
    }
}

fn take_stem(take: u32) -> String {
    format!("{}_{take:03}", Utc::now().format("%Y%m%d_%H%M%S"))
}

fn offline_error(service: &str) -> ServiceError {
    ServiceError::Connectivity(format!("{service} service is not running"))
}

fn unknown_method(service: &str, method: &str) -> ServiceError {
    ServiceError::protocol(service, format!("unknown method '{method}'"))
}

// ============================================================================
// Recorder (sync box, stimulus agent)
// ============================================================================

/// Behaviour of a [`SimulatedRecorder`].
#[derive(Debug, Clone)]
pub struct RecorderProfile {
    /// Service name used in errors.
    pub service: String,
    /// Detail word reported with `BUSY` while recording.
    pub started_detail: String,
    /// Where output is written. Nothing is written without one.
    pub data_root: Option<PathBuf>,
    /// Suffix of the raw file grown while recording.
    pub raw_suffix: Option<String>,
    /// Extension of the output written once processing completes.
    pub output_extension: String,
    /// Status polls answered with `BUSY` after stop before the output appears.
    pub processing_polls: u32,
    /// Reply to `get_config`.
    pub config: Value,
}

impl RecorderProfile {
    pub fn new(service: &str, started_detail: &str, output_extension: &str) -> Self {
        Self {
            service: service.to_string(),
            started_detail: started_detail.to_string(),
            data_root: None,
            raw_suffix: None,
            output_extension: output_extension.to_string(),
            processing_polls: 1,
            config: json!({}),
        }
    }

    /// Timing box: raw `.sync` while recording, `.h5` afterwards.
    pub fn sync() -> Self {
        let mut profile = Self::new("sync", "RECORDING", "h5").with_raw_suffix(".sync");
        profile.config = json!({
            "frequency": 100_000,
            "line_labels": ["barcode", "vsync_stim", "photodiode", "lick_sensor"],
        });
        profile
    }

    /// Stimulus agent: no raw file, a `.pkl` once the script finishes.
    pub fn camstim() -> Self {
        Self::new("camstim", "Script in progress.", "pkl")
    }

    pub fn with_data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.data_root = Some(root.into());
        self
    }

    pub fn with_raw_suffix(mut self, suffix: &str) -> Self {
        self.raw_suffix = Some(suffix.to_string());
        self
    }

    pub fn with_processing_polls(mut self, polls: u32) -> Self {
        self.processing_polls = polls;
        self
    }
}

#[derive(Default)]
struct RecorderState {
    recording: bool,
    pending_polls: Option<u32>,
    hold_busy: bool,
    offline: bool,
    take: u32,
    stem: String,
    writer: Option<JoinHandle<()>>,
    calls: Vec<String>,
    last_params: Value,
}

/// Simulated pair-state recorder service. Clones share state.
#[derive(Clone)]
pub struct SimulatedRecorder {
    profile: Arc<RecorderProfile>,
    state: Arc<Mutex<RecorderState>>,
}

impl SimulatedRecorder {
    pub fn new(profile: RecorderProfile) -> Self {
        Self {
            profile: Arc::new(profile),
            state: Arc::new(Mutex::new(RecorderState::default())),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().recording
    }

    /// Makes the service refuse every request while `offline`.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Keeps the service `BUSY` after stop until released.
    pub fn hold_busy(&self, hold: bool) {
        self.state.lock().hold_busy = hold;
    }

    /// Methods invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// How many times `method` was invoked.
    pub fn call_count(&self, method: &str) -> usize {
        self.state.lock().calls.iter().filter(|m| *m == method).count()
    }

    /// Parameters of the last start request.
    pub fn last_params(&self) -> Value {
        self.state.lock().last_params.clone()
    }

    /// Puts the service in the recording state without a start request, as
    /// if a previous run had been left running.
    pub fn force_recording(&self) {
        let mut state = self.state.lock();
        state.recording = true;
    }

    fn start(&self, state: &mut RecorderState, params: Value) -> AppResult<()> {
        state.take += 1;
        state.stem = take_stem(state.take);
        state.recording = true;
        state.pending_polls = None;
        state.last_params = params;
        if let (Some(root), Some(suffix)) = (&self.profile.data_root, &self.profile.raw_suffix) {
            let raw = root.join(format!("{}{suffix}", state.stem));
            write_stamped(&raw, RAW_CHUNK)?;
            state.writer = Some(tokio::spawn(grow_raw_file(raw)));
        }
        Ok(())
    }

    fn stop(&self, state: &mut RecorderState) -> AppResult<()> {
        if let Some(writer) = state.writer.take() {
            writer.abort();
        }
        if !state.recording {
            return Ok(());
        }
        state.recording = false;
        if self.profile.processing_polls == 0 {
            self.write_output(state)?;
        } else {
            state.pending_polls = Some(self.profile.processing_polls);
        }
        Ok(())
    }

    fn write_output(&self, state: &RecorderState) -> AppResult<()> {
        if let Some(root) = &self.profile.data_root {
            let output = root.join(format!("{}.{}", state.stem, self.profile.output_extension));
            write_stamped(&output, b"simulated output")?;
        }
        Ok(())
    }

    fn pair_state(&self, state: &mut RecorderState) -> AppResult<Value> {
        if state.recording {
            return Ok(json!(["BUSY", self.profile.started_detail]));
        }
        if state.hold_busy {
            return Ok(json!(["BUSY", "PROCESSING"]));
        }
        match state.pending_polls {
            Some(0) => {
                state.pending_polls = None;
                self.write_output(state)?;
            }
            Some(remaining) => {
                state.pending_polls = Some(remaining - 1);
                return Ok(json!(["BUSY", "PROCESSING"]));
            }
            None => {}
        }
        Ok(json!(["READY", ""]))
    }
}

#[async_trait]
impl Connection for SimulatedRecorder {
    async fn uptime(&self) -> AppResult<f64> {
        if self.state.lock().offline {
            return Err(offline_error(&self.profile.service));
        }
        Ok(3600.0)
    }

    async fn call(&self, method: &str, params: Value) -> AppResult<Value> {
        let mut state = self.state.lock();
        if state.offline {
            return Err(offline_error(&self.profile.service));
        }
        state.calls.push(method.to_string());
        match method {
            "get_state" => self.pair_state(&mut state),
            "get_config" => Ok(self.profile.config.clone()),
            "start" | "start_script" | "start_session" => {
                self.start(&mut state, params)?;
                Ok(Value::Null)
            }
            "stop" => {
                self.stop(&mut state)?;
                Ok(Value::Null)
            }
            other => Err(unknown_method(&self.profile.service, other)),
        }
    }
}

// ============================================================================
// Camera capture service
// ============================================================================

#[derive(Default)]
struct CameraState {
    cameras: Vec<CameraStatus>,
    defined: Vec<String>,
    display: bool,
    recording: bool,
    offline: bool,
    take: u32,
    writers: Vec<JoinHandle<()>>,
    snapshot: Option<(PathBuf, u32)>,
    fail_snapshots: bool,
    broadcasts: Vec<Value>,
    calls: Vec<String>,
}

/// Simulated multi-camera capture service. Clones share state.
#[derive(Clone)]
pub struct SimulatedCameras {
    video_root: Option<PathBuf>,
    image_root: Option<PathBuf>,
    conversion_polls: u32,
    state: Arc<Mutex<CameraState>>,
}

impl SimulatedCameras {
    /// Service with cameras given as `(id, label)` pairs.
    pub fn new(cameras: &[(&str, &str)]) -> Self {
        let cameras = cameras
            .iter()
            .map(|(id, label)| CameraStatus {
                id: id.to_string(),
                label: label.to_string(),
                is_open: true,
                is_streaming: false,
                is_recording: false,
            })
            .collect();
        Self {
            video_root: None,
            image_root: None,
            conversion_polls: 1,
            state: Arc::new(Mutex::new(CameraState {
                cameras,
                ..Default::default()
            })),
        }
    }

    /// Three behaviour cameras and one auxiliary camera.
    pub fn standard() -> Self {
        Self::new(&[
            ("cam1", "Behavior"),
            ("cam2", "Eye"),
            ("cam3", "Face"),
            ("cam4", "Aux"),
        ])
    }

    pub fn with_video_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.video_root = Some(root.into());
        self
    }

    pub fn with_image_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.image_root = Some(root.into());
        self
    }

    pub fn with_conversion_polls(mut self, polls: u32) -> Self {
        self.conversion_polls = polls;
        self
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Makes later snapshots fail conversion.
    pub fn fail_snapshots(&self, fail: bool) {
        self.state.lock().fail_snapshots = fail;
    }

    /// Marks camera `id` closed or open.
    pub fn set_open(&self, id: &str, open: bool) {
        let mut state = self.state.lock();
        for camera in state.cameras.iter_mut().filter(|c| c.id == id) {
            camera.is_open = open;
        }
    }

    /// Camera ids recording will capture.
    pub fn defined_hosts(&self) -> Vec<String> {
        self.state.lock().defined.clone()
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().recording
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.state.lock().calls.iter().filter(|m| *m == method).count()
    }

    fn status(state: &CameraState) -> Value {
        let cameras: Vec<Value> = state
            .cameras
            .iter()
            .map(|camera| {
                let defined = state.defined.contains(&camera.id);
                json!({
                    "camera_id": camera.id,
                    "label": camera.label,
                    "is_open": camera.is_open,
                    "is_streaming": camera.is_open && state.display,
                    "is_recording": camera.is_open && state.recording && defined,
                })
            })
            .collect();
        Value::Array(cameras)
    }

    fn start_record(&self, state: &mut CameraState) -> AppResult<()> {
        state.take += 1;
        state.recording = true;
        let Some(root) = &self.video_root else {
            return Ok(());
        };
        let stem = take_stem(state.take);
        let ids: Vec<String> = state
            .cameras
            .iter()
            .filter(|c| c.is_open && state.defined.contains(&c.id))
            .map(|c| c.id.clone())
            .collect();
        for id in ids {
            let video = root.join(format!("{stem}_{id}.mp4"));
            write_stamped(&video, RAW_CHUNK)?;
            state.writers.push(tokio::spawn(grow_raw_file(video)));
        }
        Ok(())
    }

    fn stop_record(&self, state: &mut CameraState) -> AppResult<()> {
        for writer in state.writers.drain(..) {
            writer.abort();
        }
        if !state.recording {
            return Ok(());
        }
        state.recording = false;
        if let Some(root) = &self.video_root {
            let sidecar = root.join(format!("{}_timestamps.json", take_stem(state.take)));
            write_stamped(&sidecar, br#"{"frames": []}"#)?;
        }
        Ok(())
    }

    fn take_snapshot(&self, state: &mut CameraState) -> AppResult<()> {
        state.take += 1;
        let Some(root) = &self.image_root else {
            state.broadcasts.push(json!({"mvr_broadcast": "snapshot_failed"}));
            return Ok(());
        };
        let bmp = root.join(format!("{}.bmp", take_stem(state.take)));
        write_stamped(&bmp, b"BM simulated")?;
        state.snapshot = Some((bmp, self.conversion_polls));
        Ok(())
    }

    fn advance_snapshot(state: &mut CameraState) -> AppResult<()> {
        match state.snapshot.take() {
            Some((bmp, 0)) => {
                if state.fail_snapshots {
                    std::fs::remove_file(&bmp)?;
                    state.broadcasts.push(json!({"mvr_broadcast": "snapshot_failed"}));
                } else {
                    let png = bmp.with_extension("png");
                    std::fs::rename(&bmp, &png)?;
                    stamp_now(&png)?;
                    state.broadcasts.push(json!({"mvr_broadcast": "snapshot_converted"}));
                }
            }
            Some((bmp, remaining)) => state.snapshot = Some((bmp, remaining - 1)),
            None => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for SimulatedCameras {
    async fn uptime(&self) -> AppResult<f64> {
        if self.state.lock().offline {
            return Err(offline_error("mvr"));
        }
        Ok(3600.0)
    }

    async fn call(&self, method: &str, params: Value) -> AppResult<Value> {
        let mut state = self.state.lock();
        if state.offline {
            return Err(offline_error("mvr"));
        }
        state.calls.push(method.to_string());
        Self::advance_snapshot(&mut state)?;
        match method {
            "camera_ids" => Ok(Value::Array(
                state
                    .cameras
                    .iter()
                    .map(|c| json!({"id": c.id, "label": c.label}))
                    .collect(),
            )),
            "get_camera_status" => Ok(Self::status(&state)),
            "define_hosts" => {
                let ids: Vec<String> = serde_json::from_value(params)?;
                for id in ids {
                    if !state.defined.contains(&id) {
                        state.defined.push(id);
                    }
                }
                Ok(Value::Null)
            }
            "start_display" => {
                state.display = true;
                Ok(Value::Null)
            }
            "start_record" => {
                self.start_record(&mut state)?;
                Ok(Value::Null)
            }
            "stop_record" => {
                self.stop_record(&mut state)?;
                Ok(Value::Null)
            }
            "take_snapshot" => {
                self.take_snapshot(&mut state)?;
                Ok(Value::Null)
            }
            "read" => Ok(Value::Array(std::mem::take(&mut state.broadcasts))),
            other => Err(unknown_method("mvr", other)),
        }
    }
}

// ============================================================================
// Connection factory
// ============================================================================

/// Routes endpoints (`host:port`) to simulated services.
#[derive(Default)]
pub struct SimulatedRig {
    services: Mutex<HashMap<String, Arc<dyn Connection>>>,
    unreachable: Mutex<HashSet<String>>,
    connects: AtomicUsize,
}

impl SimulatedRig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(self, address: impl Into<String>, service: Arc<dyn Connection>) -> Self {
        self.add_service(address, service);
        self
    }

    pub fn add_service(&self, address: impl Into<String>, service: Arc<dyn Connection>) {
        self.services.lock().insert(address.into(), service);
    }

    /// Makes `address` fail (or pass again) the reachability check.
    pub fn set_reachable(&self, address: &str, reachable: bool) {
        let mut unreachable = self.unreachable.lock();
        if reachable {
            unreachable.remove(address);
        } else {
            unreachable.insert(address.to_string());
        }
    }

    /// Connection handles created so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// A rig serving every remote device in `defs`.
    ///
    /// Camera devices sharing an endpoint share one [`SimulatedCameras`].
    pub fn for_devices(defs: &[DeviceDefinition]) -> Self {
        let rig = Self::new();
        let mut cameras: HashMap<String, SimulatedCameras> = HashMap::new();
        for def in defs.iter().filter(|d| d.kind.is_remote()) {
            let address = def.endpoint().to_string();
            match def.kind {
                DeviceKind::Sync | DeviceKind::Camstim => {
                    let mut profile = if def.kind == DeviceKind::Sync {
                        RecorderProfile::sync()
                    } else {
                        RecorderProfile::camstim()
                    };
                    if let Some(root) = &def.data_root {
                        profile = profile.with_data_root(root);
                    }
                    rig.add_service(address, Arc::new(SimulatedRecorder::new(profile)));
                }
                DeviceKind::VideoMvr | DeviceKind::ImageMvr => {
                    let mut service = cameras
                        .remove(&address)
                        .unwrap_or_else(SimulatedCameras::standard);
                    if let Some(root) = &def.data_root {
                        service = if def.kind == DeviceKind::VideoMvr {
                            service.with_video_root(root)
                        } else {
                            service.with_image_root(root)
                        };
                    }
                    cameras.insert(address, service);
                }
                DeviceKind::JsonLog => {}
            }
        }
        for (address, service) in cameras {
            rig.add_service(address, Arc::new(service));
        }
        rig
    }
}

#[async_trait]
impl ConnectionFactory for SimulatedRig {
    fn connect(&self, endpoint: &Endpoint) -> AppResult<Arc<dyn Connection>> {
        let address = endpoint.to_string();
        let service = self.services.lock().get(&address).cloned();
        match service {
            Some(service) => {
                self.connects.fetch_add(1, Ordering::SeqCst);
                Ok(service)
            }
            None => Err(ServiceError::Connectivity(format!(
                "no service listening on {address}"
            ))),
        }
    }

    async fn is_reachable(&self, endpoint: &Endpoint) -> bool {
        let address = endpoint.to_string();
        self.services.lock().contains_key(&address) && !self.unreachable.lock().contains(&address)
    }
}

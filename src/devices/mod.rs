//! Concrete device integrations and the factory that builds them from
//! configuration.
//!
//! - [`sync::SyncDevice`]: timing/sync box
//! - [`camstim::CamstimDevice`]: stimulus-presentation agent
//! - [`mvr::VideoMvr`], [`mvr::ImageMvr`]: multi-camera capture service
//! - [`json_log::JsonLogDevice`]: local auxiliary JSON logger
//! - [`simulated`]: in-process services standing in for the remote ones

pub mod camstim;
pub mod json_log;
pub mod mvr;
pub mod simulated;
pub mod sync;

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::config::{DeviceDefinition, DeviceKind};
use crate::device::capabilities::Device;
use crate::device::connection::{ConnectionFactory, ConnectionSlot};
use crate::device::session::Session;
use crate::device::state::Coarse;
use crate::error::{AppResult, ServiceError};

pub use camstim::CamstimDevice;
pub use json_log::JsonLogDevice;
pub use mvr::{ImageMvr, VideoMvr};
pub use sync::SyncDevice;

/// Raw output suffix a kind writes while recording, if any.
pub fn default_raw_suffix(kind: DeviceKind) -> Option<&'static str> {
    match kind {
        DeviceKind::Sync => Some(sync::RAW_SUFFIX),
        DeviceKind::VideoMvr => Some(mvr::VIDEO_SUFFIX),
        DeviceKind::Camstim | DeviceKind::ImageMvr | DeviceKind::JsonLog => None,
    }
}

/// Creates `root` if needed. An unusable data root is fatal.
pub fn prepare_data_root(device: &str, root: &Path) -> AppResult<()> {
    std::fs::create_dir_all(root).map_err(|err| {
        ServiceError::Configuration(format!(
            "{device} data path is not accessible: {}: {err}",
            root.display()
        ))
    })?;
    if !root.is_dir() {
        return Err(ServiceError::Configuration(format!(
            "{device} data path is not a directory: {}",
            root.display()
        )));
    }
    Ok(())
}

fn session_for(def: &DeviceDefinition, factory: &Arc<dyn ConnectionFactory>) -> AppResult<Session> {
    let mut session = Session::new(def.id.as_str())
        .with_profile(def.profile.to_profile())
        .with_file_time(def.file_time);
    if def.kind.is_remote() {
        session = session.with_connection(ConnectionSlot::new(def.endpoint(), factory.clone()));
    }
    if let Some(root) = &def.data_root {
        prepare_data_root(&def.id, root)?;
        session = session.with_data_root(root);
    }
    let suffix = def
        .raw_suffix
        .clone()
        .or_else(|| default_raw_suffix(def.kind).map(str::to_string));
    if let Some(suffix) = suffix {
        session = session.with_raw_suffix(suffix);
    }
    Ok(session)
}

/// Builds the integration a definition describes.
pub fn build_device(
    def: &DeviceDefinition,
    factory: Arc<dyn ConnectionFactory>,
) -> AppResult<Box<dyn Device>> {
    let session = session_for(def, &factory)?;
    debug!(device = %def.id, kind = def.kind.as_str(), "Building device");
    let device: Box<dyn Device> = match def.kind {
        DeviceKind::Sync => {
            let mut sync = SyncDevice::new(session);
            if let Some(timeout) = def.finalize_timeout() {
                sync = sync.with_finalize_timeout(timeout);
            }
            Box::new(sync)
        }
        DeviceKind::Camstim => {
            let mut camstim = CamstimDevice::new(session);
            if let Some(script) = &def.script {
                let params = def.script_params.clone().unwrap_or(Value::Null);
                camstim = camstim.with_script(script.clone(), params);
            }
            if let Some(timeout) = def.finalize_timeout() {
                camstim = camstim.with_finalize_timeout(timeout);
            }
            Box::new(camstim)
        }
        DeviceKind::VideoMvr => {
            let mut video = VideoMvr::new(session, def.camera_pattern.as_deref())?;
            if let Some(timeout) = def.finalize_timeout() {
                video = video.with_finalize_timeout(timeout);
            }
            Box::new(video)
        }
        DeviceKind::ImageMvr => {
            let mut image = ImageMvr::new(session, def.camera_pattern.as_deref())?;
            if let Some(label) = &def.label {
                image = image.with_label(label.clone());
            }
            if let Some(timeout) = def.finalize_timeout() {
                image = image.with_finalize_timeout(timeout);
            }
            Box::new(image)
        }
        DeviceKind::JsonLog => {
            let label = def.label.clone().unwrap_or_else(|| def.id.clone());
            Box::new(JsonLogDevice::new(session, label))
        }
    };
    Ok(device)
}

/// Invokes a remote method on the session's connection.
pub(crate) async fn invoke(session: &mut Session, method: &str, params: Value) -> AppResult<Value> {
    let connection = session.connection()?;
    debug!(device = %session.name(), method, "Remote call");
    connection.call(method, params).await
}

/// True if a pair-shaped state equals `("BUSY", started_detail)`.
pub(crate) async fn pair_started(device: &mut dyn Device, started_detail: &str) -> AppResult<bool> {
    Ok(device.state().await?.matches(Coarse::Busy, started_detail))
}

/// True if a pair-shaped state reports `READY` and is not the started state.
pub(crate) async fn pair_ready(device: &mut dyn Device, started_detail: &str) -> AppResult<bool> {
    let state = device.state().await?;
    Ok(!state.matches(Coarse::Busy, started_detail) && state.is_ready())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::simulated::SimulatedRig;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn sync_def(root: PathBuf) -> DeviceDefinition {
        DeviceDefinition {
            host: "sync-host".to_string(),
            port: 5000,
            data_root: Some(root),
            ..DeviceDefinition::new("Sync", DeviceKind::Sync)
        }
    }

    #[test]
    fn build_creates_missing_data_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("sync").join("data");
        let mut device = build_device(&sync_def(root.clone()), Arc::new(SimulatedRig::new())).unwrap();
        assert!(root.is_dir());
        assert_eq!(device.name(), "Sync");
        assert_eq!(device.session().raw_suffix(), Some(".sync"));
        assert!(device.capabilities().recorder);
    }

    #[test]
    fn unusable_data_root_is_a_configuration_error() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        let result = build_device(&sync_def(file), Arc::new(SimulatedRig::new()));
        assert!(matches!(result, Err(ServiceError::Configuration(_))));
    }

    #[test]
    fn json_log_has_no_connection() {
        let dir = TempDir::new().unwrap();
        let def = DeviceDefinition {
            data_root: Some(dir.path().to_path_buf()),
            ..DeviceDefinition::new("Notes", DeviceKind::JsonLog)
        };
        let device = build_device(&def, Arc::new(SimulatedRig::new())).unwrap();
        assert!(device.session().slot().is_none());
    }

    #[test]
    fn raw_suffix_defaults_follow_kind() {
        assert_eq!(default_raw_suffix(DeviceKind::Sync), Some(".sync"));
        assert_eq!(default_raw_suffix(DeviceKind::VideoMvr), Some(".mp4"));
        assert_eq!(default_raw_suffix(DeviceKind::Camstim), None);
    }
}

//! Service configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/services.toml` (base configuration)
//! 2. Environment variables (prefixed with `RIGSVC_`, nested keys separated by `__`)
//!
//! # Example
//!
//! ```no_run
//! use rig_services::config::ServicesConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = ServicesConfig::load()?;
//!     println!("Application: {}", config.application.name);
//!     println!("Devices: {}", config.enabled_devices().len());
//!     Ok(())
//! }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::device::connection::{Endpoint, Serialization};
use crate::device::session::RecordingProfile;
use crate::error::{AppResult, ServiceError};
use crate::lifecycle::locator::FileTime;
use crate::lifecycle::machine::Timing;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/services.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "RIGSVC_";

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Lifecycle engine cadences
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// Device definitions, in run order
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (text, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Lifecycle engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Interval between device status checks in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Pause between start and verify in a pretest, in milliseconds
    #[serde(default = "default_settle")]
    pub settle_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            settle_ms: default_settle(),
        }
    }
}

impl LifecycleConfig {
    pub fn timing(&self) -> Timing {
        Timing {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            settle: Duration::from_millis(self.settle_ms),
        }
    }
}

/// Supported device integrations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Timing/sync box
    Sync,
    /// Stimulus-presentation agent
    Camstim,
    /// Multi-camera video capture
    VideoMvr,
    /// Still-image capture from the auxiliary camera
    ImageMvr,
    /// Local auxiliary JSON logger
    JsonLog,
}

impl DeviceKind {
    /// True for kinds driven over a network connection.
    pub fn is_remote(&self) -> bool {
        !matches!(self, DeviceKind::JsonLog)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Sync => "sync",
            DeviceKind::Camstim => "camstim",
            DeviceKind::VideoMvr => "video_mvr",
            DeviceKind::ImageMvr => "image_mvr",
            DeviceKind::JsonLog => "json_log",
        }
    }
}

/// Recording-rate profile as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Data volume per hour of recording in GB
    #[serde(default = "default_gb_per_hr")]
    pub gb_per_hr: f64,
    /// Minimum session length the data target must hold, in hours
    #[serde(default = "default_min_rec_hr")]
    pub min_rec_hr: f64,
    /// Pretest recording length in seconds
    #[serde(default = "default_pretest_duration")]
    pub pretest_duration_sec: f64,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            gb_per_hr: default_gb_per_hr(),
            min_rec_hr: default_min_rec_hr(),
            pretest_duration_sec: default_pretest_duration(),
        }
    }
}

impl ProfileConfig {
    pub fn to_profile(&self) -> RecordingProfile {
        RecordingProfile {
            gb_per_hr: self.gb_per_hr,
            min_rec_hr: self.min_rec_hr,
            pretest_duration: Duration::from_secs_f64(self.pretest_duration_sec.max(0.0)),
        }
    }
}

/// Device definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device identifier, also its display name
    pub id: String,
    /// Integration type
    pub kind: DeviceKind,
    /// Whether this device takes part in runs
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Service host (remote kinds)
    #[serde(default)]
    pub host: String,
    /// Service port (remote kinds)
    #[serde(default)]
    pub port: u16,
    /// Connection timeout in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    /// Wire serialization requested from the transport
    #[serde(default)]
    pub serialization: Serialization,
    /// Recording-rate profile
    #[serde(default)]
    pub profile: ProfileConfig,
    /// Directory the device writes data to
    #[serde(default)]
    pub data_root: Option<PathBuf>,
    /// Raw output suffix, overriding the kind's default
    #[serde(default)]
    pub raw_suffix: Option<String>,
    /// Timestamp used to attribute files to a recording
    #[serde(default)]
    pub file_time: FileTime,
    /// Bound on post-stop processing in milliseconds, overriding the kind's default
    #[serde(default)]
    pub finalize_timeout_ms: Option<u64>,
    /// Label appended to captured image names (image_mvr) or log name (json_log)
    #[serde(default)]
    pub label: Option<String>,
    /// Stimulus script to run on start (camstim)
    #[serde(default)]
    pub script: Option<String>,
    /// Parameters passed with the script (camstim)
    #[serde(default)]
    pub script_params: Option<serde_json::Value>,
    /// Case-insensitive pattern for auxiliary camera labels (video_mvr, image_mvr)
    #[serde(default)]
    pub camera_pattern: Option<String>,
}

impl DeviceDefinition {
    /// Minimal definition with defaults for everything but identity.
    pub fn new(id: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: true,
            host: String::new(),
            port: 0,
            timeout_ms: default_timeout(),
            serialization: Serialization::default(),
            profile: ProfileConfig::default(),
            data_root: None,
            raw_suffix: None,
            file_time: FileTime::default(),
            finalize_timeout_ms: None,
            label: None,
            script: None,
            script_params: None,
            camera_pattern: None,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_serialization(self.serialization)
    }

    pub fn finalize_timeout(&self) -> Option<Duration> {
        self.finalize_timeout_ms.map(Duration::from_millis)
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_settle() -> u64 {
    1000
}

fn default_enabled() -> bool {
    true
}

fn default_timeout() -> u64 {
    10_000
}

fn default_gb_per_hr() -> f64 {
    2.0
}

fn default_min_rec_hr() -> f64 {
    3.0
}

fn default_pretest_duration() -> f64 {
    5.0
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl ServicesConfig {
    /// Load configuration from `config/services.toml` and environment variables
    ///
    /// Environment variables (`RIGSVC_` prefix) take precedence over the file.
    /// After loading, configuration is validated.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level and log format are valid
    /// - Lifecycle poll interval is non-zero
    /// - Device IDs are unique and non-empty
    /// - Remote devices have a host and port
    /// - Profiles are non-negative
    /// - Kind-specific fields are usable
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ServiceError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(ServiceError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.lifecycle.poll_interval_ms == 0 {
            return Err(ServiceError::Configuration(
                "lifecycle.poll_interval_ms must be > 0".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                return Err(ServiceError::Configuration(
                    "Device 'id' cannot be empty".to_string(),
                ));
            }
            if !ids.insert(&device.id) {
                return Err(ServiceError::Configuration(format!(
                    "Duplicate device ID: '{}'",
                    device.id
                )));
            }
            self.validate_device(device)?;
        }

        Ok(())
    }

    /// Validate a specific device's configuration
    fn validate_device(&self, device: &DeviceDefinition) -> AppResult<()> {
        if device.kind.is_remote() {
            if device.host.is_empty() {
                return Err(ServiceError::Configuration(format!(
                    "{} device '{}': 'host' cannot be empty",
                    device.kind.as_str(),
                    device.id
                )));
            }
            if device.port == 0 {
                return Err(ServiceError::Configuration(format!(
                    "{} device '{}': 'port' must be > 0",
                    device.kind.as_str(),
                    device.id
                )));
            }
        }

        let profile = &device.profile;
        if profile.gb_per_hr < 0.0 || profile.min_rec_hr < 0.0 || profile.pretest_duration_sec < 0.0
        {
            return Err(ServiceError::Configuration(format!(
                "Device '{}': profile values cannot be negative",
                device.id
            )));
        }

        match device.kind {
            DeviceKind::Camstim => {
                if device.script.as_deref().is_some_and(str::is_empty) {
                    return Err(ServiceError::Configuration(format!(
                        "camstim device '{}': 'script' cannot be empty",
                        device.id
                    )));
                }
            }
            DeviceKind::ImageMvr => {
                if device.label.as_deref().is_some_and(str::is_empty) {
                    return Err(ServiceError::Configuration(format!(
                        "image_mvr device '{}': 'label' cannot be empty",
                        device.id
                    )));
                }
                if device.data_root.is_none() {
                    return Err(ServiceError::Configuration(format!(
                        "image_mvr device '{}' missing 'data_root'",
                        device.id
                    )));
                }
                Self::validate_camera_pattern(device)?;
            }
            DeviceKind::VideoMvr => {
                if device.data_root.is_none() {
                    return Err(ServiceError::Configuration(format!(
                        "video_mvr device '{}' missing 'data_root'",
                        device.id
                    )));
                }
                Self::validate_camera_pattern(device)?;
            }
            DeviceKind::JsonLog => {
                if device.data_root.is_none() {
                    return Err(ServiceError::Configuration(format!(
                        "json_log device '{}' missing 'data_root'",
                        device.id
                    )));
                }
            }
            DeviceKind::Sync => {}
        }

        Ok(())
    }

    fn validate_camera_pattern(device: &DeviceDefinition) -> AppResult<()> {
        if let Some(pattern) = &device.camera_pattern {
            if let Err(err) = regex::Regex::new(pattern) {
                return Err(ServiceError::Configuration(format!(
                    "{} device '{}': invalid 'camera_pattern': {err}",
                    device.kind.as_str(),
                    device.id
                )));
            }
        }
        Ok(())
    }

    /// Get all enabled devices
    pub fn enabled_devices(&self) -> Vec<&DeviceDefinition> {
        self.devices.iter().filter(|d| d.enabled).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn application() -> ApplicationConfig {
        ApplicationConfig {
            name: "Test Rig".to_string(),
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }

    fn sync_device() -> DeviceDefinition {
        DeviceDefinition {
            host: "sync-host".to_string(),
            port: 5000,
            data_root: Some(PathBuf::from("/data/sync")),
            ..DeviceDefinition::new("Sync", DeviceKind::Sync)
        }
    }

    fn config(devices: Vec<DeviceDefinition>) -> ServicesConfig {
        ServicesConfig {
            application: application(),
            lifecycle: LifecycleConfig::default(),
            devices,
        }
    }

    #[test]
    fn test_config_validation_valid() {
        let mut log = DeviceDefinition::new("Notes", DeviceKind::JsonLog);
        log.data_root = Some(PathBuf::from("/data/notes"));
        assert!(config(vec![sync_device(), log]).validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut cfg = config(vec![]);
        cfg.application.log_level = "verbose".to_string();
        let result = cfg.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_invalid_log_format() {
        let mut cfg = config(vec![]);
        cfg.application.log_format = "xml".to_string();
        assert!(cfg
            .validate()
            .unwrap_err()
            .to_string()
            .contains("Invalid log_format"));
    }

    #[test]
    fn test_duplicate_device_ids() {
        let result = config(vec![sync_device(), sync_device()]).validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Duplicate device ID: 'Sync'"));
    }

    #[test]
    fn test_remote_device_missing_host() {
        let mut device = sync_device();
        device.host = String::new();
        let result = config(vec![device]).validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("'host' cannot be empty"));
    }

    #[test]
    fn test_remote_device_missing_port() {
        let mut device = sync_device();
        device.port = 0;
        assert!(config(vec![device])
            .validate()
            .unwrap_err()
            .to_string()
            .contains("'port' must be > 0"));
    }

    #[test]
    fn test_negative_profile() {
        let mut device = sync_device();
        device.profile.gb_per_hr = -1.0;
        assert!(config(vec![device]).validate().is_err());
    }

    #[test]
    fn test_json_log_requires_data_root() {
        let device = DeviceDefinition::new("Notes", DeviceKind::JsonLog);
        assert!(config(vec![device])
            .validate()
            .unwrap_err()
            .to_string()
            .contains("missing 'data_root'"));
    }

    #[test]
    fn test_image_label_cannot_be_empty() {
        let device = DeviceDefinition {
            host: "mon".to_string(),
            port: 50000,
            data_root: Some(PathBuf::from("/data/mvr")),
            label: Some(String::new()),
            ..DeviceDefinition::new("ImageMVR", DeviceKind::ImageMvr)
        };
        assert!(config(vec![device])
            .validate()
            .unwrap_err()
            .to_string()
            .contains("'label' cannot be empty"));
    }

    #[test]
    fn test_invalid_camera_pattern() {
        let device = DeviceDefinition {
            host: "mon".to_string(),
            port: 50000,
            camera_pattern: Some("aux(".to_string()),
            data_root: Some(PathBuf::from("/data/mvr")),
            ..DeviceDefinition::new("VideoMVR", DeviceKind::VideoMvr)
        };
        assert!(config(vec![device])
            .validate()
            .unwrap_err()
            .to_string()
            .contains("invalid 'camera_pattern'"));
    }

    #[test]
    fn test_enabled_devices_filter() {
        let mut disabled = sync_device();
        disabled.id = "Sync2".to_string();
        disabled.enabled = false;
        let cfg = config(vec![sync_device(), disabled]);
        let enabled = cfg.enabled_devices();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "Sync");
    }

    #[test]
    fn test_profile_defaults() {
        let profile = ProfileConfig::default().to_profile();
        assert_eq!(profile, RecordingProfile::default());
        assert_eq!(profile.required_disk_gb(), 6.0);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("services.toml");
        std::fs::write(
            &path,
            r#"
[application]
name = "Rig 1"
log_level = "debug"

[lifecycle]
poll_interval_ms = 250

[[devices]]
id = "Sync"
kind = "sync"
host = "sync-host"
port = 5000
serialization = "pkl"
data_root = "/data/sync"

[devices.profile]
gb_per_hr = 1.5
min_rec_hr = 4.0

[[devices]]
id = "Notes"
kind = "json_log"
data_root = "/data/notes"
file_time = "modified"
"#,
        )
        .unwrap();

        let cfg = ServicesConfig::load_from(&path).unwrap();
        assert_eq!(cfg.application.name, "Rig 1");
        assert_eq!(cfg.application.log_format, "text");
        assert_eq!(cfg.lifecycle.timing().poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.devices.len(), 2);

        let sync = &cfg.devices[0];
        assert_eq!(sync.kind, DeviceKind::Sync);
        assert_eq!(sync.serialization, Serialization::Pickle);
        assert_eq!(sync.endpoint().to_string(), "sync-host:5000");
        assert_eq!(sync.endpoint().timeout, Duration::from_secs(10));
        assert_eq!(sync.profile.to_profile().required_disk_gb(), 6.0);
        assert_eq!(cfg.devices[1].file_time, FileTime::Modified);
    }

    #[test]
    fn test_load_rejects_unknown_kind() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("services.toml");
        std::fs::write(
            &path,
            r#"
[application]
name = "Rig 1"

[[devices]]
id = "Laser"
kind = "maitai"
"#,
        )
        .unwrap();
        assert!(matches!(
            ServicesConfig::load_from(&path),
            Err(ServiceError::ConfigLoad(_))
        ));
    }
}

//! Device-reported status values.
//!
//! Devices describe themselves in one of two shapes: a `(coarse, detail)` pair
//! such as `("BUSY", "RECORDING")`, or a per-camera status list. Both are kept
//! in one tagged [`DeviceState`]; only the owning device integration decides
//! what "started" or "ready" means for it.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coarse status word reported by pair-shaped devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Coarse {
    /// Nothing was reported, or the word was not recognised.
    Empty,
    /// Idle and able to start.
    Ready,
    /// Recording or still processing.
    Busy,
}

impl Coarse {
    pub fn parse(word: &str) -> Self {
        match word.trim() {
            "READY" => Coarse::Ready,
            "BUSY" => Coarse::Busy,
            _ => Coarse::Empty,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Coarse::Empty => "",
            Coarse::Ready => "READY",
            Coarse::Busy => "BUSY",
        }
    }
}

/// Status of one camera managed by the video capture service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraStatus {
    #[serde(alias = "camera_id")]
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub is_open: bool,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default)]
    pub is_recording: bool,
}

/// Opaque device status; interpreted only by the device that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    Status { coarse: Coarse, detail: String },
    Cameras(Vec<CameraStatus>),
}

impl DeviceState {
    pub fn status(coarse: Coarse, detail: impl Into<String>) -> Self {
        DeviceState::Status {
            coarse,
            detail: detail.into(),
        }
    }

    pub fn ready() -> Self {
        DeviceState::status(Coarse::Ready, "")
    }

    /// Decodes the native status value returned by a device.
    ///
    /// Accepts `["READY", ""]`, the deprecated `{"message": "READY", ...}`
    /// mapping, and a list of camera status objects.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Array(items) if items.iter().all(Value::is_object) && !items.is_empty() => {
                let cameras = serde_json::from_value(value.clone())
                    .map_err(|err| format!("invalid camera status list: {err}"))?;
                Ok(DeviceState::Cameras(cameras))
            }
            Value::Array(items) => {
                let word = |idx: usize| items.get(idx).and_then(Value::as_str).unwrap_or("");
                if items.len() > 2 || items.iter().any(|v| !v.is_string()) {
                    return Err(format!("expected a (coarse, detail) pair, got {value}"));
                }
                Ok(DeviceState::status(Coarse::parse(word(0)), word(1)))
            }
            Value::Object(map) => {
                let message = map.get("message").and_then(Value::as_str).unwrap_or("");
                let detail = map.get("detail").and_then(Value::as_str).unwrap_or("");
                Ok(DeviceState::status(Coarse::parse(message), detail))
            }
            other => Err(format!("unrecognized device state: {other}")),
        }
    }

    pub fn coarse(&self) -> Option<Coarse> {
        match self {
            DeviceState::Status { coarse, .. } => Some(*coarse),
            DeviceState::Cameras(_) => None,
        }
    }

    /// True if this is a pair-shaped state equal to `(coarse, detail)`.
    pub fn matches(&self, coarse: Coarse, detail: &str) -> bool {
        match self {
            DeviceState::Status {
                coarse: c,
                detail: d,
            } => *c == coarse && d == detail,
            DeviceState::Cameras(_) => false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.coarse() == Some(Coarse::Ready)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Status { coarse, detail } => {
                write!(f, "({:?}, {:?})", coarse.as_str(), detail)
            }
            DeviceState::Cameras(cams) => {
                let summary: Vec<String> = cams
                    .iter()
                    .map(|c| {
                        format!(
                            "{}[open={} streaming={} recording={}]",
                            c.label, c.is_open, c.is_streaming, c.is_recording
                        )
                    })
                    .collect();
                write!(f, "cameras {}", summary.join(", "))
            }
        }
    }
}

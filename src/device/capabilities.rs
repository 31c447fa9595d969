//! Capability traits implemented by device integrations.
//!
//! A device implements [`Device`] plus any subset of the capability traits.
//! The lifecycle engine asks for each capability through the `as_*` queries
//! and skips steps a device does not support. Capability traits carry only
//! device-specific hooks; ordering, preflight and waiting live in
//! [`crate::lifecycle::Lifecycle`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::device::session::{Artifact, Session};
use crate::device::state::DeviceState;
use crate::error::{AppResult, ServiceError};
use crate::lifecycle::locator;

/// Default bound on waiting for a device to finish processing after stop.
pub const DEFAULT_FINALIZE_TIMEOUT: Duration = Duration::from_secs(10);

/// Growth-check scale for most raw outputs.
pub const DEFAULT_GROWTH_SCALE: f64 = 0.5;

/// Base trait for every device integration.
#[async_trait]
pub trait Device: Send + Sync {
    fn session(&self) -> &Session;

    fn session_mut(&mut self) -> &mut Session;

    fn name(&self) -> &str {
        self.session().name()
    }

    /// Replaces any memoized connection with a fresh one.
    async fn connect(&mut self) -> AppResult<()> {
        if let Some(slot) = self.session_mut().slot_mut() {
            slot.reconnect()?;
        }
        Ok(())
    }

    /// Drops the memoized connection.
    fn teardown(&mut self) {
        if let Some(slot) = self.session_mut().slot_mut() {
            slot.reset();
        }
    }

    /// Queries the native device status.
    async fn state(&mut self) -> AppResult<DeviceState> {
        let connection = self.session_mut().connection()?;
        let reply = connection.call("get_state", Value::Null).await?;
        DeviceState::from_value(&reply).map_err(|detail| ServiceError::protocol(self.name(), detail))
    }

    /// Reachability check, then uptime, then a status query.
    ///
    /// Failures are recorded on the session. Devices without a connection are
    /// local and always connected.
    async fn is_connected(&mut self) -> bool {
        let Some(slot) = self.session().slot() else {
            return true;
        };
        if !slot.is_reachable().await {
            let address = self.session().address();
            self.session_mut()
                .record_error(&format!("{address} is not reachable"));
            return false;
        }
        let uptime = match self.session_mut().connection() {
            Ok(connection) => connection.uptime().await,
            Err(err) => Err(err),
        };
        if let Err(err) = uptime {
            debug!(device = %self.name(), error = %err, "Uptime query failed");
            self.session_mut().record_error(&err);
            return false;
        }
        match self.state().await {
            Ok(state) => {
                debug!(device = %self.name(), %state, "Device answered");
                true
            }
            Err(err) => {
                self.session_mut().record_error(&err);
                false
            }
        }
    }

    /// Device-specific setup run by `initialize` after reconnecting.
    async fn prepare(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn as_testable(&mut self) -> Option<&mut dyn Testable> {
        None
    }

    fn as_startable(&mut self) -> Option<&mut dyn Startable> {
        None
    }

    fn as_stoppable(&mut self) -> Option<&mut dyn Stoppable> {
        None
    }

    fn as_verifiable(&mut self) -> Option<&mut dyn Verifiable> {
        None
    }

    fn as_finalizable(&mut self) -> Option<&mut dyn Finalizable> {
        None
    }

    fn as_validatable(&mut self) -> Option<&mut dyn Validatable> {
        None
    }

    fn as_recorder(&self) -> Option<&dyn Recorder> {
        None
    }

    fn capabilities(&mut self) -> Capabilities {
        Capabilities {
            testable: self.as_testable().is_some(),
            startable: self.as_startable().is_some(),
            stoppable: self.as_stoppable().is_some(),
            verifiable: self.as_verifiable().is_some(),
            finalizable: self.as_finalizable().is_some(),
            validatable: self.as_validatable().is_some(),
            recorder: self.as_recorder().is_some(),
        }
    }
}

/// Cheap device-specific self-check run by `test`, after the generic
/// connectivity and disk checks. Must not change device state.
#[async_trait]
pub trait Testable: Device {
    async fn self_check(&mut self) -> AppResult<()> {
        Ok(())
    }
}

#[async_trait]
pub trait Startable: Device {
    /// True if the device state means a recording is in progress.
    async fn is_started(&mut self) -> AppResult<bool>;

    /// True if the device is idle and not recording.
    async fn is_ready_to_start(&mut self) -> AppResult<bool>;

    /// Issues the native start command.
    async fn start(&mut self) -> AppResult<()>;
}

#[async_trait]
pub trait Stoppable: Device {
    /// Requests cessation. Does not wait for the device to flush.
    async fn stop(&mut self) -> AppResult<()>;
}

#[async_trait]
pub trait Verifiable: Device {
    /// Scale applied to the growth-check sampling delay.
    fn growth_scale(&self) -> f64 {
        DEFAULT_GROWTH_SCALE
    }

    /// Fails unless there is observable evidence of output.
    ///
    /// The default checks that the latest raw file in the recording window
    /// grows between two samples.
    async fn verify(&mut self) -> AppResult<()> {
        verify_growth(self.session(), self.growth_scale()).await
    }
}

/// Growth check of the newest raw file in the session's recording window.
pub async fn verify_growth(session: &Session, scale: f64) -> AppResult<()> {
    if session.raw_suffix().is_none() {
        return Ok(());
    }
    let latest = session.latest_data(None).pop();
    let Some(latest) = latest else {
        return Err(ServiceError::NoEvidence {
            device: session.name().to_string(),
            reason: format!("no {} file found", session.default_pattern()),
        });
    };
    if locator::is_file_growing(&latest.path, scale).await? {
        Ok(())
    } else {
        Err(ServiceError::NoEvidence {
            device: session.name().to_string(),
            reason: format!("{} is not increasing in size", latest.path.display()),
        })
    }
}

#[async_trait]
pub trait Finalizable: Device {
    fn finalize_timeout(&self) -> Duration {
        DEFAULT_FINALIZE_TIMEOUT
    }

    /// Globs collected from the recording window once processing is done.
    fn artifact_patterns(&self) -> Vec<String>;

    /// True once the device has finished post-stop processing.
    ///
    /// Defaults to readiness for startable devices.
    async fn processing_done(&mut self) -> AppResult<bool> {
        match self.as_startable() {
            Some(startable) => startable.is_ready_to_start().await,
            None => Ok(true),
        }
    }

    /// Post-processes the files found in the recording window.
    async fn collect(&mut self, found: Vec<Artifact>) -> AppResult<Vec<Artifact>> {
        Ok(found)
    }
}

#[async_trait]
pub trait Validatable: Device {
    /// Extension, without the dot, that a valid output file must carry.
    fn expected_extension(&self) -> &str;

    /// Structured inspection of the file contents.
    ///
    /// `None` when structured validation is unavailable for this build or
    /// format.
    async fn full_validation(&mut self, _artifact: &Artifact) -> Option<AppResult<()>> {
        None
    }
}

/// Marker for devices that write files under a data root.
pub trait Recorder: Device {}

/// Summary of the capability traits a device implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// [`Testable`]
    pub testable: bool,
    /// [`Startable`]
    pub startable: bool,
    /// [`Stoppable`]
    pub stoppable: bool,
    /// [`Verifiable`]
    pub verifiable: bool,
    /// [`Finalizable`]
    pub finalizable: bool,
    /// [`Validatable`]
    pub validatable: bool,
    /// Writes data during a recording, so disk space is checked.
    pub recorder: bool,
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (self.testable, "testable"),
            (self.startable, "startable"),
            (self.stoppable, "stoppable"),
            (self.verifiable, "verifiable"),
            (self.finalizable, "finalizable"),
            (self.validatable, "validatable"),
            (self.recorder, "recorder"),
        ];
        let listed: Vec<&str> = names
            .iter()
            .filter(|(present, _)| *present)
            .map(|(_, name)| *name)
            .collect();
        if listed.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", listed.join(", "))
        }
    }
}

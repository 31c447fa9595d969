//! Stimulus-presentation agent integration.
//!
//! The agent reports `("BUSY", "Script in progress.")` while a stimulus runs
//! and leaves a `.pkl` behind once it has finished. Output is only collected
//! when the agent's share is configured as a data root.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::device::capabilities::{
    Device, Finalizable, Recorder, Startable, Stoppable, Testable, Verifiable,
    DEFAULT_FINALIZE_TIMEOUT,
};
use crate::device::session::Session;
use crate::devices::{invoke, pair_ready, pair_started};
use crate::error::AppResult;

pub const STARTED_DETAIL: &str = "Script in progress.";
pub const OUTPUT_EXTENSION: &str = "pkl";

/// What the agent runs on start.
#[derive(Debug, Clone, PartialEq)]
pub enum StimulusLaunch {
    /// Whatever the agent has loaded.
    Default,
    /// A script path on the stimulus computer with its parameters.
    Script { script: String, params: Value },
    /// A session looked up by the agent for a subject and user.
    Session { mouse_id: String, user_id: String },
}

pub struct CamstimDevice {
    session: Session,
    launch: StimulusLaunch,
    finalize_timeout: Duration,
}

impl CamstimDevice {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            launch: StimulusLaunch::Default,
            finalize_timeout: DEFAULT_FINALIZE_TIMEOUT,
        }
    }

    pub fn with_script(mut self, script: String, params: Value) -> Self {
        self.launch = StimulusLaunch::Script { script, params };
        self
    }

    pub fn with_session(mut self, mouse_id: String, user_id: String) -> Self {
        self.launch = StimulusLaunch::Session { mouse_id, user_id };
        self
    }

    pub fn with_finalize_timeout(mut self, timeout: Duration) -> Self {
        self.finalize_timeout = timeout;
        self
    }

    pub fn launch(&self) -> &StimulusLaunch {
        &self.launch
    }
}

impl Device for CamstimDevice {
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

    fn as_recorder(&self) -> Option<&dyn Recorder> {
        self.session.data_root().map(|_| self as &dyn Recorder)
    }
}

impl Testable for CamstimDevice {}

impl Recorder for CamstimDevice {}

#[async_trait]
impl Startable for CamstimDevice {
    async fn is_started(&mut self) -> AppResult<bool> {
        pair_started(self, STARTED_DETAIL).await
    }

    async fn is_ready_to_start(&mut self) -> AppResult<bool> {
        pair_ready(self, STARTED_DETAIL).await
    }

    async fn start(&mut self) -> AppResult<()> {
        let (method, params) = match &self.launch {
            StimulusLaunch::Default => ("start", Value::Null),
            StimulusLaunch::Script { script, params } => {
                info!(device = %self.session.name(), %script, "Running stimulus script");
                ("start_script", json!({ "script": script, "params": params }))
            }
            StimulusLaunch::Session { mouse_id, user_id } => (
                "start_session",
                json!({ "mouse_id": mouse_id, "user_id": user_id }),
            ),
        };
        invoke(&mut self.session, method, params).await?;
        Ok(())
    }
}

#[async_trait]
impl Stoppable for CamstimDevice {
    async fn stop(&mut self) -> AppResult<()> {
        invoke(&mut self.session, "stop", Value::Null).await?;
        Ok(())
    }
}

// No raw output: verification is the started check alone.
impl Verifiable for CamstimDevice {}

impl Finalizable for CamstimDevice {
    fn finalize_timeout(&self) -> Duration {
        self.finalize_timeout
    }

    fn artifact_patterns(&self) -> Vec<String> {
        vec![format!("*.{OUTPUT_EXTENSION}")]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::connection::{ConnectionSlot, Endpoint};
    use crate::devices::simulated::{RecorderProfile, SimulatedRecorder, SimulatedRig};
    use std::sync::Arc;

    fn device(session: Session) -> (Session, SimulatedRecorder) {
        let recorder = SimulatedRecorder::new(RecorderProfile::camstim());
        let rig = SimulatedRig::new().with_service("stim:6000", Arc::new(recorder.clone()));
        let session =
            session.with_connection(ConnectionSlot::new(Endpoint::new("stim", 6000), Arc::new(rig)));
        (session, recorder)
    }

    #[tokio::test]
    async fn script_launch_sends_script_and_params() {
        let (session, recorder) = device(Session::new("Camstim"));
        let mut camstim = CamstimDevice::new(session)
            .with_script("C:/stim/pretest.py".to_string(), json!({"mouse_id": "599657"}));

        Startable::start(&mut camstim).await.unwrap();
        assert_eq!(recorder.call_count("start_script"), 1);
        assert_eq!(recorder.last_params()["script"], json!("C:/stim/pretest.py"));
        assert_eq!(recorder.last_params()["params"]["mouse_id"], json!("599657"));
        assert!(camstim.is_started().await.unwrap());
    }

    #[tokio::test]
    async fn default_launch_uses_plain_start() {
        let (session, recorder) = device(Session::new("Camstim"));
        let mut camstim = CamstimDevice::new(session);
        Startable::start(&mut camstim).await.unwrap();
        assert_eq!(recorder.call_count("start"), 1);
        assert_eq!(recorder.call_count("start_script"), 0);
    }

    #[tokio::test]
    async fn session_launch_sends_subject() {
        let (session, recorder) = device(Session::new("Camstim"));
        let mut camstim =
            CamstimDevice::new(session).with_session("598796".to_string(), "operator".to_string());
        Startable::start(&mut camstim).await.unwrap();
        assert_eq!(recorder.call_count("start_session"), 1);
        assert_eq!(recorder.last_params()["mouse_id"], json!("598796"));
    }

    #[test]
    fn recorder_only_with_data_root() {
        let (session, _recorder) = device(Session::new("Camstim"));
        assert!(CamstimDevice::new(session).as_recorder().is_none());

        let (session, _recorder) = device(Session::new("Camstim").with_data_root("/stim/output"));
        let camstim = CamstimDevice::new(session);
        assert!(camstim.as_recorder().is_some());
        assert_eq!(camstim.artifact_patterns(), vec!["*.pkl".to_string()]);
    }
}

//! Per-device lifecycle state machine.
//!
//! [`Lifecycle`] owns one device and drives it through
//! `initialize → test → start → verify → stop → finalize → validate`. The
//! generic policy lives here: preflight before start, bounded waiting after
//! stop, windowed artifact collection and minimal validation. Device types
//! contribute only their hooks, through the capability traits.
//!
//! Any failing step moves the machine to [`LifecycleState::Error`] and records
//! the error text on the device session. Bounded waits that run out are not
//! failures; they are reported through [`Finalized::timed_out`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::device::capabilities::Device;
use crate::device::session::{Artifact, Session};
use crate::error::{AppResult, ServiceError};
use crate::lifecycle::poll::{PollPolicy, DEFAULT_POLL_INTERVAL};
use crate::lifecycle::preflight::{self, DiskCheck, DiskSpace, SystemDisks};

/// Where a device is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    /// Built but `initialize` has not run.
    Uninitialized,
    /// Session bound to the device; the window is not open yet.
    Initialized,
    /// Preflight passed. `start` is allowed.
    Tested,
    /// Recording.
    Started,
    /// A running recording showed evidence of data.
    Verified,
    Stopped,
    /// Window artifacts collected.
    Finalized,
    /// The newest artifact passed its checks.
    Validated,
    /// The last step failed; see [`Session::last_error`].
    Error,
}

/// Cadences used by the lifecycle engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Interval between status checks while waiting on the device.
    pub poll_interval: Duration,
    /// Pause between start and verify in a pretest.
    pub settle: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            settle: Duration::from_secs(1),
        }
    }
}

/// Result of a finalize step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Finalized {
    /// Artifacts appended to the session by this call.
    pub new_artifacts: Vec<Artifact>,
    /// The device did not finish processing within its finalize timeout.
    pub timed_out: bool,
}

fn processing_done(device: &mut Box<dyn Device>) -> BoxFuture<'_, bool> {
    async move {
        let name = device.name().to_string();
        match device.as_finalizable() {
            Some(finalizable) => match finalizable.processing_done().await {
                Ok(done) => done,
                Err(err) => {
                    debug!(device = %name, error = %err, "Processing check failed");
                    false
                }
            },
            None => true,
        }
    }
    .boxed()
}

/// Drives one device through its lifecycle.
pub struct Lifecycle {
    device: Box<dyn Device>,
    state: LifecycleState,
    disks: Arc<dyn DiskSpace>,
    timing: Timing,
    preflight_passed: bool,
}

impl Lifecycle {
    /// Wraps `device` with live disk checks and default timing.
    pub fn new(device: Box<dyn Device>) -> Self {
        Self {
            device,
            state: LifecycleState::Uninitialized,
            disks: Arc::new(SystemDisks),
            timing: Timing::default(),
            preflight_passed: false,
        }
    }

    /// Replaces the source of free-space readings used by preflight.
    pub fn with_disk_space(mut self, disks: Arc<dyn DiskSpace>) -> Self {
        self.disks = disks;
        self
    }

    /// Overrides the poll and settle cadences.
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    /// State after the most recent step.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn session(&self) -> &Session {
        self.device.session()
    }

    pub fn device(&self) -> &dyn Device {
        self.device.as_ref()
    }

    /// Direct access to the device, bypassing lifecycle tracking.
    pub fn device_mut(&mut self) -> &mut dyn Device {
        self.device.as_mut()
    }

    /// Capacity in GB the data root must have free before recording.
    pub fn required_disk_gb(&self) -> f64 {
        match self.device.as_recorder() {
            Some(_) => self.session().profile.required_disk_gb(),
            None => 0.0,
        }
    }

    /// Live disk preflight. Failures to inspect the data root are recorded on
    /// the session.
    pub fn check_disk(&mut self) -> DiskCheck {
        let check = preflight::check_disk_space(
            self.disks.as_ref(),
            self.session().data_root(),
            self.required_disk_gb(),
        );
        if let DiskCheck::Inaccessible { reason, .. } = &check {
            self.device.session_mut().record_error(reason);
        }
        check
    }

    pub fn is_disk_space_ok(&mut self) -> bool {
        self.check_disk().is_ok()
    }

    /// True if the device reports a recording in progress. Devices that cannot
    /// be started are never started.
    pub async fn is_started(&mut self) -> AppResult<bool> {
        match self.device.as_startable() {
            Some(startable) => startable.is_started().await,
            None => Ok(false),
        }
    }

    fn track<T>(&mut self, result: AppResult<T>) -> AppResult<T> {
        if let Err(err) = &result {
            warn!(device = %self.name(), error = %err, "Lifecycle step failed");
            self.device.session_mut().record_error(err);
            self.state = LifecycleState::Error;
        }
        result
    }

    fn require_initialized(&self) -> AppResult<()> {
        match self.session().initialized_at() {
            Some(_) => Ok(()),
            None => Err(ServiceError::NotInitialized(self.name().to_string())),
        }
    }

    async fn describe_state(&mut self) -> String {
        match self.device.state().await {
            Ok(state) => state.to_string(),
            Err(err) => err.to_string(),
        }
    }

    /// Reconnects and prepares the device.
    ///
    /// A startable device that is not ready gets one finalize to clear a stuck
    /// busy state. If it is still not ready, initialization is tolerated with a
    /// warning and the session artifacts are kept.
    pub async fn initialize(&mut self) -> AppResult<()> {
        let result = self.initialize_inner().await;
        self.track(result)
    }

    async fn initialize_inner(&mut self) -> AppResult<()> {
        info!(device = %self.name(), "Initializing");
        self.preflight_passed = false;
        self.device.connect().await?;
        self.device.prepare().await?;
        self.device.session_mut().mark_initialized(Utc::now());
        self.state = LifecycleState::Initialized;

        let Some(startable) = self.device.as_startable() else {
            self.device.session_mut().clear_artifacts();
            return Ok(());
        };
        if !startable.is_ready_to_start().await? {
            debug!(device = %self.name(), "Not ready at initialize; finalizing");
            self.finalize_inner().await?;
            self.state = LifecycleState::Initialized;
            let ready = match self.device.as_startable() {
                Some(startable) => startable.is_ready_to_start().await?,
                None => true,
            };
            if !ready {
                let state = self.describe_state().await;
                warn!(device = %self.name(), %state, "Not ready to start after initialize");
                return Ok(());
            }
        }
        self.device.session_mut().clear_artifacts();
        Ok(())
    }

    /// Connectivity, disk preflight and the device self-check.
    ///
    /// Passing is a precondition of [`Lifecycle::start`] until the next
    /// initialize. Never changes device state.
    pub async fn test(&mut self) -> AppResult<()> {
        let result = self.test_inner().await;
        self.track(result)
    }

    async fn test_inner(&mut self) -> AppResult<()> {
        self.require_initialized()?;
        self.preflight_passed = false;
        if self.device.as_testable().is_none() {
            debug!(device = %self.name(), "Not testable; skipping test");
            return Ok(());
        }
        info!(device = %self.name(), "Testing");
        if !self.device.is_connected().await {
            let detail = self.session().last_error().unwrap_or("no response").to_string();
            return Err(ServiceError::Test(format!(
                "{} is not connected: {detail}",
                self.name()
            )));
        }
        match self.check_disk() {
            DiskCheck::Insufficient {
                free_gb,
                required_gb,
            } => {
                return Err(ServiceError::Test(format!(
                    "{} free disk space on {} ({free_gb} GB) is not more than the required {required_gb} GB",
                    self.name(),
                    self.session().address(),
                )));
            }
            DiskCheck::Inaccessible { reason, .. } => {
                return Err(ServiceError::Test(format!("{}: {reason}", self.name())));
            }
            DiskCheck::NotRequired | DiskCheck::Sufficient { .. } => {}
        }
        if let Some(testable) = self.device.as_testable() {
            testable.self_check().await?;
        }
        self.preflight_passed = true;
        if !matches!(
            self.state,
            LifecycleState::Started | LifecycleState::Verified
        ) {
            self.state = LifecycleState::Tested;
        }
        Ok(())
    }

    /// Starts a recording.
    ///
    /// An already-started device is left alone with a warning, since a
    /// restart would replace the recording in progress.
    pub async fn start(&mut self) -> AppResult<()> {
        let result = self.start_inner().await;
        self.track(result)
    }

    async fn start_inner(&mut self) -> AppResult<()> {
        self.require_initialized()?;
        let preflight_ok = self.preflight_passed || self.device.as_testable().is_none();
        let name = self.name().to_string();
        let Some(startable) = self.device.as_startable() else {
            debug!(device = %name, "Not startable; skipping start");
            return Ok(());
        };
        if startable.is_started().await? {
            warn!(device = %name, "{name} already started");
            return Ok(());
        }
        if !preflight_ok {
            return Err(ServiceError::Test(format!(
                "{name} must pass test() before it can start"
            )));
        }
        if !startable.is_ready_to_start().await? {
            let state = match startable.state().await {
                Ok(state) => state.to_string(),
                Err(err) => err.to_string(),
            };
            return Err(ServiceError::NotReady {
                device: name,
                state,
            });
        }
        info!(device = %name, "Starting");
        startable.session_mut().mark_started(Utc::now());
        startable.start().await?;
        self.state = LifecycleState::Started;
        Ok(())
    }

    /// Fails unless the started device shows evidence of output.
    pub async fn verify(&mut self) -> AppResult<()> {
        let result = self.verify_inner().await;
        self.track(result)
    }

    async fn verify_inner(&mut self) -> AppResult<()> {
        self.require_initialized()?;
        if self.device.as_verifiable().is_none() {
            debug!(device = %self.name(), "Not verifiable; skipping verify");
            return Ok(());
        }
        if self.device.as_startable().is_some() && !self.is_started().await? {
            let state = self.describe_state().await;
            warn!(device = %self.name(), %state, "Cannot verify if not started");
            return Err(ServiceError::NotStarted {
                device: self.name().to_string(),
                state,
            });
        }
        if let Some(verifiable) = self.device.as_verifiable() {
            verifiable.verify().await?;
        }
        debug!(device = %self.name(), "Verified");
        self.state = LifecycleState::Verified;
        Ok(())
    }

    /// Requests the device to stop. Does not wait for it to finish processing.
    pub async fn stop(&mut self) -> AppResult<()> {
        let result = self.stop_inner().await;
        self.track(result)
    }

    async fn stop_inner(&mut self) -> AppResult<()> {
        self.require_initialized()?;
        let name = self.name().to_string();
        let Some(stoppable) = self.device.as_stoppable() else {
            debug!(device = %name, "Not stoppable; skipping stop");
            return Ok(());
        };
        info!(device = %name, "Stopping");
        stoppable.stop().await?;
        self.state = LifecycleState::Stopped;
        Ok(())
    }

    /// Stops if needed, waits for processing to finish and collects the files
    /// produced in the recording window.
    ///
    /// A device that stays busy past its finalize timeout yields an empty
    /// result with `timed_out` set and a logged warning.
    pub async fn finalize(&mut self) -> AppResult<Finalized> {
        let result = self.finalize_inner().await;
        self.track(result)
    }

    async fn finalize_inner(&mut self) -> AppResult<Finalized> {
        self.require_initialized()?;
        let Some(finalizable) = self.device.as_finalizable() else {
            debug!(device = %self.name(), "Not finalizable; skipping finalize");
            return Ok(Finalized::default());
        };
        let timeout = finalizable.finalize_timeout();
        if self.is_started().await? {
            self.stop_inner().await?;
        }

        let policy = PollPolicy::new(timeout).with_interval(self.timing.poll_interval);
        if !policy.wait_until(&mut self.device, processing_done).await {
            let name = self.name().to_string();
            warn!(device = %name, ?timeout, "Timed out waiting for {name} to finish processing");
            return Ok(Finalized {
                new_artifacts: Vec::new(),
                timed_out: true,
            });
        }

        let Some(finalizable) = self.device.as_finalizable() else {
            return Ok(Finalized::default());
        };
        let mut found = Vec::new();
        for pattern in finalizable.artifact_patterns() {
            found.extend(finalizable.session().latest_data(Some(&pattern)));
        }
        found.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        let collected = finalizable.collect(found).await?;
        let new_artifacts = self.device.session_mut().append_artifacts(collected);
        info!(
            device = %self.name(),
            count = new_artifacts.len(),
            "Finalized"
        );
        self.state = LifecycleState::Finalized;
        Ok(Finalized {
            new_artifacts,
            timed_out: false,
        })
    }

    /// Checks the most recent artifact with the expected extension.
    ///
    /// A device that is not ready yet is finalized first, so output still
    /// being processed is collected before it is judged.
    ///
    /// Existence, size and extension are mandatory. Structured validation is
    /// best effort: unavailable or failing, it is logged and the minimal
    /// result stands. A device that is still recording is not judged.
    pub async fn validate(&mut self) -> AppResult<()> {
        let result = self.validate_inner().await;
        self.track(result)
    }

    async fn validate_inner(&mut self) -> AppResult<()> {
        self.require_initialized()?;
        let name = self.name().to_string();
        if self.device.as_validatable().is_none() {
            debug!(device = %name, "Not validatable; skipping validate");
            return Ok(());
        }
        if self.is_started().await? {
            warn!(device = %name, "Cannot validate {name} while recording");
            return Ok(());
        }
        let ready = match self.device.as_startable() {
            Some(startable) => startable.is_ready_to_start().await?,
            None => true,
        };
        if !ready {
            debug!(device = %name, "Not ready at validate; finalizing");
            self.finalize_inner().await?;
        }
        let Some(validatable) = self.device.as_validatable() else {
            return Ok(());
        };
        let extension = validatable.expected_extension().to_string();
        let session = validatable.session();
        // Anything else the device produced is reported as the wrong format.
        let artifact = newest(session.artifacts().iter().filter(|a| has_extension(a, &extension)))
            .or_else(|| session.latest_data(Some(&format!("*.{extension}"))).pop())
            .or_else(|| newest(session.artifacts().iter()));
        let Some(artifact) = artifact else {
            return Err(ServiceError::NoArtifact(name));
        };
        check_minimal(&name, &artifact, &extension)?;

        match validatable.full_validation(&artifact).await {
            None => debug!(device = %name, path = %artifact.path.display(), "Full validation unavailable"),
            Some(Ok(())) => debug!(device = %name, path = %artifact.path.display(), "Full validation passed"),
            Some(Err(err)) => warn!(
                device = %name,
                path = %artifact.path.display(),
                error = %err,
                "Full validation failed; minimal checks passed"
            ),
        }
        info!(device = %name, path = %artifact.path.display(), "Validated");
        self.state = LifecycleState::Validated;
        Ok(())
    }

    /// Runs `body` inside a recording: starts, then guarantees a stop on every
    /// exit from `body`, including a panic.
    ///
    /// The body's error or panic is re-raised after stop. A stop failure on
    /// that path is logged and does not replace the original error.
    pub async fn run_recording<T, F>(&mut self, body: F) -> AppResult<T>
    where
        T: Send,
        F: for<'a> FnOnce(&'a mut Lifecycle) -> BoxFuture<'a, AppResult<T>> + Send,
    {
        self.start().await?;
        let outcome = AssertUnwindSafe(body(&mut *self)).catch_unwind().await;
        let failed = !matches!(outcome, Ok(Ok(_)));
        let stopped = self.stop().await;
        if failed {
            if let Err(stop_err) = &stopped {
                warn!(device = %self.name(), error = %stop_err, "Stop failed after an error");
            }
            self.state = LifecycleState::Error;
        }
        match outcome {
            Ok(Ok(value)) => stopped.map(|()| value),
            Ok(Err(err)) => Err(err),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// The canonical acceptance check for a device integration.
    ///
    /// `initialize → test → start → settle → verify → pretest duration → stop →
    /// finalize → validate`, with the stop guaranteed.
    pub async fn pretest(&mut self) -> AppResult<()> {
        let span = info_span!("pretest", device = %self.name());
        async {
            info!("Starting pretest");
            self.initialize().await?;
            self.test().await?;
            let settle = self.timing.settle;
            let duration = self.session().profile.pretest_duration;
            self.run_recording(move |lifecycle| {
                Box::pin(async move {
                    tokio::time::sleep(settle).await;
                    lifecycle.verify().await?;
                    tokio::time::sleep(duration).await;
                    Ok(())
                })
            })
            .await?;
            let finalized = self.finalize().await?;
            if finalized.timed_out {
                warn!("Pretest finalize timed out");
            }
            self.validate().await?;
            info!("Pretest complete");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Stops a running recording and drops the connection.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        let mut result = Ok(());
        if self.session().initialized_at().is_some() && self.is_started().await.unwrap_or(false) {
            result = self.stop().await;
        }
        self.device.teardown();
        debug!(device = %self.name(), "Shut down");
        result
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("device", &self.name())
            .field("state", &self.state)
            .field("timing", &self.timing)
            .finish()
    }
}

fn has_extension(artifact: &Artifact, extension: &str) -> bool {
    artifact
        .path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
}

fn newest<'a>(artifacts: impl Iterator<Item = &'a Artifact>) -> Option<Artifact> {
    artifacts.max_by(|a, b| a.timestamp.cmp(&b.timestamp)).cloned()
}

fn check_minimal(device: &str, artifact: &Artifact, extension: &str) -> AppResult<()> {
    let meta = std::fs::metadata(&artifact.path)
        .map_err(|_| ServiceError::NoArtifact(device.to_string()))?;
    if meta.len() == 0 {
        return Err(ServiceError::EmptyArtifact(artifact.path.clone()));
    }
    if !has_extension(artifact, extension) {
        return Err(ServiceError::WrongFormat {
            path: artifact.path.clone(),
            expected: extension.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::capabilities::{
        Finalizable, Recorder, Startable, Stoppable, Testable, Validatable, Verifiable,
    };
    use crate::device::state::{Coarse, DeviceState};
    use crate::lifecycle::locator::FileTime;
    use async_trait::async_trait;
    use std::io;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;
    use tempfile::TempDir;

    struct FixedDisk(f64);

    impl DiskSpace for FixedDisk {
        fn free_gb(&self, _path: &Path) -> io::Result<f64> {
            Ok(self.0)
        }
    }

    #[derive(Default, Clone)]
    struct Counters {
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    struct Rig {
        session: Session,
        counters: Counters,
        recording: bool,
        busy_polls: u32,
        busy_after_stop: u32,
        never_ready: bool,
        output: &'static [u8],
    }

    impl Rig {
        fn new(root: &Path, counters: Counters) -> Self {
            Self {
                session: Session::new("Rig")
                    .with_data_root(root)
                    .with_raw_suffix(".dat")
                    .with_file_time(FileTime::Modified),
                counters,
                recording: false,
                busy_polls: 0,
                busy_after_stop: 0,
                never_ready: false,
                output: b"samples",
            }
        }
    }

    #[async_trait]
    impl Device for Rig {
        fn session(&self) -> &Session {
            &self.session
        }

        fn session_mut(&mut self) -> &mut Session {
            &mut self.session
        }

        async fn state(&mut self) -> AppResult<DeviceState> {
            Ok(if self.recording {
                DeviceState::status(Coarse::Busy, "RECORDING")
            } else if self.never_ready || self.busy_polls > 0 {
                DeviceState::status(Coarse::Busy, "")
            } else {
                DeviceState::ready()
            })
        }

        async fn is_connected(&mut self) -> bool {
            true
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

    impl Testable for Rig {}
    impl Recorder for Rig {}

    #[async_trait]
    impl Startable for Rig {
        async fn is_started(&mut self) -> AppResult<bool> {
            Ok(self.recording)
        }

        async fn is_ready_to_start(&mut self) -> AppResult<bool> {
            if self.busy_polls > 0 {
                self.busy_polls -= 1;
                return Ok(false);
            }
            Ok(!self.recording && !self.never_ready)
        }

        async fn start(&mut self) -> AppResult<()> {
            self.counters.starts.fetch_add(1, Ordering::SeqCst);
            self.recording = true;
            let root = self.session.data_root().map(Path::to_path_buf).unwrap_or_default();
            let file = std::fs::File::create(root.join("run.dat"))?;
            std::io::Write::write_all(&mut &file, self.output)?;
            file.set_modified(SystemTime::now())?;
            Ok(())
        }
    }

    #[async_trait]
    impl Stoppable for Rig {
        async fn stop(&mut self) -> AppResult<()> {
            self.counters.stops.fetch_add(1, Ordering::SeqCst);
            self.recording = false;
            self.busy_polls = self.busy_after_stop;
            Ok(())
        }
    }

    #[async_trait]
    impl Verifiable for Rig {
        async fn verify(&mut self) -> AppResult<()> {
            match self.session.latest_data(None).is_empty() {
                true => Err(ServiceError::NoEvidence {
                    device: "Rig".into(),
                    reason: "no file".into(),
                }),
                false => Ok(()),
            }
        }
    }

    impl Finalizable for Rig {
        fn artifact_patterns(&self) -> Vec<String> {
            vec!["*.dat".to_string()]
        }
    }

    impl Validatable for Rig {
        fn expected_extension(&self) -> &str {
            "dat"
        }
    }

    fn lifecycle(rig: Rig, free_gb: f64) -> Lifecycle {
        Lifecycle::new(Box::new(rig)).with_disk_space(Arc::new(FixedDisk(free_gb)))
    }

    #[tokio::test(start_paused = true)]
    async fn steps_require_initialize() {
        let dir = TempDir::new().unwrap();
        let mut lc = lifecycle(Rig::new(dir.path(), Counters::default()), 100.0);
        let err = lc.start().await.unwrap_err();
        assert!(matches!(err, ServiceError::NotInitialized(_)));
        assert_eq!(lc.state(), LifecycleState::Error);
        assert!(lc.session().last_error().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn start_requires_a_passing_test() {
        let dir = TempDir::new().unwrap();
        let counters = Counters::default();
        let mut lc = lifecycle(Rig::new(dir.path(), counters.clone()), 100.0);
        lc.initialize().await.unwrap();
        assert!(matches!(lc.start().await, Err(ServiceError::Test(_))));
        assert_eq!(counters.starts.load(Ordering::SeqCst), 0);

        lc.test().await.unwrap();
        assert_eq!(lc.state(), LifecycleState::Tested);
        lc.start().await.unwrap();
        assert_eq!(lc.state(), LifecycleState::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn insufficient_disk_fails_test() {
        let dir = TempDir::new().unwrap();
        let mut lc = lifecycle(Rig::new(dir.path(), Counters::default()), 5.9);
        assert_eq!(lc.required_disk_gb(), 6.0);
        lc.initialize().await.unwrap();
        let err = lc.test().await.unwrap_err();
        assert!(matches!(err, ServiceError::Test(_)));
        assert!(lc.session().last_error().unwrap().contains("6 GB"));

        let mut lc = lifecycle(Rig::new(dir.path(), Counters::default()), 6.1);
        lc.initialize().await.unwrap();
        lc.test().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn full_cycle_collects_and_validates() {
        let dir = TempDir::new().unwrap();
        let counters = Counters::default();
        let mut rig = Rig::new(dir.path(), counters.clone());
        rig.busy_after_stop = 2;
        let mut lc = lifecycle(rig, 100.0);

        lc.initialize().await.unwrap();
        lc.test().await.unwrap();
        lc.start().await.unwrap();
        lc.verify().await.unwrap();
        assert_eq!(lc.state(), LifecycleState::Verified);
        lc.stop().await.unwrap();

        let finalized = lc.finalize().await.unwrap();
        assert!(!finalized.timed_out);
        assert_eq!(finalized.new_artifacts.len(), 1);
        assert_eq!(finalized.new_artifacts[0].file_name(), "run.dat");
        assert_eq!(lc.session().artifacts().len(), 1);

        // Nothing new is appended on a repeated finalize.
        assert!(lc.finalize().await.unwrap().new_artifacts.is_empty());

        lc.validate().await.unwrap();
        assert_eq!(lc.state(), LifecycleState::Validated);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn second_start_is_a_warning_no_op() {
        let dir = TempDir::new().unwrap();
        let counters = Counters::default();
        let mut lc = lifecycle(Rig::new(dir.path(), counters.clone()), 100.0);
        lc.initialize().await.unwrap();
        lc.test().await.unwrap();
        lc.start().await.unwrap();
        lc.start().await.unwrap();
        assert_eq!(counters.starts.load(Ordering::SeqCst), 1);
        assert!(lc.is_started().await.unwrap());
        assert!(logs_contain("Rig already started"));
    }

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn finalize_timeout_is_reported_not_raised() {
        let dir = TempDir::new().unwrap();
        let mut rig = Rig::new(dir.path(), Counters::default());
        rig.busy_after_stop = u32::MAX;
        let mut lc = lifecycle(rig, 100.0);
        lc.initialize().await.unwrap();
        lc.test().await.unwrap();
        lc.start().await.unwrap();
        let begin = tokio::time::Instant::now();
        let finalized = lc.finalize().await.unwrap();
        assert!(finalized.timed_out);
        assert!(finalized.new_artifacts.is_empty());
        assert_eq!(begin.elapsed(), Duration::from_secs(10));
        assert!(logs_contain("Timed out waiting for Rig to finish processing"));
    }

    #[tokio::test(start_paused = true)]
    async fn validate_without_artifacts_fails() {
        let dir = TempDir::new().unwrap();
        let mut lc = lifecycle(Rig::new(dir.path(), Counters::default()), 100.0);
        lc.initialize().await.unwrap();
        let err = lc.validate().await.unwrap_err();
        assert!(matches!(err, ServiceError::NoArtifact(_)));
        assert!(err.is_assertion());
    }

    #[tokio::test(start_paused = true)]
    async fn validate_rejects_empty_output() {
        let dir = TempDir::new().unwrap();
        let mut rig = Rig::new(dir.path(), Counters::default());
        rig.output = b"";
        let mut lc = lifecycle(rig, 100.0);
        lc.initialize().await.unwrap();
        lc.test().await.unwrap();
        lc.start().await.unwrap();
        lc.finalize().await.unwrap();
        assert!(matches!(
            lc.validate().await,
            Err(ServiceError::EmptyArtifact(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn validate_reports_wrong_format() {
        let dir = TempDir::new().unwrap();
        let mut lc = lifecycle(Rig::new(dir.path(), Counters::default()), 100.0);
        lc.initialize().await.unwrap();
        let path = dir.path().join("run.bin");
        std::fs::write(&path, b"samples").unwrap();
        lc.device_mut().session_mut().append_artifacts(vec![Artifact {
            path: path.clone(),
            timestamp: Utc::now(),
            size: 7,
        }]);

        let err = lc.validate().await.unwrap_err();
        assert!(
            matches!(err, ServiceError::WrongFormat { path: ref p, ref expected } if *p == path && expected == "dat"),
            "{err}"
        );
        assert_eq!(lc.state(), LifecycleState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn validate_finalizes_a_busy_device_first() {
        let dir = TempDir::new().unwrap();
        let mut rig = Rig::new(dir.path(), Counters::default());
        rig.busy_after_stop = 2;
        let mut lc = lifecycle(rig, 100.0);
        lc.initialize().await.unwrap();
        lc.test().await.unwrap();
        lc.start().await.unwrap();
        lc.stop().await.unwrap();
        assert!(lc.session().artifacts().is_empty());

        lc.validate().await.unwrap();
        assert_eq!(lc.session().artifacts().len(), 1);
        assert_eq!(lc.session().artifacts()[0].file_name(), "run.dat");
        assert_eq!(lc.state(), LifecycleState::Validated);
    }

    #[tokio::test(start_paused = true)]
    async fn recording_scope_stops_and_propagates_errors() {
        let dir = TempDir::new().unwrap();
        let counters = Counters::default();
        let mut lc = lifecycle(Rig::new(dir.path(), counters.clone()), 100.0);
        lc.initialize().await.unwrap();
        lc.test().await.unwrap();
        let result: AppResult<()> = lc
            .run_recording(|_| {
                Box::pin(async {
                    Err(ServiceError::NoEvidence {
                        device: "Rig".into(),
                        reason: "flat".into(),
                    })
                })
            })
            .await;
        assert!(matches!(result, Err(ServiceError::NoEvidence { .. })));
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
        assert!(!lc.is_started().await.unwrap());
        assert_eq!(lc.state(), LifecycleState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn recording_scope_stops_on_panic() {
        let dir = TempDir::new().unwrap();
        let counters = Counters::default();
        let mut lc = lifecycle(Rig::new(dir.path(), counters.clone()), 100.0);
        lc.initialize().await.unwrap();
        lc.test().await.unwrap();
        let starts = counters.starts.clone();
        let outcome = AssertUnwindSafe(lc.run_recording(move |_| {
            Box::pin(async move {
                if starts.load(Ordering::SeqCst) == 1 {
                    panic!("body blew up");
                }
                Ok::<(), ServiceError>(())
            })
        }))
        .catch_unwind()
        .await;
        assert!(outcome.is_err());
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn initialize_tolerates_a_stuck_device() {
        let dir = TempDir::new().unwrap();
        let mut rig = Rig::new(dir.path(), Counters::default());
        rig.never_ready = true;
        let mut lc = lifecycle(rig, 100.0);
        lc.initialize().await.unwrap();
        assert_eq!(lc.state(), LifecycleState::Initialized);
        assert!(logs_contain("Not ready to start after initialize"));
    }

    #[tokio::test(start_paused = true)]
    async fn pretest_runs_the_whole_sequence() {
        let dir = TempDir::new().unwrap();
        let counters = Counters::default();
        let mut lc = lifecycle(Rig::new(dir.path(), counters.clone()), 100.0);
        lc.pretest().await.unwrap();
        assert_eq!(lc.state(), LifecycleState::Validated);
        assert_eq!(counters.starts.load(Ordering::SeqCst), 1);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
    }
}

//! Local auxiliary JSON logger.
//!
//! Keeps a key/value log for a session in `{timestamp}_{label}.json` under the
//! data root. Each write merges into the existing entries. A log that no
//! longer parses is left untouched and writing continues in a `.new.json`
//! sibling. Finalize also leaves a YAML copy of each log for human readers.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::device::capabilities::{Device, Finalizable, Startable, Testable, Validatable};
use crate::device::session::{Artifact, Session};
use crate::error::{AppResult, ServiceError};
use crate::lifecycle::FileTime;

pub const LOG_EXTENSION: &str = "json";

pub struct JsonLogDevice {
    session: Session,
    label: String,
    logs: Vec<PathBuf>,
}

impl JsonLogDevice {
    /// Log timestamps are the writes themselves, so files are attributed by
    /// modification time.
    pub fn new(session: Session, label: String) -> Self {
        Self {
            session: session.with_file_time(FileTime::Modified),
            label,
            logs: Vec::new(),
        }
    }

    /// The log currently written to.
    pub fn current_log(&self) -> AppResult<&Path> {
        self.logs
            .last()
            .map(PathBuf::as_path)
            .ok_or_else(|| ServiceError::NotInitialized(self.session.name().to_string()))
    }

    /// Every log file of this session, oldest first.
    pub fn logs(&self) -> &[PathBuf] {
        &self.logs
    }

    /// Entries of the current log. An empty file has no entries.
    pub fn read(&self) -> AppResult<Map<String, Value>> {
        let path = self.current_log()?;
        let bytes = std::fs::read(path)?;
        if bytes.is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_slice::<Value>(&bytes)? {
            Value::Object(map) => Ok(map),
            other => Err(ServiceError::protocol(
                self.session.name(),
                format!("{} holds {other} rather than an object", path.display()),
            )),
        }
    }

    /// Merges `entries` into the log.
    pub fn write(&mut self, entries: Map<String, Value>) -> AppResult<()> {
        let (mut data, path) = match self.read() {
            Ok(data) => (data, self.current_log()?.to_path_buf()),
            Err(ServiceError::Json(err)) => {
                let current = self.current_log()?;
                let fresh = current.with_extension("new.json");
                warn!(
                    device = %self.session.name(),
                    log = %current.display(),
                    error = %err,
                    "Log is corrupt; continuing in a new file"
                );
                self.logs.push(fresh.clone());
                (Map::new(), fresh)
            }
            Err(err) => return Err(err),
        };
        data.extend(entries);
        std::fs::write(&path, serde_json::to_vec_pretty(&Value::Object(data))?)?;
        OpenOptions::new()
            .write(true)
            .open(&path)?
            .set_modified(SystemTime::now())?;
        debug!(device = %self.session.name(), log = %path.display(), "Wrote log entries");
        Ok(())
    }

    fn yaml_copy(&self, log: &Path) -> AppResult<Artifact> {
        let value: Value = serde_json::from_slice(&std::fs::read(log)?)?;
        let yaml = serde_yaml::to_string(&value)
            .map_err(|err| ServiceError::protocol(self.session.name(), err.to_string()))?;
        let target = log.with_extension("yaml");
        std::fs::write(&target, yaml)?;
        let meta = std::fs::metadata(&target)?;
        let timestamp: DateTime<Utc> = meta.modified()?.into();
        Ok(Artifact {
            path: target,
            timestamp,
            size: meta.len(),
        })
    }
}

#[async_trait]
impl Device for JsonLogDevice {
    fn session(&self) -> &Session {
        &self.session
    }

    fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Creates a fresh, empty log for this session.
    async fn prepare(&mut self) -> AppResult<()> {
        let root = self.session.data_root().ok_or_else(|| {
            ServiceError::Configuration(format!("{} has no data root", self.session.name()))
        })?;
        std::fs::create_dir_all(root)?;
        let stamp = Local::now().format("%Y-%m-%d_%H%M%S");
        let log = root.join(format!("{stamp}_{}.{LOG_EXTENSION}", self.label));
        OpenOptions::new().create(true).append(true).open(&log)?;
        debug!(device = %self.session.name(), log = %log.display(), "Log created");
        self.logs = vec![log];
        Ok(())
    }

    fn as_testable(&mut self) -> Option<&mut dyn Testable> {
        Some(self)
    }

    fn as_startable(&mut self) -> Option<&mut dyn Startable> {
        Some(self)
    }

    fn as_finalizable(&mut self) -> Option<&mut dyn Finalizable> {
        Some(self)
    }

    fn as_validatable(&mut self) -> Option<&mut dyn Validatable> {
        Some(self)
    }
}

#[async_trait]
impl Testable for JsonLogDevice {
    async fn self_check(&mut self) -> AppResult<()> {
        let log = self.current_log()?;
        OpenOptions::new()
            .append(true)
            .open(log)
            .map(|_| ())
            .map_err(|err| {
                ServiceError::Test(format!(
                    "{} failed to open {}: {err}",
                    self.session.name(),
                    log.display()
                ))
            })
    }
}

/// Starting records the start time; there is nothing to stop.
#[async_trait]
impl Startable for JsonLogDevice {
    async fn is_started(&mut self) -> AppResult<bool> {
        Ok(false)
    }

    async fn is_ready_to_start(&mut self) -> AppResult<bool> {
        Ok(true)
    }

    async fn start(&mut self) -> AppResult<()> {
        let mut entry = Map::new();
        entry.insert("start_time".to_string(), json!(Utc::now().to_rfc3339()));
        self.write(entry)
    }
}

#[async_trait]
impl Finalizable for JsonLogDevice {
    fn artifact_patterns(&self) -> Vec<String> {
        self.logs
            .iter()
            .filter_map(|log| log.file_name())
            .map(|name| glob::Pattern::escape(&name.to_string_lossy()))
            .collect()
    }

    async fn collect(&mut self, found: Vec<Artifact>) -> AppResult<Vec<Artifact>> {
        let mut collected = Vec::with_capacity(found.len() * 2);
        for artifact in found {
            match self.yaml_copy(&artifact.path) {
                Ok(copy) => {
                    collected.push(artifact);
                    collected.push(copy);
                }
                Err(err) => {
                    warn!(
                        device = %self.session.name(),
                        log = %artifact.path.display(),
                        error = %err,
                        "YAML copy failed"
                    );
                    collected.push(artifact);
                }
            }
        }
        Ok(collected)
    }
}

#[async_trait]
impl Validatable for JsonLogDevice {
    fn expected_extension(&self) -> &str {
        LOG_EXTENSION
    }

    async fn full_validation(&mut self, _artifact: &Artifact) -> Option<AppResult<()>> {
        let result = self.read().and_then(|entries| {
            if entries.is_empty() {
                Err(ServiceError::Test(format!(
                    "{} log is empty: {}",
                    self.session.name(),
                    self.current_log()?.display()
                )))
            } else {
                Ok(())
            }
        });
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn prepared(dir: &TempDir) -> JsonLogDevice {
        let session = Session::new("Notes").with_data_root(dir.path());
        let mut log = JsonLogDevice::new(session, "notes".to_string());
        log.prepare().await.unwrap();
        log
    }

    fn entry(key: &str, value: Value) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(key.to_string(), value);
        map
    }

    #[tokio::test]
    async fn prepare_creates_labelled_log() {
        let dir = TempDir::new().unwrap();
        let log = prepared(&dir).await;
        let path = log.current_log().unwrap();
        assert!(path.exists());
        assert!(path.file_name().unwrap().to_string_lossy().ends_with("_notes.json"));
        assert!(log.read().unwrap().is_empty());
        assert_eq!(log.session().file_time(), FileTime::Modified);
    }

    #[tokio::test]
    async fn writes_merge_entries() {
        let dir = TempDir::new().unwrap();
        let mut log = prepared(&dir).await;
        log.write(entry("mouse_id", json!("366122"))).unwrap();
        log.write(entry("weight_g", json!(24.1))).unwrap();
        let entries = log.read().unwrap();
        assert_eq!(entries["mouse_id"], json!("366122"));
        assert_eq!(entries["weight_g"], json!(24.1));
    }

    #[tokio::test]
    async fn corrupt_log_continues_in_new_file() {
        let dir = TempDir::new().unwrap();
        let mut log = prepared(&dir).await;
        let original = log.current_log().unwrap().to_path_buf();
        std::fs::write(&original, b"{not json").unwrap();

        log.write(entry("note", json!("after corruption"))).unwrap();
        let current = log.current_log().unwrap();
        assert!(current.to_string_lossy().ends_with("_notes.new.json"));
        assert_eq!(std::fs::read(&original).unwrap(), b"{not json");
        assert_eq!(log.read().unwrap()["note"], json!("after corruption"));
        assert_eq!(log.logs().len(), 2);
    }

    #[tokio::test]
    async fn start_writes_start_time() {
        let dir = TempDir::new().unwrap();
        let mut log = prepared(&dir).await;
        assert!(!log.is_started().await.unwrap());
        Startable::start(&mut log).await.unwrap();
        assert!(log.read().unwrap().contains_key("start_time"));
    }

    #[tokio::test]
    async fn empty_log_fails_full_validation() {
        let dir = TempDir::new().unwrap();
        let mut log = prepared(&dir).await;
        let artifact = Artifact {
            path: log.current_log().unwrap().to_path_buf(),
            timestamp: Utc::now(),
            size: 0,
        };
        assert!(matches!(log.full_validation(&artifact).await, Some(Err(_))));
        log.write(entry("note", json!("x"))).unwrap();
        assert!(matches!(log.full_validation(&artifact).await, Some(Ok(()))));
    }

    #[tokio::test]
    async fn collect_adds_yaml_copy() {
        let dir = TempDir::new().unwrap();
        let mut log = prepared(&dir).await;
        log.write(entry("note", json!("x"))).unwrap();
        let path = log.current_log().unwrap().to_path_buf();
        let found = vec![Artifact {
            path: path.clone(),
            timestamp: Utc::now(),
            size: 1,
        }];
        let collected = log.collect(found).await.unwrap();
        assert_eq!(collected.len(), 2);
        let yaml = std::fs::read_to_string(path.with_extension("yaml")).unwrap();
        assert!(yaml.contains("note: x"));
    }

    #[tokio::test]
    async fn self_check_requires_a_log() {
        let dir = TempDir::new().unwrap();
        let session = Session::new("Notes").with_data_root(dir.path());
        let mut log = JsonLogDevice::new(session, "notes".to_string());
        assert!(log.self_check().await.is_err());
        log.prepare().await.unwrap();
        assert!(log.self_check().await.is_ok());
    }
}

//! Time-windowed discovery of data files.
//!
//! A recording is attributed the files that appeared in its window
//! `[start, end]`, so output left over from a previous run is never mistaken
//! for the current one. Both window ends are inclusive, and the start is
//! compared at whole-second resolution: filesystem timestamps come from a
//! coarser clock than `Utc::now()` and can read a few milliseconds behind a
//! start taken just before the file was created.

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::device::session::Artifact;

/// Longest pause between the two size samples of [`is_file_growing`].
pub const MAX_GROWTH_SAMPLE_DELAY: Duration = Duration::from_secs(20);

/// Which filesystem timestamp attributes a file to a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileTime {
    /// Birth time, falling back to modification time where the filesystem
    /// does not record one.
    #[default]
    Created,
    /// Last modification time.
    Modified,
}

impl FileTime {
    pub fn of(&self, meta: &Metadata) -> Option<DateTime<Utc>> {
        let stamp: SystemTime = match self {
            FileTime::Created => meta.created().or_else(|_| meta.modified()).ok()?,
            FileTime::Modified => meta.modified().ok()?,
        };
        Some(stamp.into())
    }
}

fn search_dir(root: &Path) -> PathBuf {
    if root.is_dir() {
        root.to_path_buf()
    } else {
        root.parent().map(Path::to_path_buf).unwrap_or_default()
    }
}

fn matching_files(root: &Path, pattern: &str) -> Vec<(PathBuf, Metadata)> {
    let dir = search_dir(root);
    let full = format!(
        "{}/{}",
        glob::Pattern::escape(&dir.to_string_lossy()),
        pattern
    );
    let entries = match glob::glob(&full) {
        Ok(paths) => paths,
        Err(err) => {
            warn!(pattern = %full, error = %err, "Invalid file pattern");
            return Vec::new();
        }
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|path| {
            let meta = std::fs::metadata(&path).ok()?;
            meta.is_file().then_some((path, meta))
        })
        .collect()
}

/// Files under `root` matching `pattern` whose timestamp lies in `[start, end]`,
/// ascending by that timestamp. `start` is truncated to the whole second.
///
/// If `root` is a file, its parent directory is searched. An inaccessible root
/// or an empty window yields an empty result.
pub fn find_files(
    root: &Path,
    pattern: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    file_time: FileTime,
) -> Vec<Artifact> {
    let start = start.trunc_subsecs(0);
    let mut found: Vec<Artifact> = matching_files(root, pattern)
        .into_iter()
        .filter_map(|(path, meta)| {
            let timestamp = file_time.of(&meta)?;
            (start <= timestamp && timestamp <= end).then(|| Artifact {
                path,
                timestamp,
                size: meta.len(),
            })
        })
        .collect();
    found.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.path.cmp(&b.path)));
    debug!(
        root = %root.display(),
        pattern,
        count = found.len(),
        "Located files in recording window"
    );
    found
}

/// The most recently modified file under `root` matching `pattern`.
pub fn latest_file(root: &Path, pattern: &str) -> Option<Artifact> {
    matching_files(root, pattern)
        .into_iter()
        .filter_map(|(path, meta)| {
            let modified: DateTime<Utc> = meta.modified().ok()?.into();
            Some(Artifact {
                path,
                timestamp: modified,
                size: meta.len(),
            })
        })
        .max_by(|a, b| a.timestamp.cmp(&b.timestamp))
}

/// Pause between size samples for a file of `size` bytes.
///
/// Large files are appended in larger, rarer chunks, so the wait grows with
/// `log10(size)`.
pub fn growth_sample_delay(size: u64, scale: f64) -> Duration {
    let secs = scale * (size.max(10) as f64).log10();
    Duration::from_secs_f64(secs.max(0.0)).min(MAX_GROWTH_SAMPLE_DELAY)
}

/// True if `path` grew between two samples taken [`growth_sample_delay`] apart.
pub async fn is_file_growing(path: &Path, scale: f64) -> std::io::Result<bool> {
    let size_0 = std::fs::metadata(path)?.len();
    let delay = growth_sample_delay(size_0, scale);
    debug!(path = %path.display(), size = size_0, ?delay, "Sampling file growth");
    tokio::time::sleep(delay).await;
    let size_1 = std::fs::metadata(path)?.len();
    Ok(size_1 != size_0)
}

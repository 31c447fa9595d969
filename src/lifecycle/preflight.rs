//! Disk capacity preflight for recording devices.
//!
//! A recorder may only start once its data target can hold a full minimum-length
//! session at the device's recording rate. The check is read-only and safe to
//! repeat; it fails closed when the data root cannot be inspected.

use std::io;
use std::path::Path;

use sysinfo::Disks;
use tracing::debug;

use crate::device::session::round_tenth;

/// Reports free space for a filesystem location.
pub trait DiskSpace: Send + Sync {
    /// Free space at `path` in GB, to 0.1 GB.
    fn free_gb(&self, path: &Path) -> io::Result<f64>;
}

/// Free space from the mounted disks reported by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDisks;

impl DiskSpace for SystemDisks {
    fn free_gb(&self, path: &Path) -> io::Result<f64> {
        let path = path.canonicalize()?;
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no mounted disk holds {}", path.display()),
                )
            })?;
        Ok(round_tenth(disk.available_space() as f64 / 1e9))
    }
}

/// Outcome of a disk preflight.
#[derive(Debug, Clone, PartialEq)]
pub enum DiskCheck {
    /// The device records nothing, so there is nothing to check.
    NotRequired,
    Sufficient { free_gb: f64, required_gb: f64 },
    Insufficient { free_gb: f64, required_gb: f64 },
    Inaccessible { required_gb: f64, reason: String },
}

impl DiskCheck {
    pub fn is_ok(&self) -> bool {
        matches!(self, DiskCheck::NotRequired | DiskCheck::Sufficient { .. })
    }
}

/// Compares live free space at `data_root` against `required_gb`.
///
/// Passes only when strictly more space is free than required.
pub fn check_disk_space(disks: &dyn DiskSpace, data_root: Option<&Path>, required_gb: f64) -> DiskCheck {
    if required_gb == 0.0 {
        return DiskCheck::NotRequired;
    }
    let Some(root) = data_root else {
        return DiskCheck::Inaccessible {
            required_gb,
            reason: "no data root configured".to_string(),
        };
    };
    match disks.free_gb(root) {
        Ok(free_gb) => {
            debug!(root = %root.display(), free_gb, required_gb, "Free disk space");
            if free_gb > required_gb {
                DiskCheck::Sufficient {
                    free_gb,
                    required_gb,
                }
            } else {
                DiskCheck::Insufficient {
                    free_gb,
                    required_gb,
                }
            }
        }
        Err(err) => DiskCheck::Inaccessible {
            required_gb,
            reason: format!("data path not accessible: {}: {err}", root.display()),
        },
    }
}

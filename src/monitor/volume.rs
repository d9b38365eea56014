//! Volume domain types and the enumeration seam.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::device::{DeviceIdentity, VolumeSerial};

/// Drive class as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    Fixed,
    Removable,
    Network,
    Optical,
    Unknown,
}

impl VolumeKind {
    /// Only local block media can carry a directive worth evaluating.
    pub fn is_local_disk(self) -> bool {
        matches!(self, VolumeKind::Fixed | VolumeKind::Removable)
    }
}

impl fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VolumeKind::Fixed => "fixed",
            VolumeKind::Removable => "removable",
            VolumeKind::Network => "network",
            VolumeKind::Optical => "optical",
            VolumeKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One mounted volume from an enumeration pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub mount_path: PathBuf,
    pub serial: VolumeSerial,
    pub kind: VolumeKind,
    /// Filesystem type, e.g. `vfat`.
    pub fs_type: String,
    /// Backing device or remote spec, e.g. `/dev/sdb1`.
    pub device: String,
    pub label: Option<String>,
}

impl Volume {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.serial, self.mount_path.clone())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("volume enumeration is not supported on this platform")]
    Unsupported,

    #[error("no mounted volume contains {0}")]
    NotMounted(PathBuf),
}

/// Source of the host's currently mounted volumes.
#[cfg_attr(test, mockall::automock)]
pub trait VolumeSource: Send + Sync {
    fn enumerate(&self) -> Result<Vec<Volume>, VolumeError>;
}

/// Platforms without an enumeration backend.
pub struct UnsupportedSource;

impl VolumeSource for UnsupportedSource {
    fn enumerate(&self) -> Result<Vec<Volume>, VolumeError> {
        Err(VolumeError::Unsupported)
    }
}

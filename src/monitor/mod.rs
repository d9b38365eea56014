//! Drive monitor - turns periodic volume enumeration into attach events.

#[cfg(target_os = "linux")]
mod linux;
mod volume;

#[cfg(target_os = "linux")]
pub use linux::LinuxVolumeSource;
pub use volume::{UnsupportedSource, Volume, VolumeError, VolumeKind, VolumeSource};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::device::DeviceIdentity;

/// The enumeration backend for this host.
pub fn platform_source() -> Arc<dyn VolumeSource> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(LinuxVolumeSource::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(UnsupportedSource)
    }
}

/// Identity for a directory on some mounted volume: the serial of the
/// deepest mount containing `root`, with `root` itself as the mount path.
/// Any volume kind qualifies.
pub fn identify_root(
    source: &dyn VolumeSource,
    root: &Path,
) -> Result<DeviceIdentity, VolumeError> {
    source
        .enumerate()?
        .into_iter()
        .filter(|v| root.starts_with(&v.mount_path))
        .max_by_key(|v| v.mount_path.components().count())
        .map(|v| DeviceIdentity::new(v.serial, root))
        .ok_or_else(|| VolumeError::NotMounted(root.to_path_buf()))
}

pub struct DriveMonitor {
    source: Arc<dyn VolumeSource>,
    ignore_mounts: Vec<PathBuf>,
    include_fixed: bool,
    /// Identities present in the last successful pass.
    tracked: Mutex<HashSet<DeviceIdentity>>,
}

impl DriveMonitor {
    pub fn new(source: Arc<dyn VolumeSource>, config: &MonitorConfig) -> Self {
        Self {
            source,
            ignore_mounts: config.ignore_mounts.iter().map(PathBuf::from).collect(),
            include_fixed: config.include_fixed,
            tracked: Mutex::new(HashSet::new()),
        }
    }

    /// Volumes that may carry a directive: fixed or removable local disks,
    /// minus ignored mount points.
    pub fn eligible_volumes(&self) -> Result<Vec<Volume>, VolumeError> {
        let volumes = self.source.enumerate()?;
        Ok(volumes
            .into_iter()
            .filter(|v| v.kind.is_local_disk())
            .filter(|v| v.kind == VolumeKind::Removable || self.include_fixed)
            .filter(|v| !self.ignore_mounts.contains(&v.mount_path))
            .collect())
    }

    /// One enumeration pass. Returns identities not seen in the previous
    /// pass and forgets identities that have disappeared, so a reinserted
    /// device attaches again. On error the tracked set is left untouched.
    pub fn poll(&self) -> Result<Vec<DeviceIdentity>, VolumeError> {
        let current: HashSet<DeviceIdentity> = self
            .eligible_volumes()?
            .iter()
            .map(Volume::identity)
            .collect();

        let mut tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());

        for gone in tracked.difference(&current) {
            debug!("Device detached: {}", gone);
        }
        tracked.retain(|id| current.contains(id));

        let mut attached: Vec<DeviceIdentity> = current
            .into_iter()
            .filter(|id| tracked.insert(id.clone()))
            .collect();
        attached.sort();

        for id in &attached {
            info!("Device attached: {}", id);
        }
        Ok(attached)
    }

    /// Currently tracked identities, sorted.
    pub fn tracked(&self) -> Vec<DeviceIdentity> {
        let tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<DeviceIdentity> = tracked.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Poll forever: immediately, then every `interval`. `on_attach` runs
    /// once per newly seen identity. There is no stop signal; callers stop
    /// the loop by dropping the future.
    pub async fn run<F>(&self, interval: Duration, mut on_attach: F)
    where
        F: FnMut(DeviceIdentity),
    {
        info!("Starting drive monitor with interval: {:?}", interval);

        loop {
            match self.poll() {
                Ok(attached) => attached.into_iter().for_each(&mut on_attach),
                Err(e) => warn!("Volume enumeration failed: {}", e),
            }
            sleep(interval).await;
        }
    }
}

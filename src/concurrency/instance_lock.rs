//! Single-instance monitor lock using advisory file locking (fs2 flock).
//!
//! Two monitors on one host would both see every attach and prompt twice
//! for the same device, so `monitor` and `daemon start` refuse to run
//! while another process holds this lock.

use anyhow::Result;
use fs2::FileExt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Advisory file lock held for the lifetime of a monitor.
///
/// Lock file lives at `<runtime_dir>/monitor.lock` (state dir fallback).
#[derive(Clone)]
pub struct InstanceLock {
    path: PathBuf,
}

/// RAII guard that releases the lock on drop.
pub struct InstanceLockGuard {
    file: File,
}

impl Drop for InstanceLockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl InstanceLock {
    pub fn new(paths: &crate::paths::Paths) -> Result<Self> {
        Self::at(paths.instance_lock())
    }

    pub fn at(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Non-blocking try-acquire; `None` if another process holds it.
    /// The holder's pid is written into the lock file for diagnostics.
    pub fn try_acquire(&self) -> Result<Option<InstanceLockGuard>> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                file.set_len(0)?;
                writeln!(file, "{}", std::process::id())?;
                Ok(Some(InstanceLockGuard { file }))
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            #[cfg(unix)]
            Err(ref e) if e.raw_os_error() == Some(35) || e.raw_os_error() == Some(11) => {
                // EAGAIN(11) / EWOULDBLOCK(35 on macOS) - lock contention
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Pid recorded by the current holder, if the file names one.
    pub fn holder_pid(&self) -> Option<u32> {
        fs::read_to_string(&self.path).ok()?.trim().parse().ok()
    }
}

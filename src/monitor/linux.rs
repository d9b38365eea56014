//! Linux volume enumeration from `/proc/self/mountinfo`.
//!
//! Drive class comes from the filesystem type, refined for block
//! filesystems by the sysfs `removable` attribute (or a USB parent).
//! The serial is the filesystem UUID from `/dev/disk/by-uuid` (the FAT
//! volume serial verbatim, longer UUIDs folded to 32 bits), falling back
//! to the folded `statvfs` filesystem id.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::volume::{Volume, VolumeError, VolumeKind, VolumeSource};
use crate::device::VolumeSerial;

const NETWORK_FS: &[&str] = &[
    "nfs",
    "nfs4",
    "cifs",
    "smb3",
    "smbfs",
    "sshfs",
    "fuse.sshfs",
    "9p",
    "afs",
    "ceph",
    "glusterfs",
    "davfs",
    "fuse.rclone",
];

const OPTICAL_FS: &[&str] = &["iso9660", "udf"];

const BLOCK_FS: &[&str] = &[
    "ext2", "ext3", "ext4", "xfs", "btrfs", "vfat", "msdos", "exfat", "ntfs", "ntfs3", "fuseblk",
    "f2fs", "hfs", "hfsplus", "jfs", "reiserfs", "nilfs2",
];

/// One parsed mountinfo line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MountEntry {
    /// `major:minor` of the backing device.
    dev: String,
    mount_point: PathBuf,
    fs_type: String,
    source: String,
}

pub struct LinuxVolumeSource {
    mountinfo: PathBuf,
    sys_dev_block: PathBuf,
    disk_dir: PathBuf,
}

impl LinuxVolumeSource {
    pub fn new() -> Self {
        Self::with_roots("/proc/self/mountinfo", "/sys/dev/block", "/dev/disk")
    }

    pub fn with_roots(
        mountinfo: impl Into<PathBuf>,
        sys_dev_block: impl Into<PathBuf>,
        disk_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            mountinfo: mountinfo.into(),
            sys_dev_block: sys_dev_block.into(),
            disk_dir: disk_dir.into(),
        }
    }

    fn classify(&self, entry: &MountEntry) -> VolumeKind {
        let fs_type = entry.fs_type.as_str();
        if NETWORK_FS.contains(&fs_type) {
            VolumeKind::Network
        } else if OPTICAL_FS.contains(&fs_type) {
            VolumeKind::Optical
        } else if BLOCK_FS.contains(&fs_type) && entry.source.starts_with('/') {
            if self.is_removable(&entry.dev) {
                VolumeKind::Removable
            } else {
                VolumeKind::Fixed
            }
        } else {
            VolumeKind::Unknown
        }
    }

    fn is_removable(&self, dev: &str) -> bool {
        let Ok(real) = fs::canonicalize(self.sys_dev_block.join(dev)) else {
            return false;
        };
        if real.components().any(|c| {
            c.as_os_str()
                .to_str()
                .is_some_and(|s| s.starts_with("usb"))
        }) {
            return true;
        }
        // Partitions carry no `removable`; the whole-disk parent does
        let candidates = [
            Some(real.join("removable")),
            real.parent().map(|p| p.join("removable")),
        ];
        candidates
            .into_iter()
            .flatten()
            .filter_map(|p| fs::read_to_string(p).ok())
            .any(|v| v.trim() == "1")
    }
}

impl Default for LinuxVolumeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeSource for LinuxVolumeSource {
    fn enumerate(&self) -> Result<Vec<Volume>, VolumeError> {
        let content = fs::read_to_string(&self.mountinfo).map_err(|source| VolumeError::Read {
            path: self.mountinfo.clone(),
            source,
        })?;

        let uuids = link_targets(&self.disk_dir.join("by-uuid"));
        let labels = link_targets(&self.disk_dir.join("by-label"));

        let mut volumes = Vec::new();
        for entry in parse_mountinfo(&content) {
            let kind = self.classify(&entry);
            let device_key = canonical_or_raw(Path::new(&entry.source));

            let serial = match uuids.get(&device_key).and_then(|u| serial_from_uuid(u)) {
                Some(serial) => serial,
                None => match fsid_serial(&entry.mount_point) {
                    Some(serial) => serial,
                    None => {
                        debug!("Skipping unreachable mount {:?}", entry.mount_point);
                        continue;
                    }
                },
            };

            volumes.push(Volume {
                mount_path: entry.mount_point,
                serial,
                kind,
                fs_type: entry.fs_type,
                device: entry.source,
                label: labels.get(&device_key).cloned(),
            });
        }
        Ok(volumes)
    }
}

/// Parse `/proc/<pid>/mountinfo`. Malformed lines are skipped.
///
/// `36 35 98:0 /mnt1 /mnt/parent rw,noatime master:1 - ext3 /dev/root rw`
fn parse_mountinfo(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let (pre, post) = line.split_once(" - ")?;
            let pre: Vec<&str> = pre.split_whitespace().collect();
            let mut post = post.split_whitespace();
            if pre.len() < 5 {
                return None;
            }
            Some(MountEntry {
                dev: pre[2].to_string(),
                mount_point: PathBuf::from(unescape_octal(pre[4])),
                fs_type: post.next()?.to_string(),
                source: unescape_octal(post.next()?),
            })
        })
        .collect()
}

/// Decode the kernel's `\ooo` escapes (space, tab, newline, backslash).
fn unescape_octal(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 4 <= bytes.len()
            && let Some(code) = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok())
        {
            out.push(code);
            i += 4;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Decode udev's `\xNN` escapes in `/dev/disk/by-*` names.
fn unescape_hex(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && bytes.get(i + 1) == Some(&b'x')
            && i + 4 <= bytes.len()
            && let Some(code) = std::str::from_utf8(&bytes[i + 2..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 16).ok())
        {
            out.push(code);
            i += 4;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Map resolved device node → decoded link name for a `/dev/disk/by-*` dir.
fn link_targets(dir: &Path) -> HashMap<PathBuf, String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return HashMap::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let target = fs::canonicalize(e.path()).ok()?;
            let name = e.file_name().to_str().map(unescape_hex)?;
            Some((target, name))
        })
        .collect()
}

fn canonical_or_raw(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// `1A2B-3C4D` is a FAT serial and maps verbatim; longer UUIDs are folded
/// 32 bits at a time.
fn serial_from_uuid(uuid: &str) -> Option<VolumeSerial> {
    let hex: String = uuid.chars().filter(|c| *c != '-').collect();
    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let folded = hex
        .as_bytes()
        .chunks(8)
        .filter_map(|chunk| std::str::from_utf8(chunk).ok())
        .filter_map(|chunk| u32::from_str_radix(chunk, 16).ok())
        .fold(0u32, |acc, part| acc ^ part);
    Some(VolumeSerial(folded))
}

fn fsid_serial(mount_point: &Path) -> Option<VolumeSerial> {
    nix::sys::statvfs::statvfs(mount_point)
        .ok()
        .map(|s| VolumeSerial::from_fsid(s.filesystem_id() as u64))
}

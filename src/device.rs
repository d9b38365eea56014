//! Physical volume identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Filesystem-reported volume serial number.
///
/// Opaque 32-bit value and the only durable identity of a device: two
/// distinct volumes sharing a serial are indistinguishable to the trust
/// store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeSerial(pub u32);

impl VolumeSerial {
    /// Fixed-width uppercase hex, the trust store key format.
    pub fn key(&self) -> String {
        format!("{:08X}", self.0)
    }

    /// Parse a key produced by [`VolumeSerial::key`] (case-insensitive).
    pub fn parse(key: &str) -> Option<Self> {
        let key = key.trim();
        if key.is_empty() || key.len() > 8 || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u32::from_str_radix(key, 16).ok().map(Self)
    }

    /// Fold a wider filesystem id into 32 bits.
    pub fn from_fsid(fsid: u64) -> Self {
        Self((fsid ^ (fsid >> 32)) as u32)
    }
}

impl fmt::Display for VolumeSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// A volume as currently mounted: durable serial plus current mount path.
///
/// The mount path may differ across reinsertions; trust lookups use the
/// serial alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub serial: VolumeSerial,
    pub mount_path: PathBuf,
}

impl DeviceIdentity {
    pub fn new(serial: VolumeSerial, mount_path: impl Into<PathBuf>) -> Self {
        Self {
            serial,
            mount_path: mount_path.into(),
        }
    }

    /// Trust store key.
    pub fn key(&self) -> String {
        self.serial.key()
    }

    pub fn root(&self) -> &Path {
        &self.mount_path
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.mount_path.display(), self.serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_fixed_width_uppercase_hex() {
        assert_eq!(VolumeSerial(0xab).key(), "000000AB");
        assert_eq!(VolumeSerial(0xDEADBEEF).key(), "DEADBEEF");
    }

    #[test]
    fn parse_accepts_keys_in_any_case() {
        assert_eq!(VolumeSerial::parse("deadbeef"), Some(VolumeSerial(0xDEADBEEF)));
        assert_eq!(VolumeSerial::parse("000000AB"), Some(VolumeSerial(0xAB)));
        assert_eq!(VolumeSerial::parse("123456789"), None);
        assert_eq!(VolumeSerial::parse("xyz"), None);
        assert_eq!(VolumeSerial::parse(""), None);
    }

    #[test]
    fn parse_rejects_signs_and_non_hex() {
        assert_eq!(VolumeSerial::parse("+1"), None);
        assert_eq!(VolumeSerial::parse("-1"), None);
        assert_eq!(VolumeSerial::parse("+0000001"), None);
        assert_eq!(VolumeSerial::parse("12 34"), None);
        assert_eq!(VolumeSerial::parse("0x12"), None);
    }

    #[test]
    fn fsid_fold_mixes_both_halves() {
        let a = VolumeSerial::from_fsid(0x0000_0001_0000_0000);
        let b = VolumeSerial::from_fsid(0x0000_0000_0000_0001);
        assert_eq!(a, b);
        assert_ne!(VolumeSerial::from_fsid(0x1234_5678_0000_0000), VolumeSerial(0));
    }

    #[test]
    fn same_serial_different_mount_are_distinct_identities() {
        let a = DeviceIdentity::new(VolumeSerial(7), "/media/a");
        let b = DeviceIdentity::new(VolumeSerial(7), "/media/b");
        assert_ne!(a, b);
        assert_eq!(a.key(), b.key());
    }
}

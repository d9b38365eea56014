//! Trust store - durable per-device decisions in `trust_store.json`.
//!
//! The whole map is loaded at startup and rewritten (temp file + rename) on
//! every mutation. Every operation first re-reads the file if it changed on
//! disk since this handle last saw it, so a `trust forget` from another
//! process reaches a running monitor. A sidecar `.lock` file (flock) keeps
//! that read-modify-write atomic across processes. A failed write is logged
//! and the in-memory map is kept; only a crash after that failure loses the
//! update.
//!
//! File format, keyed by volume serial as fixed-width uppercase hex:
//!
//! ```json
//! {
//!   "1A2B3C4D": {
//!     "sha256_hash": "...", "display_hash": "...",
//!     "decision": "allow", "first_seen": "...", "last_seen": "...",
//!     "seen_count": 3, "directive": { ... }, "environment": { ... }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use chrono::Utc;
use fs2::FileExt;
use tracing::{debug, info, warn};

use super::fingerprint::fingerprint;
use super::record::{Decision, TrustRecord};
use crate::device::{DeviceIdentity, VolumeSerial};
use crate::directive::Directive;

/// Outcome of [`TrustStore::resolve`].
#[derive(Debug, Clone)]
pub struct Resolution {
    pub decision: Decision,
    /// The stored record, or for `Unknown` a fresh unsaved record carrying
    /// the just-computed fingerprint. `None` when there is no directive.
    pub record: Option<TrustRecord>,
}

struct StoreState {
    path: PathBuf,
    records: BTreeMap<String, TrustRecord>,
    /// What the file looked like when `records` last matched it.
    stamp: Option<FileStamp>,
}

/// Identity of one version of the store file. Every save renames a fresh
/// file into place, so the inode changes even when size and mtime don't.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
    inode: u64,
}

impl FileStamp {
    fn of(path: &Path) -> Option<Self> {
        let meta = fs::metadata(path).ok()?;
        Some(Self {
            modified: meta.modified().ok(),
            len: meta.len(),
            inode: inode(&meta),
        })
    }
}

#[cfg(unix)]
fn inode(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode(_meta: &fs::Metadata) -> u64 {
    0
}

/// Map access for one operation: the in-process mutex plus, when the lock
/// file can be opened, the cross-process flock.
struct Locked<'a> {
    state: MutexGuard<'a, StoreState>,
    _file: Option<File>,
}

impl Deref for Locked<'_> {
    type Target = StoreState;

    fn deref(&self) -> &StoreState {
        &self.state
    }
}

impl DerefMut for Locked<'_> {
    fn deref_mut(&mut self) -> &mut StoreState {
        &mut self.state
    }
}

pub struct TrustStore {
    state: Mutex<StoreState>,
    rechallenge_on_change: bool,
}

impl TrustStore {
    /// Open the store at `path`. A missing, unreadable or unparseable file
    /// starts empty; individual malformed records are dropped.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stamp = FileStamp::of(&path);
        let records = load_records(&path);

        debug!(
            "Loaded trust store from {:?} ({} records)",
            path,
            records.len()
        );

        Self {
            state: Mutex::new(StoreState {
                path,
                records,
                stamp,
            }),
            rechallenge_on_change: false,
        }
    }

    /// Treat a remembered decision as `Unknown` when the directive's
    /// fingerprint no longer matches the one it was made for.
    pub fn with_rechallenge(mut self, enabled: bool) -> Self {
        self.rechallenge_on_change = enabled;
        self
    }

    pub fn path(&self) -> PathBuf {
        self.state().path.clone()
    }

    /// Resolve the current decision for a device presenting `directive`.
    ///
    /// - no directive: `Allow` with no record (nothing to run)
    /// - no record: `Unknown` with a fresh, unsaved record
    /// - `Allow`/`Deny`: returned after bumping `last_seen`/`seen_count`
    /// - `AllowOnce`/`DenyOnce`: returned once, then deleted
    ///
    /// Records are keyed by volume serial only. Unless rechallenge is
    /// enabled, a changed directive on an approved device is not re-asked.
    pub fn resolve(&self, identity: &DeviceIdentity, directive: Option<&Directive>) -> Resolution {
        let Some(directive) = directive else {
            return Resolution {
                decision: Decision::Allow,
                record: None,
            };
        };

        let key = identity.key();
        let mut state = self.lock();

        let Some(existing) = state.records.get_mut(&key) else {
            return Resolution {
                decision: Decision::Unknown,
                record: Some(TrustRecord::observed(directive)),
            };
        };

        existing.touch();
        let stored = existing.clone();

        match stored.decision {
            Decision::Allow | Decision::Deny => {
                if self.rechallenge_on_change && stored.fingerprint != fingerprint(directive) {
                    info!(
                        "Directive on {} changed since it was decided ({} -> {}), asking again",
                        key,
                        stored.fingerprint.display_hash,
                        fingerprint(directive).display_hash
                    );
                    state.persist();
                    let mut fresh = TrustRecord::observed(directive);
                    fresh.first_seen = stored.first_seen;
                    fresh.seen_count = stored.seen_count;
                    return Resolution {
                        decision: Decision::Unknown,
                        record: Some(fresh),
                    };
                }
                state.persist();
                Resolution {
                    decision: stored.decision,
                    record: Some(stored),
                }
            }
            Decision::AllowOnce | Decision::DenyOnce => {
                state.records.remove(&key);
                state.persist();
                debug!("Consumed one-shot decision {} for {}", stored.decision, key);
                Resolution {
                    decision: stored.decision,
                    record: Some(stored),
                }
            }
            Decision::Unknown => {
                // Never written by `record`; treat as absent.
                state.records.remove(&key);
                state.persist();
                Resolution {
                    decision: Decision::Unknown,
                    record: Some(TrustRecord::observed(directive)),
                }
            }
        }
    }

    /// Store `decision` for the device, snapshotting `directive`.
    /// Provenance (`first_seen`, `seen_count`) survives from any prior record.
    pub fn record(
        &self,
        identity: &DeviceIdentity,
        directive: &Directive,
        decision: Decision,
    ) -> TrustRecord {
        let key = identity.key();
        let mut state = self.lock();

        let mut record = TrustRecord::observed(directive);
        if let Some(prior) = state.records.get(&key) {
            record.first_seen = prior.first_seen;
            record.seen_count = prior.seen_count;
        }
        record.decision = decision;
        record.last_seen = Utc::now();

        state.records.insert(key.clone(), record.clone());
        state.persist();

        info!("Recorded decision {} for {}", decision, key);
        record
    }

    /// Remove one device's record. Returns whether a record existed.
    pub fn forget(&self, serial: VolumeSerial) -> bool {
        let mut state = self.lock();
        let removed = state.records.remove(&serial.key()).is_some();
        if removed {
            state.persist();
        }
        removed
    }

    /// Remove every record. Returns how many were removed.
    pub fn forget_all(&self) -> usize {
        let mut state = self.lock();
        let count = state.records.len();
        state.records.clear();
        state.persist();
        count
    }

    pub fn get(&self, serial: VolumeSerial) -> Option<TrustRecord> {
        self.lock().records.get(&serial.key()).cloned()
    }

    /// Consistent copy of all records.
    pub fn snapshot(&self) -> BTreeMap<String, TrustRecord> {
        self.lock().records.clone()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take both locks and pick up any change written by another handle.
    fn lock(&self) -> Locked<'_> {
        let mut state = self.state();
        let file = lock_file(&state.path);
        state.refresh();
        Locked { state, _file: file }
    }
}

impl StoreState {
    fn refresh(&mut self) {
        let current = FileStamp::of(&self.path);
        if current == self.stamp {
            return;
        }
        self.records = load_records(&self.path);
        self.stamp = current;
        debug!(
            "Reloaded trust store {} ({} records)",
            self.path.display(),
            self.records.len()
        );
    }

    /// Rewrite the backing file; failures are logged, not returned.
    fn persist(&mut self) {
        match save_records(&self.path, &self.records) {
            Ok(()) => self.stamp = FileStamp::of(&self.path),
            Err(e) => warn!(
                "Failed to write trust store {}: {} (keeping in-memory state)",
                self.path.display(),
                e
            ),
        }
    }
}

/// Exclusive flock on `<store>.lock`, released when the file is dropped.
/// `None` when the lock file can't be opened (e.g. no state dir yet).
fn lock_file(path: &Path) -> Option<File> {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");

    let file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(PathBuf::from(name))
        .ok()?;
    match file.lock_exclusive() {
        Ok(()) => Some(file),
        Err(e) => {
            warn!("Could not lock trust store {}: {}", path.display(), e);
            None
        }
    }
}

fn load_records(path: &Path) -> BTreeMap<String, TrustRecord> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            warn!("Error reading trust store {}: {}", path.display(), e);
            return BTreeMap::new();
        }
    };

    let raw: BTreeMap<String, serde_json::Value> = match serde_json::from_str(&content) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Error parsing trust store {}: {}", path.display(), e);
            return BTreeMap::new();
        }
    };

    raw.into_iter()
        .filter_map(|(key, value)| {
            let Some(serial) = VolumeSerial::parse(&key) else {
                warn!("Dropping trust record with malformed key {:?}", key);
                return None;
            };
            match serde_json::from_value::<TrustRecord>(value) {
                Ok(record) => Some((serial.key(), record)),
                Err(e) => {
                    warn!("Dropping malformed trust record {}: {}", key, e);
                    None
                }
            }
        })
        .collect()
}

fn save_records(path: &Path, records: &BTreeMap<String, TrustRecord>) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(records)?;

    // Write to a unique temp file then atomically rename
    let tmp_path = path.with_extension(format!(
        "{}.{}.tmp",
        std::process::id(),
        uuid::Uuid::new_v4().as_simple()
    ));

    fs::write(&tmp_path, &content)?;
    fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;
    use std::sync::Arc;

    fn directive(program: &str) -> Directive {
        Directive {
            program: program.to_string(),
            work_dir: String::new(),
            isolate: false,
            environment: Map::new(),
        }
    }

    fn device(serial: u32) -> DeviceIdentity {
        DeviceIdentity::new(VolumeSerial(serial), format!("/media/dev{}", serial))
    }

    fn store_in(dir: &Path) -> TrustStore {
        TrustStore::open(dir.join("trust_store.json"))
    }

    #[test]
    fn no_directive_is_allowed_without_a_record() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());

        let res = store.resolve(&device(1), None);
        assert_eq!(res.decision, Decision::Allow);
        assert!(res.record.is_none());
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn unseen_device_is_unknown_with_fresh_record() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let d = directive("run.sh");

        let res = store.resolve(&device(1), Some(&d));
        assert_eq!(res.decision, Decision::Unknown);
        let record = res.record.unwrap();
        assert_eq!(record.seen_count, 1);
        assert_eq!(record.fingerprint, fingerprint(&d));
        // not persisted until a decision is recorded
        assert!(store.get(VolumeSerial(1)).is_none());
    }

    #[test]
    fn allow_once_is_consumed_after_one_read() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let d = directive("run.sh");

        store.record(&device(2), &d, Decision::AllowOnce);

        assert_eq!(store.resolve(&device(2), Some(&d)).decision, Decision::AllowOnce);
        assert_eq!(store.resolve(&device(2), Some(&d)).decision, Decision::Unknown);
    }

    #[test]
    fn deny_once_is_consumed_after_one_read() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let d = directive("run.sh");

        store.record(&device(2), &d, Decision::DenyOnce);

        assert_eq!(store.resolve(&device(2), Some(&d)).decision, Decision::DenyOnce);
        assert_eq!(store.resolve(&device(2), Some(&d)).decision, Decision::Unknown);
    }

    #[test]
    fn persistent_allow_counts_every_presentation() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let d = directive("run.sh");

        store.record(&device(3), &d, Decision::Allow);

        let mut last = 0;
        for _ in 0..5 {
            let res = store.resolve(&device(3), Some(&d));
            assert_eq!(res.decision, Decision::Allow);
            let count = res.record.unwrap().seen_count;
            assert!(count > last, "{} should exceed {}", count, last);
            last = count;
        }
    }

    #[test]
    fn deny_updates_last_seen() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let d = directive("run.sh");

        let recorded = store.record(&device(4), &d, Decision::Deny);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let res = store.resolve(&device(4), Some(&d));

        assert_eq!(res.decision, Decision::Deny);
        assert!(res.record.unwrap().last_seen > recorded.last_seen);
    }

    #[test]
    fn changed_directive_keeps_decision_by_default() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());

        store.record(&device(5), &directive("old.sh"), Decision::Allow);
        let res = store.resolve(&device(5), Some(&directive("new.sh")));

        assert_eq!(res.decision, Decision::Allow);
    }

    #[test]
    fn changed_directive_is_rechallenged_when_enabled() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path()).with_rechallenge(true);

        store.record(&device(5), &directive("old.sh"), Decision::Allow);
        let unchanged = store.resolve(&device(5), Some(&directive("old.sh")));
        assert_eq!(unchanged.decision, Decision::Allow);

        let changed = store.resolve(&device(5), Some(&directive("new.sh")));
        assert_eq!(changed.decision, Decision::Unknown);
        let record = changed.record.unwrap();
        assert_eq!(record.fingerprint, fingerprint(&directive("new.sh")));
        assert!(record.seen_count >= 2);
    }

    #[test]
    fn decisions_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let d = directive("run.sh");
        {
            let store = store_in(tmp.path());
            store.record(&device(6), &d, Decision::Deny);
        }

        let reopened = store_in(tmp.path());
        assert_eq!(reopened.resolve(&device(6), Some(&d)).decision, Decision::Deny);

        let content = fs::read_to_string(tmp.path().join("trust_store.json")).unwrap();
        assert!(content.contains("\"00000006\""));
    }

    #[test]
    fn deleting_the_file_externally_reverts_to_unknown() {
        let tmp = tempfile::tempdir().unwrap();
        let d = directive("run.sh");
        let store = store_in(tmp.path());
        store.record(&device(7), &d, Decision::Allow);

        fs::remove_file(tmp.path().join("trust_store.json")).unwrap();
        assert_eq!(store.resolve(&device(7), Some(&d)).decision, Decision::Unknown);
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn forget_from_another_handle_is_not_resurrected() {
        let tmp = tempfile::tempdir().unwrap();
        let d = directive("run.sh");
        let monitor = store_in(tmp.path());
        let admin = store_in(tmp.path());

        monitor.record(&device(1), &d, Decision::Allow);
        assert!(admin.forget(VolumeSerial(1)));

        assert_eq!(monitor.resolve(&device(1), Some(&d)).decision, Decision::Unknown);
        monitor.record(&device(2), &d, Decision::Deny);

        let on_disk = store_in(tmp.path());
        assert!(on_disk.get(VolumeSerial(1)).is_none());
        assert_eq!(on_disk.get(VolumeSerial(2)).unwrap().decision, Decision::Deny);
    }

    #[test]
    fn clear_from_another_handle_reaches_running_store() {
        let tmp = tempfile::tempdir().unwrap();
        let d = directive("run.sh");
        let monitor = store_in(tmp.path());
        monitor.record(&device(3), &d, Decision::Allow);
        monitor.record(&device(4), &d, Decision::Deny);

        let admin = store_in(tmp.path());
        assert_eq!(admin.forget_all(), 2);

        assert!(monitor.snapshot().is_empty());
        // and records written by another handle show up too
        admin.record(&device(5), &d, Decision::Allow);
        assert_eq!(monitor.resolve(&device(5), Some(&d)).decision, Decision::Allow);
    }

    #[test]
    fn malformed_records_fail_open_to_unknown() {
        let tmp = tempfile::tempdir().unwrap();
        let d = directive("run.sh");
        let good = {
            let store = store_in(tmp.path());
            store.record(&device(8), &d, Decision::Allow)
        };

        let mut raw: Map<String, serde_json::Value> = Map::new();
        raw.insert("00000008".into(), serde_json::to_value(&good).unwrap());
        raw.insert("00000009".into(), serde_json::json!({"decision": "allow"}));
        raw.insert("not-hex".into(), serde_json::to_value(&good).unwrap());
        fs::write(
            tmp.path().join("trust_store.json"),
            serde_json::to_string(&raw).unwrap(),
        )
        .unwrap();

        let store = store_in(tmp.path());
        assert_eq!(store.snapshot().len(), 1);
        assert_eq!(store.resolve(&device(9), Some(&d)).decision, Decision::Unknown);
        assert_eq!(store.resolve(&device(8), Some(&d)).decision, Decision::Allow);
    }

    #[test]
    fn unparseable_file_starts_empty() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("trust_store.json"), "{ not json").unwrap();

        let store = store_in(tmp.path());
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn unwritable_location_keeps_in_memory_state() {
        let tmp = tempfile::tempdir().unwrap();
        // parent "directory" is a regular file, so every write fails
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, "").unwrap();
        let store = TrustStore::open(blocker.join("trust_store.json"));
        let d = directive("run.sh");

        store.record(&device(10), &d, Decision::Allow);
        assert_eq!(store.resolve(&device(10), Some(&d)).decision, Decision::Allow);
    }

    #[test]
    fn forget_and_forget_all() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let d = directive("run.sh");
        store.record(&device(11), &d, Decision::Allow);
        store.record(&device(12), &d, Decision::Deny);

        assert!(store.forget(VolumeSerial(11)));
        assert!(!store.forget(VolumeSerial(11)));
        assert_eq!(store.resolve(&device(11), Some(&d)).decision, Decision::Unknown);

        assert_eq!(store.forget_all(), 1);
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn record_preserves_provenance() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let d = directive("run.sh");

        let first = store.record(&device(13), &d, Decision::Allow);
        store.resolve(&device(13), Some(&d));
        store.resolve(&device(13), Some(&d));
        let second = store.record(&device(13), &d, Decision::Deny);

        assert_eq!(second.first_seen, first.first_seen);
        assert_eq!(second.seen_count, 3);
        assert_eq!(second.decision, Decision::Deny);
    }

    #[test]
    fn concurrent_records_for_different_devices_are_all_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(tmp.path()));

        let handles: Vec<_> = (0..8u32)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store.record(&device(100 + i), &directive("run.sh"), Decision::Allow);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let reopened = store_in(tmp.path());
        assert_eq!(reopened.snapshot().len(), 8);
    }

    #[test]
    fn save_leaves_no_tmp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store.record(&device(14), &directive("run.sh"), Decision::Allow);

        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty(), "found: {:?}", leftovers);
    }
}

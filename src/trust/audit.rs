//! Append-only, hash-chained decision audit log.
//!
//! Stored at `<state_dir>/autorun.audit.jsonl`, one JSON object per line.
//! Each entry carries the SHA-256 of the previous raw line, so an edited
//! or truncated history shows up as a broken link.
//!
//! | Field | Description |
//! |-------|-------------|
//! | `ts` | RFC 3339 timestamp |
//! | `action` | `decision_recorded`, `launched`, `denied`, ... |
//! | `device` | Trust store key (`%08X` volume serial) |
//! | `fingerprint` | Directive SHA-256 at the time (empty if N/A) |
//! | `prev_entry_sha256` | SHA-256 of the previous JSONL line |
//! | `source` | `monitor`, `cli`, `prompt`, ... |
//!
//! The first entry links to 64 zeros. Audit failures never abort a flow;
//! [`AuditLog::record`] logs them and carries on.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use super::fingerprint::hex_encode;

/// Link used by the first entry in the chain (no predecessor).
const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: String,
    pub action: AuditAction,
    pub device: String,
    pub fingerprint: String,
    pub prev_entry_sha256: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A human or policy decision was stored for a device.
    DecisionRecorded,
    /// An approved directive's program was started.
    Launched,
    /// An approved directive's program could not be started.
    LaunchFailed,
    /// A directive was refused.
    Denied,
    /// An operator removed one device's record.
    Forgotten,
    /// An operator removed all records.
    Cleared,
    /// Previous entry corrupted, new chain segment started.
    ChainRecovery,
}

/// Event fields supplied by callers; the log fills in time and chain link.
#[derive(Debug, Clone)]
pub struct AuditEvent<'a> {
    pub action: AuditAction,
    pub device: &'a str,
    pub fingerprint: &'a str,
    pub source: &'a str,
    pub detail: Option<String>,
}

/// Handle to the audit log file. Appends are serialized in-process.
pub struct AuditLog {
    path: PathBuf,
    enabled: bool,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: PathBuf, enabled: bool) -> Self {
        Self {
            path,
            enabled,
            write_lock: Mutex::new(()),
        }
    }

    /// A log that records nothing.
    pub fn disabled() -> Self {
        Self::new(PathBuf::new(), false)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry; failures are logged, never returned.
    pub fn record(&self, event: AuditEvent<'_>) {
        if !self.enabled {
            return;
        }
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = append_audit_entry(&self.path, event) {
            warn!("Audit log write to {} failed: {:#}", self.path.display(), e);
        }
    }
}

/// Append a new entry to the audit log at `path`.
///
/// If the last existing line is not valid JSON, a `ChainRecovery` entry is
/// written first to mark the break.
pub fn append_audit_entry(path: &Path, event: AuditEvent<'_>) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).context("Failed to create audit log directory")?;
    }

    let prev_hash = if path.exists() {
        let content = fs::read_to_string(path).context("Failed to read audit log")?;
        match content.lines().last() {
            Some(last_line) if !last_line.is_empty() => {
                if serde_json::from_str::<AuditEntry>(last_line).is_ok() {
                    sha256_hex(last_line.as_bytes())
                } else {
                    let recovery = AuditEntry {
                        ts: chrono::Utc::now().to_rfc3339(),
                        action: AuditAction::ChainRecovery,
                        device: String::new(),
                        fingerprint: String::new(),
                        prev_entry_sha256: sha256_hex(last_line.as_bytes()),
                        source: "audit_system".to_string(),
                        detail: Some(format!(
                            "Previous entry corrupted ({} bytes), new chain segment",
                            last_line.len()
                        )),
                    };
                    let recovery_json = serde_json::to_string(&recovery)
                        .context("Failed to serialize recovery entry")?;
                    append_line(path, &recovery_json)?;
                    sha256_hex(recovery_json.as_bytes())
                }
            }
            _ => GENESIS_HASH.to_string(),
        }
    } else {
        GENESIS_HASH.to_string()
    };

    let entry = AuditEntry {
        ts: chrono::Utc::now().to_rfc3339(),
        action: event.action,
        device: event.device.to_string(),
        fingerprint: event.fingerprint.to_string(),
        prev_entry_sha256: prev_hash,
        source: event.source.to_string(),
        detail: event.detail,
    };

    let json = serde_json::to_string(&entry).context("Failed to serialize audit entry")?;
    append_line(path, &json)
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context("Failed to open audit log")?;
    writeln!(file, "{}", line).context("Failed to write audit entry")?;
    Ok(())
}

/// Read all parseable entries. Corrupted lines are skipped.
pub fn read_audit_log(path: &Path) -> Result<Vec<AuditEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path).context("Failed to read audit log")?;
    Ok(content
        .lines()
        .filter(|l| !l.is_empty())
        .filter_map(|l| serde_json::from_str::<AuditEntry>(l).ok())
        .collect())
}

/// Indices of lines whose chain link does not match the previous line.
/// Corrupted (non-JSON) lines are reported as broken. Empty means intact.
pub fn verify_audit_chain(path: &Path) -> Result<Vec<usize>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path).context("Failed to read audit log")?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();

    let mut broken = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let Ok(entry) = serde_json::from_str::<AuditEntry>(line) else {
            broken.push(i);
            continue;
        };
        let expected = if i == 0 {
            GENESIS_HASH.to_string()
        } else {
            sha256_hex(lines[i - 1].as_bytes())
        };
        if entry.prev_entry_sha256 != expected {
            broken.push(i);
        }
    }

    Ok(broken)
}

fn sha256_hex(data: &[u8]) -> String {
    hex_encode(&Sha256::digest(data))
}

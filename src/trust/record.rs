use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::fingerprint::{ConfigFingerprint, fingerprint};
use crate::directive::Directive;

/// Remembered or one-shot verdict for a device.
///
/// `Unknown → {Allow, AllowOnce, Deny, DenyOnce}` through an approval step.
/// One-shot variants are consumed (deleted) the next time they are read;
/// `Allow`/`Deny` persist until an operator clears them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    #[default]
    Unknown,
    Allow,
    AllowOnce,
    Deny,
    DenyOnce,
}

impl Decision {
    pub fn is_allow(self) -> bool {
        matches!(self, Decision::Allow | Decision::AllowOnce)
    }

    pub fn is_one_shot(self) -> bool {
        matches!(self, Decision::AllowOnce | Decision::DenyOnce)
    }

    /// Map an approval answer to a decision; `remember = false` yields the
    /// one-shot variant.
    pub fn from_answer(allow: bool, remember: bool) -> Self {
        match (allow, remember) {
            (true, true) => Decision::Allow,
            (true, false) => Decision::AllowOnce,
            (false, true) => Decision::Deny,
            (false, false) => Decision::DenyOnce,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Unknown => "Unknown",
            Decision::Allow => "Allow",
            Decision::AllowOnce => "Allow Once",
            Decision::Deny => "Deny",
            Decision::DenyOnce => "Deny Once",
        };
        f.write_str(s)
    }
}

/// Persisted per-device trust state.
///
/// `directive` and `environment` are a snapshot taken when the record was
/// built, kept for audit and display. They are never re-evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustRecord {
    #[serde(flatten)]
    pub fingerprint: ConfigFingerprint,
    pub decision: Decision,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub seen_count: u64,
    pub directive: Directive,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl TrustRecord {
    /// A first-observation record with an undecided verdict.
    pub fn observed(directive: &Directive) -> Self {
        let now = Utc::now();
        Self {
            fingerprint: fingerprint(directive),
            decision: Decision::Unknown,
            first_seen: now,
            last_seen: now,
            seen_count: 1,
            directive: directive.clone(),
            environment: directive.environment.clone(),
        }
    }

    /// Bump freshness bookkeeping for another presentation.
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
        self.seen_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answer_mapping() {
        assert_eq!(Decision::from_answer(true, true), Decision::Allow);
        assert_eq!(Decision::from_answer(true, false), Decision::AllowOnce);
        assert_eq!(Decision::from_answer(false, true), Decision::Deny);
        assert_eq!(Decision::from_answer(false, false), Decision::DenyOnce);
    }

    #[test]
    fn classification() {
        assert!(Decision::AllowOnce.is_allow() && Decision::AllowOnce.is_one_shot());
        assert!(!Decision::Deny.is_allow() && !Decision::Deny.is_one_shot());
        assert!(Decision::DenyOnce.is_one_shot());
        assert!(!Decision::Unknown.is_allow() && !Decision::Unknown.is_one_shot());
    }

    #[test]
    fn decisions_serialize_snake_case() {
        let json = serde_json::to_string(&Decision::AllowOnce).unwrap();
        assert_eq!(json, "\"allow_once\"");
        assert_eq!(Decision::DenyOnce.to_string(), "Deny Once");
    }

    #[test]
    fn record_flattens_fingerprint() {
        let record = TrustRecord::observed(&Directive {
            program: "run.sh".to_string(),
            ..Directive::default()
        });
        let json = serde_json::to_value(&record).unwrap();

        assert!(json.get("sha256_hash").is_some());
        assert!(json.get("display_hash").is_some());
        assert_eq!(json["seen_count"], 1);
        assert_eq!(json["decision"], "unknown");
    }
}

//! Deterministic content hash of a directive.
//!
//! The canonical form is a JSON object with a fixed key set. `serde_json`
//! objects are key-sorted, and the environment map is a `BTreeMap`, so
//! insertion order never reaches the digest. The program reference is
//! hashed verbatim: `./run.sh` and `run.sh` are different directives.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::directive::Directive;

/// Length of the display digest in hex characters.
const DISPLAY_LEN: usize = 16;

/// Digest pair over a directive's canonical content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigFingerprint {
    /// Hex SHA-256, used for identity and equality.
    pub sha256_hash: String,
    /// Short hex digest shown in approval prompts.
    pub display_hash: String,
}

/// Canonical byte serialization of the decision-relevant fields.
fn canonical(directive: &Directive) -> String {
    serde_json::json!({
        "autorun": directive.program,
        "workdir": directive.work_dir,
        "isolate": directive.isolate,
        "environment": directive.environment,
    })
    .to_string()
}

/// Compute the fingerprint of a directive. Pure and deterministic.
pub fn fingerprint(directive: &Directive) -> ConfigFingerprint {
    let digest = hex_encode(&Sha256::digest(canonical(directive).as_bytes()));
    let display_hash = digest[..DISPLAY_LEN].to_string();

    ConfigFingerprint {
        sha256_hash: digest,
        display_hash,
    }
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

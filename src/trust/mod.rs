//! Per-device trust: fingerprints, remembered decisions, approval prompts
//! and the decision audit trail.

pub mod audit;
mod fingerprint;
pub mod prompt;
mod record;
mod store;

pub use audit::{AuditAction, AuditEvent, AuditLog};
pub use fingerprint::{ConfigFingerprint, fingerprint};
pub use prompt::{ApprovalPrompt, PendingApproval, PolicyPrompt, PromptOutcome, TerminalPrompt};
pub use record::{Decision, TrustRecord};
pub use store::{Resolution, TrustStore};

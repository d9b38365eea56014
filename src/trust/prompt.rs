//! Approval prompts for devices without a remembered decision.

use anyhow::Result;
use async_trait::async_trait;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::record::{Decision, TrustRecord};
use crate::device::DeviceIdentity;

/// Everything shown to the person approving a directive.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub identity: DeviceIdentity,
    /// In-progress record: fingerprint, display digest, directive snapshot.
    pub record: TrustRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptOutcome {
    pub allow: bool,
    pub remember: bool,
}

impl PromptOutcome {
    pub const DENY_ONCE: Self = Self {
        allow: false,
        remember: false,
    };

    pub fn into_decision(self) -> Decision {
        Decision::from_answer(self.allow, self.remember)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ApprovalPrompt: Send + Sync {
    /// Ask whether the pending directive may run. May wait indefinitely.
    async fn ask(&self, pending: PendingApproval) -> Result<PromptOutcome>;
}

/// Interactive prompt on the controlling terminal.
pub struct TerminalPrompt {
    // One question on screen at a time
    terminal: Arc<Mutex<()>>,
}

impl TerminalPrompt {
    pub fn new() -> Self {
        Self {
            terminal: Arc::new(Mutex::new(())),
        }
    }
}

impl Default for TerminalPrompt {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApprovalPrompt for TerminalPrompt {
    async fn ask(&self, pending: PendingApproval) -> Result<PromptOutcome> {
        let _turn = self.terminal.lock().await;
        let outcome = tokio::task::spawn_blocking(move || ask_on_terminal(&pending)).await??;
        Ok(outcome)
    }
}

fn ask_on_terminal(pending: &PendingApproval) -> Result<PromptOutcome> {
    println!("\n{}", describe(pending));
    println!("  [a] allow once   [A] always allow   [d] deny once   [D] always deny");

    let mut rl = DefaultEditor::new()?;
    loop {
        let line = match rl.readline("Choice: ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                println!("No answer, denying once.");
                return Ok(PromptOutcome::DENY_ONCE);
            }
            Err(err) => {
                warn!("Prompt input failed: {}", err);
                return Ok(PromptOutcome::DENY_ONCE);
            }
        };

        match parse_choice(&line) {
            Some(outcome) => return Ok(outcome),
            None => println!("Please answer a, A, d or D."),
        }
    }
}

/// Human-readable summary of a pending directive.
pub fn describe(pending: &PendingApproval) -> String {
    let directive = &pending.record.directive;
    let mut text = format!(
        "Autorun request from {}\n  fingerprint: {}\n  program:     {}\n  work dir:    {}\n  isolated:    {}",
        pending.identity,
        pending.record.fingerprint.display_hash,
        directive.program,
        if directive.work_dir.is_empty() {
            "(device root)"
        } else {
            directive.work_dir.as_str()
        },
        if directive.isolate { "yes" } else { "no" },
    );
    if !directive.environment.is_empty() {
        text.push_str("\n  environment:");
        for (key, value) in &directive.environment {
            text.push_str(&format!("\n    {}={}", key, value));
        }
    }
    text
}

/// Case decides persistence: lowercase is one-shot, uppercase remembered.
fn parse_choice(input: &str) -> Option<PromptOutcome> {
    match input.trim() {
        "a" => Some(PromptOutcome {
            allow: true,
            remember: false,
        }),
        "A" => Some(PromptOutcome {
            allow: true,
            remember: true,
        }),
        "d" => Some(PromptOutcome::DENY_ONCE),
        "D" => Some(PromptOutcome {
            allow: false,
            remember: true,
        }),
        _ => None,
    }
}

/// Fixed answer for headless operation.
///
/// The answer is one-shot, so it is stored as `AllowOnce`/`DenyOnce` and
/// the next presentation of the same device consumes it without asking.
/// Only the presentation after that reaches a prompt again.
pub struct PolicyPrompt {
    allow: bool,
}

impl PolicyPrompt {
    pub fn new(allow: bool) -> Self {
        Self { allow }
    }
}

#[async_trait]
impl ApprovalPrompt for PolicyPrompt {
    async fn ask(&self, pending: PendingApproval) -> Result<PromptOutcome> {
        debug!(
            "Headless policy {} for {}",
            if self.allow { "allows" } else { "denies" },
            pending.identity
        );
        Ok(PromptOutcome {
            allow: self.allow,
            remember: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::VolumeSerial;
    use crate::directive::Directive;

    fn pending() -> PendingApproval {
        let mut directive = Directive {
            program: "setup.sh".to_string(),
            ..Directive::default()
        };
        directive.environment.insert("MODE".into(), "demo".into());
        PendingApproval {
            identity: DeviceIdentity::new(VolumeSerial(0x1234), "/media/usb"),
            record: TrustRecord::observed(&directive),
        }
    }

    #[test]
    fn choices_map_to_decisions() {
        let decide = |s| parse_choice(s).map(PromptOutcome::into_decision);
        assert_eq!(decide("a"), Some(Decision::AllowOnce));
        assert_eq!(decide("A"), Some(Decision::Allow));
        assert_eq!(decide(" d\n"), Some(Decision::DenyOnce));
        assert_eq!(decide("D"), Some(Decision::Deny));
        assert_eq!(decide("yes"), None);
        assert_eq!(decide(""), None);
    }

    #[test]
    fn description_shows_digest_and_overrides() {
        let p = pending();
        let text = describe(&p);
        assert!(text.contains(&p.record.fingerprint.display_hash));
        assert!(text.contains("setup.sh"));
        assert!(text.contains("(device root)"));
        assert!(text.contains("MODE=demo"));
        assert!(text.contains("00001234"));
    }

    #[tokio::test]
    async fn policy_prompt_is_never_remembered() {
        let allow = PolicyPrompt::new(true).ask(pending()).await.unwrap();
        assert_eq!(allow.into_decision(), Decision::AllowOnce);

        let deny = PolicyPrompt::new(false).ask(pending()).await.unwrap();
        assert_eq!(deny.into_decision(), Decision::DenyOnce);
    }
}

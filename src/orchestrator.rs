//! Execution orchestrator: one flow per attach event.
//!
//! `attach → directive → decision → [prompt → record] → profile → launch →
//! wait`. A flow holds a per-device claim for its whole duration, so a
//! second attach of the same device while the first is still prompting or
//! running is dropped instead of prompting again. Flows for different
//! devices are independent.

use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::concurrency::SingleFlight;
use crate::device::{DeviceIdentity, VolumeSerial};
use crate::directive::{Directive, load_directive};
use crate::sandbox::{IsolationBuilder, LaunchSpec, ProcessLauncher, exit_code_of};
use crate::trust::{
    ApprovalPrompt, AuditAction, AuditEvent, AuditLog, Decision, PendingApproval, TrustRecord,
    TrustStore,
};

/// How a flow ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOutcome {
    /// Another flow for the same device is still running.
    Skipped,
    /// Nothing to run on this device.
    NoDirective,
    /// Refused, by a stored decision or just now.
    Denied(Decision),
    /// The program ran; `exit_code` is `None` if it could not be collected.
    Completed {
        decision: Decision,
        exit_code: Option<i32>,
        confined: bool,
    },
    /// Approved, but the process could not be started.
    LaunchFailed(String),
    /// Stopped before a launch decision took effect (bad directive,
    /// prompt failure, isolation setup failure).
    Aborted(String),
}

pub struct Orchestrator {
    trust: Arc<TrustStore>,
    prompt: Arc<dyn ApprovalPrompt>,
    launcher: Arc<dyn ProcessLauncher>,
    isolation: Arc<IsolationBuilder>,
    audit: Arc<AuditLog>,
    refresh: Arc<Notify>,
    inflight: SingleFlight<VolumeSerial>,
    source: &'static str,
}

impl Orchestrator {
    pub fn new(
        trust: Arc<TrustStore>,
        prompt: Arc<dyn ApprovalPrompt>,
        launcher: Arc<dyn ProcessLauncher>,
        isolation: Arc<IsolationBuilder>,
    ) -> Self {
        Self {
            trust,
            prompt,
            launcher,
            isolation,
            audit: Arc::new(AuditLog::disabled()),
            refresh: Arc::new(Notify::new()),
            inflight: SingleFlight::new(),
            source: "monitor",
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    /// Label written to the audit log for decisions made by this instance.
    pub fn with_source(mut self, source: &'static str) -> Self {
        self.source = source;
        self
    }

    /// Signalled once at the end of every flow. Signals coalesce.
    pub fn refresh_signal(&self) -> Arc<Notify> {
        self.refresh.clone()
    }

    pub async fn handle_attach(&self, identity: DeviceIdentity) -> FlowOutcome {
        self.handle_attach_with_args(identity, Vec::new()).await
    }

    /// Run the full flow for one device, passing `args` to the program.
    pub async fn handle_attach_with_args(
        &self,
        identity: DeviceIdentity,
        args: Vec<String>,
    ) -> FlowOutcome {
        let Some(_claim) = self.inflight.try_begin(identity.serial) else {
            info!("Flow for {} already in progress, ignoring attach", identity);
            return FlowOutcome::Skipped;
        };

        let outcome = self.evaluate(&identity, args).await;
        debug!("Flow for {} finished: {:?}", identity, outcome);
        self.refresh.notify_one();
        outcome
    }

    async fn evaluate(&self, identity: &DeviceIdentity, args: Vec<String>) -> FlowOutcome {
        let root = identity.root().to_path_buf();

        let loaded = tokio::task::spawn_blocking(move || load_directive(&root)).await;
        let directive = match loaded {
            Ok(Ok(Some(directive))) => directive,
            Ok(Ok(None)) => return FlowOutcome::NoDirective,
            Ok(Err(e)) => {
                warn!("Ignoring {}: {}", identity, e);
                return FlowOutcome::Aborted(e.to_string());
            }
            Err(e) => {
                error!("Directive task for {} failed: {}", identity, e);
                return FlowOutcome::Aborted(e.to_string());
            }
        };

        let resolved = {
            let trust = self.trust.clone();
            let identity = identity.clone();
            let directive = directive.clone();
            tokio::task::spawn_blocking(move || trust.resolve(&identity, Some(&directive))).await
        };
        let resolution = match resolved {
            Ok(resolution) => resolution,
            Err(e) => {
                error!("Trust lookup for {} failed: {}", identity, e);
                return FlowOutcome::Aborted(e.to_string());
            }
        };
        let record = resolution
            .record
            .unwrap_or_else(|| TrustRecord::observed(&directive));

        let decision = match resolution.decision {
            Decision::Unknown => match self.ask(identity, &directive, record.clone()).await {
                Some(decision) => decision,
                None => return FlowOutcome::Aborted("approval prompt failed".to_string()),
            },
            decision if decision.is_one_shot() => {
                info!("Using one-shot decision {} for {}", decision, identity);
                decision
            }
            decision => {
                debug!("Stored decision for {}: {}", identity, decision);
                decision
            }
        };

        if !decision.is_allow() {
            info!("Not running {} on {}: {}", directive.program, identity, decision);
            self.audit(AuditAction::Denied, identity, &record, Some(decision.to_string()));
            return FlowOutcome::Denied(decision);
        }

        self.launch(identity, &directive, &record, decision, args).await
    }

    /// Prompt for an unknown device and persist the answer.
    async fn ask(
        &self,
        identity: &DeviceIdentity,
        directive: &Directive,
        record: TrustRecord,
    ) -> Option<Decision> {
        let pending = PendingApproval {
            identity: identity.clone(),
            record,
        };
        let outcome = match self.prompt.ask(pending).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Approval prompt for {} failed: {:#}", identity, e);
                return None;
            }
        };

        let decision = outcome.into_decision();
        let recorded = {
            let trust = self.trust.clone();
            let identity = identity.clone();
            let directive = directive.clone();
            tokio::task::spawn_blocking(move || trust.record(&identity, &directive, decision))
                .await
        };
        let stored = match recorded {
            Ok(stored) => stored,
            Err(e) => {
                error!("Recording decision for {} failed: {}", identity, e);
                return None;
            }
        };
        self.audit(
            AuditAction::DecisionRecorded,
            identity,
            &stored,
            Some(decision.to_string()),
        );
        Some(decision)
    }

    async fn launch(
        &self,
        identity: &DeviceIdentity,
        directive: &Directive,
        record: &TrustRecord,
        decision: Decision,
        args: Vec<String>,
    ) -> FlowOutcome {
        let root = identity.root().to_path_buf();
        let expanded = directive.expand(&root);

        let built = {
            let isolation = self.isolation.clone();
            let root = root.clone();
            let expanded = expanded.clone();
            tokio::task::spawn_blocking(move || isolation.build(&root, &expanded)).await
        };
        let profile = match built {
            Ok(Ok(profile)) => profile,
            Ok(Err(e)) => {
                error!("Cannot prepare isolation for {}: {}", identity, e);
                self.audit(AuditAction::LaunchFailed, identity, record, Some(e.to_string()));
                return FlowOutcome::Aborted(e.to_string());
            }
            Err(e) => {
                error!("Isolation task for {} failed: {}", identity, e);
                return FlowOutcome::Aborted(e.to_string());
            }
        };

        let spec = LaunchSpec::new(expanded.program_path(&root)).with_args(args);
        info!(
            "Launching {} from {} (cwd {})",
            spec.program.display(),
            identity,
            profile.working_dir.display()
        );

        let launcher = self.launcher.clone();
        let launched = tokio::task::spawn_blocking(move || launcher.launch(&spec, &profile)).await;

        let mut process = match launched {
            Ok(Ok(process)) => process,
            Ok(Err(e)) => {
                error!("Launch failed for {}: {}", identity, e);
                self.audit(AuditAction::LaunchFailed, identity, record, Some(e.to_string()));
                return FlowOutcome::LaunchFailed(e.to_string());
            }
            Err(e) => {
                error!("Launch task for {} failed: {}", identity, e);
                return FlowOutcome::LaunchFailed(e.to_string());
            }
        };

        let confined = process.is_confined();
        self.audit(
            AuditAction::Launched,
            identity,
            record,
            Some(format!(
                "pid {}{}",
                process.pid(),
                if confined { ", confined" } else { "" }
            )),
        );

        let waited = tokio::task::spawn_blocking(move || {
            let status = process.wait();
            process.release();
            status
        })
        .await;

        let exit_code = match waited {
            Ok(Ok(status)) => Some(exit_code_of(status)),
            Ok(Err(e)) => {
                warn!("Could not wait for process from {}: {}", identity, e);
                None
            }
            Err(e) => {
                warn!("Wait task for {} failed: {}", identity, e);
                None
            }
        };

        match exit_code {
            Some(0) => info!("Program from {} exited successfully", identity),
            Some(code) => warn!("Program from {} exited with code {}", identity, code),
            None => {}
        }

        FlowOutcome::Completed {
            decision,
            exit_code,
            confined,
        }
    }

    fn audit(
        &self,
        action: AuditAction,
        identity: &DeviceIdentity,
        record: &TrustRecord,
        detail: Option<String>,
    ) {
        let device = identity.key();
        self.audit.record(AuditEvent {
            action,
            device: &device,
            fingerprint: &record.fingerprint.display_hash,
            source: self.source,
            detail,
        });
    }
}
